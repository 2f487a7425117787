//! Assistant process discovery via `/proc`.
//!
//! One scan enumerates processes whose command line matches the assistant
//! CLI invocation, collecting pid, the `--resume` id, CPU and RSS figures,
//! and — from a single file-handle listing per pid — the session id the
//! process holds open under its tasks directory, plus its working
//! directory.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    /// UUID following `--resume` on the command line, when present.
    pub resume_id: Option<String>,
    /// Session id recovered from an open tasks-directory handle.
    pub session_id: Option<String>,
    pub cwd: Option<PathBuf>,
    pub cpu_percent: Option<f64>,
    pub mem_mb: Option<f64>,
}

/// Scan the process table for commands matching `pattern`.
pub fn scan(pattern: &str) -> Vec<ProcessInfo> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let proc_dir = entry.path();
        let Some(argv) = read_cmdline(&proc_dir) else {
            continue;
        };
        if !matches_invocation(&argv, pattern) {
            continue;
        }

        let (cpu_percent, mem_mb) = read_usage(&proc_dir);
        let mut info = ProcessInfo {
            pid,
            resume_id: extract_resume_id(&argv),
            session_id: None,
            cwd: std::fs::read_link(proc_dir.join("cwd")).ok(),
            cpu_percent,
            mem_mb,
        };
        // Second pass enrichment: one fd listing per pid.
        info.session_id = session_id_from_fds(&proc_dir);
        found.push(info);
    }
    found
}

fn read_cmdline(proc_dir: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read(proc_dir.join("cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).to_string())
            .collect(),
    )
}

/// The invocation matches when the executable's basename equals the
/// pattern, or an interpreter is running a script of that name.
pub fn matches_invocation(argv: &[String], pattern: &str) -> bool {
    argv.iter().take(2).any(|arg| {
        Path::new(arg)
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n == pattern)
            .unwrap_or(false)
    })
}

/// The UUID following `--resume` (either as the next argument or inline
/// `--resume=<id>`).
pub fn extract_resume_id(argv: &[String]) -> Option<String> {
    for (i, arg) in argv.iter().enumerate() {
        if arg == "--resume" || arg == "-r" {
            let candidate = argv.get(i + 1)?;
            if looks_like_uuid(candidate) {
                return Some(candidate.clone());
            }
            return None;
        }
        if let Some(value) = arg.strip_prefix("--resume=") {
            if looks_like_uuid(value) {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub fn looks_like_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    s.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}

/// Extract the session id from an open handle under a `tasks` directory,
/// e.g. `~/.claude/tasks/<session-id>/current.log`.
pub fn session_id_from_path(link: &str) -> Option<String> {
    let marker = "/tasks/";
    let idx = link.find(marker)?;
    let rest = &link[idx + marker.len()..];
    let candidate = rest.split('/').next()?;
    looks_like_uuid(candidate).then(|| candidate.to_string())
}

fn session_id_from_fds(proc_dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(proc_dir.join("fd")).ok()?;
    for entry in entries.flatten() {
        if let Ok(target) = std::fs::read_link(entry.path()) {
            if let Some(session_id) = session_id_from_path(&target.to_string_lossy()) {
                return Some(session_id);
            }
        }
    }
    None
}

/// `(cpu_percent, mem_mb)` derived from `/proc/<pid>/stat` and statm.
fn read_usage(proc_dir: &Path) -> (Option<f64>, Option<f64>) {
    let cpu = std::fs::read_to_string(proc_dir.join("stat"))
        .ok()
        .and_then(|stat| {
            std::fs::read_to_string("/proc/uptime")
                .ok()
                .and_then(|uptime| cpu_percent_from_stat(&stat, &uptime))
        });
    let mem = std::fs::read_to_string(proc_dir.join("statm"))
        .ok()
        .and_then(|statm| rss_mb_from_statm(&statm));
    (cpu, mem)
}

const CLOCK_TICKS_PER_SEC: f64 = 100.0;
const PAGE_SIZE_BYTES: f64 = 4096.0;

/// Lifetime-average CPU percent, the way `ps` reports it:
/// `(utime + stime) / elapsed`.
pub fn cpu_percent_from_stat(stat: &str, uptime: &str) -> Option<f64> {
    // Fields after the parenthesized comm; comm may itself contain spaces.
    let after_comm = &stat[stat.rfind(')')? + 2..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Relative to the post-comm slice: utime=11, stime=12, starttime=19.
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    let starttime: f64 = fields.get(19)?.parse().ok()?;

    let uptime_secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    let elapsed = uptime_secs - starttime / CLOCK_TICKS_PER_SEC;
    if elapsed <= 0.0 {
        return None;
    }
    let used = (utime + stime) / CLOCK_TICKS_PER_SEC;
    Some((used / elapsed * 100.0 * 10.0).round() / 10.0)
}

pub fn rss_mb_from_statm(statm: &str) -> Option<f64> {
    let rss_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some((rss_pages * PAGE_SIZE_BYTES / (1024.0 * 1024.0) * 10.0).round() / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn invocation_matching() {
        assert!(matches_invocation(&argv(&["/usr/local/bin/claude", "-p"]), "claude"));
        assert!(matches_invocation(&argv(&["node", "/opt/claude", "--resume"]), "claude"));
        assert!(!matches_invocation(&argv(&["vim", "claude-notes.md"]), "claude"));
        assert!(!matches_invocation(&argv(&["claudette"]), "claude"));
    }

    #[test]
    fn resume_id_extraction() {
        let id = "0e8f7c9a-1234-4abc-9def-001122334455";
        assert_eq!(
            extract_resume_id(&argv(&["claude", "--resume", id])),
            Some(id.to_string())
        );
        assert_eq!(
            extract_resume_id(&argv(&["claude", &format!("--resume={id}")])),
            Some(id.to_string())
        );
        assert_eq!(extract_resume_id(&argv(&["claude", "--resume", "garbage"])), None);
        assert_eq!(extract_resume_id(&argv(&["claude", "-p", "hi"])), None);
    }

    #[test]
    fn uuid_shape() {
        assert!(looks_like_uuid("0e8f7c9a-1234-4abc-9def-001122334455"));
        assert!(!looks_like_uuid("not-a-uuid"));
        assert!(!looks_like_uuid("0e8f7c9a-1234-4abc-9def-00112233445")); // 35 chars
    }

    #[test]
    fn session_id_from_tasks_handle() {
        let id = "0e8f7c9a-1234-4abc-9def-001122334455";
        assert_eq!(
            session_id_from_path(&format!("/home/me/.claude/tasks/{id}/current.log")),
            Some(id.to_string())
        );
        assert_eq!(session_id_from_path("/home/me/.claude/tasks/other/log"), None);
        assert_eq!(session_id_from_path("/dev/null"), None);
    }

    #[test]
    fn cpu_percent_parses_stat_with_spaced_comm() {
        // comm "(claude code)" contains a space; starttime puts the process
        // at 100s of age with 50s of CPU → 50%. Post-comm field 0 is the
        // state character.
        let mut fields = vec!["0"; 50];
        fields[0] = "S";
        fields[11] = "4000"; // utime (ticks)
        fields[12] = "1000"; // stime
        fields[19] = "10000"; // starttime
        let stat = format!("1234 (claude code) {}", fields.join(" "));
        let cpu = cpu_percent_from_stat(&stat, "200.0 100.0").unwrap();
        assert!((cpu - 50.0).abs() < 0.5, "got {cpu}");
    }

    #[test]
    fn rss_from_statm() {
        // 25600 pages * 4 KiB = 100 MiB
        assert_eq!(rss_mb_from_statm("99999 25600 300"), Some(100.0));
        assert_eq!(rss_mb_from_statm(""), None);
    }
}
