//! Codex rollout-file discovery.
//!
//! Codex sessions live under `~/.codex/sessions/<YYYY>/<MM>/<DD>/` as
//! `rollout-<uuid>.jsonl`. Only the last N days are scanned (default 2);
//! the first lines carry a session-meta payload with the working
//! directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct CodexRollout {
    pub session_id: String,
    pub path: PathBuf,
    pub mtime: DateTime<Utc>,
    pub cwd: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RolloutLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Option<RolloutPayload>,
}

#[derive(Debug, Deserialize)]
struct RolloutPayload {
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

/// `rollout-<uuid>.jsonl` → `<uuid>`.
pub fn session_id_from_filename(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".jsonl")?;
    let id = stem.strip_prefix("rollout-")?;
    crate::process::looks_like_uuid(id).then(|| id.to_string())
}

/// Scan day directories newer than `scan_days` for rollout files.
pub fn scan(root: &Path, scan_days: u32, now: DateTime<Utc>) -> Vec<CodexRollout> {
    let mut rollouts = Vec::new();
    for days_back in 0..=scan_days {
        let day = now - Duration::days(days_back as i64);
        let dir = root
            .join(day.format("%Y").to_string())
            .join(day.format("%m").to_string())
            .join(day.format("%d").to_string());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(session_id) = name.to_str().and_then(session_id_from_filename) else {
                continue;
            };
            let path = entry.path();
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or(now);
            let (cwd, model) = read_meta(&path);
            rollouts.push(CodexRollout {
                session_id,
                path,
                mtime,
                cwd,
                model,
            });
        }
    }
    rollouts.sort_by(|a, b| b.mtime.cmp(&a.mtime));
    rollouts
}

/// Pull cwd/model out of the leading session-meta lines.
fn read_meta(path: &Path) -> (Option<String>, Option<String>) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return (None, None);
    };
    let mut cwd = None;
    let mut model = None;
    for line in raw.lines().take(10) {
        let Ok(parsed) = serde_json::from_str::<RolloutLine>(line) else {
            continue;
        };
        if parsed.kind.as_deref() == Some("session_meta") {
            if let Some(payload) = parsed.payload {
                cwd = cwd.or(payload.cwd);
                model = model.or(payload.model);
            }
        }
        if cwd.is_some() && model.is_some() {
            break;
        }
    }
    (cwd, model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_parsing() {
        let id = "0e8f7c9a-1234-4abc-9def-001122334455";
        assert_eq!(
            session_id_from_filename(&format!("rollout-{id}.jsonl")),
            Some(id.to_string())
        );
        assert_eq!(session_id_from_filename("rollout-nope.jsonl"), None);
        assert_eq!(session_id_from_filename(&format!("{id}.jsonl")), None);
    }

    #[test]
    fn scans_recent_day_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let id = "0e8f7c9a-1234-4abc-9def-001122334455";

        let today = dir
            .path()
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        std::fs::create_dir_all(&today).unwrap();
        std::fs::write(
            today.join(format!("rollout-{id}.jsonl")),
            "{\"type\":\"session_meta\",\"payload\":{\"cwd\":\"/home/me/proj\"}}\n",
        )
        .unwrap();

        let old_day = now - Duration::days(30);
        let old = dir
            .path()
            .join(old_day.format("%Y").to_string())
            .join(old_day.format("%m").to_string())
            .join(old_day.format("%d").to_string());
        std::fs::create_dir_all(&old).unwrap();
        std::fs::write(
            old.join("rollout-11111111-2222-4333-8444-555566667777.jsonl"),
            "{}\n",
        )
        .unwrap();

        let rollouts = scan(dir.path(), 2, now);
        assert_eq!(rollouts.len(), 1);
        assert_eq!(rollouts[0].session_id, id);
        assert_eq!(rollouts[0].cwd.as_deref(), Some("/home/me/proj"));
    }
}
