//! Append-only per-job run logs.
//!
//! One JSONL file per job under `<state>/cron/runs/<jobId>.jsonl`. When a
//! file grows past 2 MiB it is pruned to its last 2,000 lines.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sb_domain::Result;

use super::model::RunStatus;

const PRUNE_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024;
const PRUNE_KEEP_LINES: usize = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLogEntry {
    pub at_ms: i64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
    /// Ad-hoc runs (`run` operation) vs timer-fired runs.
    #[serde(default)]
    pub adhoc: bool,
}

pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("cron").join("runs"),
        }
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.jsonl"))
    }

    pub fn append(&self, job_id: &str, entry: &RunLogEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(job_id);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        drop(file);

        if std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) > PRUNE_THRESHOLD_BYTES {
            self.prune(&path)?;
        }
        Ok(())
    }

    fn prune(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = raw.lines().collect();
        if lines.len() <= PRUNE_KEEP_LINES {
            return Ok(());
        }
        let keep = &lines[lines.len() - PRUNE_KEEP_LINES..];
        let tmp = path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, keep.join("\n") + "\n")?;
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), kept = keep.len(), "pruned run log");
        Ok(())
    }

    /// Latest `limit` entries, newest last.
    pub fn read(&self, job_id: &str, limit: usize) -> Vec<RunLogEntry> {
        let Ok(raw) = std::fs::read_to_string(self.path(job_id)) else {
            return Vec::new();
        };
        let entries: Vec<RunLogEntry> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }

    pub fn remove(&self, job_id: &str) {
        let _ = std::fs::remove_file(self.path(job_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(at_ms: i64, status: RunStatus) -> RunLogEntry {
        RunLogEntry {
            at_ms,
            status,
            error: None,
            duration_ms: 5,
            adhoc: false,
        }
    }

    #[test]
    fn append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path());
        for i in 0..5 {
            log.append("job1", &entry(i, RunStatus::Ok)).unwrap();
        }
        let entries = log.read("job1", 3);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].at_ms, 2);
        assert_eq!(entries[2].at_ms, 4);
    }

    #[test]
    fn read_missing_job_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path());
        assert!(log.read("nope", 10).is_empty());
    }

    #[test]
    fn remove_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path());
        log.append("job1", &entry(1, RunStatus::Ok)).unwrap();
        log.remove("job1");
        assert!(log.read("job1", 10).is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path());
        log.append("job1", &entry(1, RunStatus::Error)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("cron/runs/job1.jsonl"))
            .unwrap()
            .write_all(b"{ garbage\n")
            .unwrap();
        log.append("job1", &entry(2, RunStatus::Ok)).unwrap();

        let entries = log.read("job1", 10);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn prune_keeps_only_recent_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path());
        let path = dir.path().join("cron/runs/big.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        // Build a >2MiB file of valid entries.
        let padding = "x".repeat(700);
        let mut blob = String::new();
        for i in 0..4_000 {
            blob.push_str(
                &serde_json::to_string(&RunLogEntry {
                    at_ms: i,
                    status: RunStatus::Ok,
                    error: Some(padding.clone()),
                    duration_ms: 1,
                    adhoc: false,
                })
                .unwrap(),
            );
            blob.push('\n');
        }
        std::fs::write(&path, blob).unwrap();

        log.append("big", &entry(99_999, RunStatus::Ok)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.lines().count() <= PRUNE_KEEP_LINES);
        let entries = log.read("big", 1);
        assert_eq!(entries[0].at_ms, 99_999);
    }
}
