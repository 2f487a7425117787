//! Lifecycle stream ingestion.
//!
//! An external hook script appends newline-JSON events to
//! `lifecycle.jsonl`; we tail it with the shared transcript tailer and
//! materialize rows into `lifecycle-stream.db` (WAL) — session lifecycle,
//! skill lifecycle, and per-stream offsets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Deserialize;

use sb_domain::{Error, Result};
use sb_sessions::tailer::{JsonlTailer, OffsetStore};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LifecycleLine {
    Session {
        session_id: String,
        event: String,
        #[serde(default)]
        at_ms: i64,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Skill {
        session_id: String,
        skill: String,
        event: String,
        #[serde(default)]
        at_ms: i64,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

pub struct LifecycleStreamStore {
    conn: Mutex<Connection>,
}

impl LifecycleStreamStore {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| Error::Store(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::Store(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_lifecycle (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                event TEXT NOT NULL,
                at_ms INTEGER NOT NULL,
                payload TEXT
            );
            CREATE TABLE IF NOT EXISTS skill_lifecycle (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                skill TEXT NOT NULL,
                event TEXT NOT NULL,
                at_ms INTEGER NOT NULL,
                payload TEXT
            );
            CREATE TABLE IF NOT EXISTS stream_offsets (
                stream TEXT PRIMARY KEY,
                line_count INTEGER NOT NULL DEFAULT 0
            );",
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Ingest one raw line. Unknown shapes are counted but not stored.
    pub fn ingest(&self, line: &str) -> Result<()> {
        let parsed: LifecycleLine =
            serde_json::from_str(line).map_err(|e| Error::Other(format!("lifecycle line: {e}")))?;
        let conn = self.conn.lock();
        match parsed {
            LifecycleLine::Session {
                session_id,
                event,
                at_ms,
                payload,
            } => {
                conn.execute(
                    "INSERT INTO session_lifecycle (session_id, event, at_ms, payload)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        session_id,
                        event,
                        at_ms,
                        payload.map(|p| p.to_string())
                    ],
                )
                .map_err(|e| Error::Store(e.to_string()))?;
            }
            LifecycleLine::Skill {
                session_id,
                skill,
                event,
                at_ms,
                payload,
            } => {
                conn.execute(
                    "INSERT INTO skill_lifecycle (session_id, skill, event, at_ms, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session_id,
                        skill,
                        event,
                        at_ms,
                        payload.map(|p| p.to_string())
                    ],
                )
                .map_err(|e| Error::Store(e.to_string()))?;
            }
            LifecycleLine::Unknown => {}
        }
        conn.execute(
            "INSERT INTO stream_offsets (stream, line_count) VALUES ('lifecycle', 1)
             ON CONFLICT(stream) DO UPDATE SET line_count = line_count + 1",
            [],
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn session_event_count(&self, session_id: &str) -> usize {
        self.conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM session_lifecycle WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as usize
    }

    pub fn ingested_line_count(&self) -> i64 {
        self.conn
            .lock()
            .query_row(
                "SELECT line_count FROM stream_offsets WHERE stream = 'lifecycle'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0)
    }
}

/// Tail `lifecycle.jsonl` into the store until cancelled.
pub fn spawn_lifecycle_tail(
    store: Arc<LifecycleStreamStore>,
    stream_path: PathBuf,
    offsets: Arc<OffsetStore>,
    poll: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tailer = JsonlTailer::new(&stream_path, offsets);
        let sink = store.clone();
        tailer.register_group("lifecycle", move |line| sink.ingest(line));
        tailer.run(poll, cancel).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingests_session_and_skill_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStreamStore::open(&dir.path().join("lifecycle-stream.db")).unwrap();

        store
            .ingest(r#"{"kind":"session","session_id":"s-1","event":"started","at_ms":100}"#)
            .unwrap();
        store
            .ingest(
                r#"{"kind":"skill","session_id":"s-1","skill":"deploy","event":"loaded","at_ms":200}"#,
            )
            .unwrap();
        store
            .ingest(r#"{"kind":"session","session_id":"s-2","event":"started","at_ms":300}"#)
            .unwrap();

        assert_eq!(store.session_event_count("s-1"), 1);
        assert_eq!(store.session_event_count("s-2"), 1);
        assert_eq!(store.ingested_line_count(), 3);
    }

    #[test]
    fn bad_line_is_an_error_so_the_tailer_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStreamStore::open(&dir.path().join("db")).unwrap();
        assert!(store.ingest("{ nope").is_err());
    }

    #[tokio::test]
    async fn tail_task_ingests_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStreamStore::open(&dir.path().join("db")).unwrap();
        let stream = dir.path().join("lifecycle.jsonl");
        std::fs::write(
            &stream,
            "{\"kind\":\"session\",\"session_id\":\"s-1\",\"event\":\"started\",\"at_ms\":1}\n",
        )
        .unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let handle = spawn_lifecycle_tail(
            store.clone(),
            stream,
            Arc::new(OffsetStore::in_memory()),
            Duration::from_millis(20),
            cancel.clone(),
        );

        for _ in 0..100 {
            if store.ingested_line_count() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.ingested_line_count(), 1);
        cancel.cancel();
        let _ = handle.await;
    }
}
