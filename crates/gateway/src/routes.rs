//! Persisted chat-thread routes.
//!
//! One row per bridged thread, keyed by thread id, in a small SQLite
//! database (WAL mode, one shared connection). `provider_session_id` may
//! be empty for the window between a chat-initiated session creation and
//! the backend's first session-id announcement; discovery later *claims*
//! such rows by cwd, writing the real session id in.
//!
//! `auto-threads.json` is a JSON export of the same bindings; merging
//! exports from several store paths dedupes by `(provider, session_id)`
//! keeping the row with the higher `updated_at`.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use sb_domain::snapshot::Provider;
use sb_domain::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadRoute {
    pub thread_id: String,
    pub parent_channel_id: String,
    pub mapping_key: String,
    pub provider: Provider,
    /// Empty until the backend announces the session id.
    pub provider_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    pub cwd: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub auto_discovered: bool,
}

pub struct RouteStore {
    conn: Mutex<Connection>,
}

impl RouteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS discord_thread_routes (
                thread_id TEXT PRIMARY KEY,
                parent_channel_id TEXT NOT NULL,
                mapping_key TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_session_id TEXT NOT NULL DEFAULT '',
                owner_user_id TEXT,
                cwd TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                auto_discovered INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS discord_thread_routes (
                thread_id TEXT PRIMARY KEY,
                parent_channel_id TEXT NOT NULL,
                mapping_key TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_session_id TEXT NOT NULL DEFAULT '',
                owner_user_id TEXT,
                cwd TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                auto_discovered INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert(&self, route: &ThreadRoute) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO discord_thread_routes
                   (thread_id, parent_channel_id, mapping_key, provider,
                    provider_session_id, owner_user_id, cwd, created_at,
                    updated_at, auto_discovered)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(thread_id) DO UPDATE SET
                   parent_channel_id = excluded.parent_channel_id,
                   mapping_key = excluded.mapping_key,
                   provider = excluded.provider,
                   provider_session_id = excluded.provider_session_id,
                   owner_user_id = excluded.owner_user_id,
                   cwd = excluded.cwd,
                   updated_at = excluded.updated_at,
                   auto_discovered = excluded.auto_discovered",
                params![
                    route.thread_id,
                    route.parent_channel_id,
                    route.mapping_key,
                    route.provider.as_str(),
                    route.provider_session_id,
                    route.owner_user_id,
                    route.cwd,
                    route.created_at,
                    route.updated_at,
                    route.auto_discovered as i64,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn get(&self, thread_id: &str) -> Result<Option<ThreadRoute>> {
        self.conn
            .lock()
            .query_row(
                "SELECT * FROM discord_thread_routes WHERE thread_id = ?1",
                params![thread_id],
                row_to_route,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn find_by_session(
        &self,
        provider: Provider,
        session_id: &str,
    ) -> Result<Option<ThreadRoute>> {
        self.conn
            .lock()
            .query_row(
                "SELECT * FROM discord_thread_routes
                 WHERE provider = ?1 AND provider_session_id = ?2
                 ORDER BY updated_at DESC LIMIT 1",
                params![provider.as_str(), session_id],
                row_to_route,
            )
            .optional()
            .map_err(sql_err)
    }

    /// Routes created from chat whose session id has not been announced
    /// yet, matching on working directory.
    pub fn find_unclaimed_by_cwd(&self, provider: Provider, cwd: &str) -> Result<Option<ThreadRoute>> {
        self.conn
            .lock()
            .query_row(
                "SELECT * FROM discord_thread_routes
                 WHERE provider = ?1 AND provider_session_id = '' AND cwd = ?2
                 ORDER BY updated_at DESC LIMIT 1",
                params![provider.as_str(), cwd],
                row_to_route,
            )
            .optional()
            .map_err(sql_err)
    }

    /// Write the announced session id into a previously empty route.
    pub fn claim(&self, thread_id: &str, session_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE discord_thread_routes
                 SET provider_session_id = ?2, updated_at = ?3
                 WHERE thread_id = ?1 AND provider_session_id = ''",
                params![thread_id, session_id, Utc::now().timestamp_millis()],
            )
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> Result<Vec<ThreadRoute>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM discord_thread_routes ORDER BY updated_at DESC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], row_to_route)
            .map_err(sql_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    pub fn delete(&self, thread_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute(
                "DELETE FROM discord_thread_routes WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    /// Export all auto-discovered bindings to `auto-threads.json`.
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let routes: Vec<ThreadRoute> = self
            .list()?
            .into_iter()
            .filter(|r| r.auto_discovered)
            .collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&routes)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn row_to_route(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRoute> {
    let provider: String = row.get("provider")?;
    Ok(ThreadRoute {
        thread_id: row.get("thread_id")?,
        parent_channel_id: row.get("parent_channel_id")?,
        mapping_key: row.get("mapping_key")?,
        provider: Provider::from_str(&provider).unwrap_or(Provider::Claude),
        provider_session_id: row.get("provider_session_id")?,
        owner_user_id: row.get("owner_user_id")?,
        cwd: row.get("cwd")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        auto_discovered: row.get::<_, i64>("auto_discovered")? != 0,
    })
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

/// Merge binding exports from multiple store paths, deduping by
/// `(provider, session_id)` and keeping the higher `updated_at`. Rows with
/// an empty session id are never merged away.
pub fn merge_exports(paths: &[std::path::PathBuf]) -> Vec<ThreadRoute> {
    let mut by_session: HashMap<(Provider, String), ThreadRoute> = HashMap::new();
    let mut unclaimed: Vec<ThreadRoute> = Vec::new();

    for path in paths {
        let Ok(raw) = std::fs::read_to_string(path) else {
            continue;
        };
        let Ok(routes) = serde_json::from_str::<Vec<ThreadRoute>>(&raw) else {
            tracing::warn!(path = %path.display(), "unreadable auto-threads export, skipping");
            continue;
        };
        for route in routes {
            if route.provider_session_id.is_empty() {
                unclaimed.push(route);
                continue;
            }
            let key = (route.provider, route.provider_session_id.clone());
            match by_session.get(&key) {
                Some(existing) if existing.updated_at >= route.updated_at => {}
                _ => {
                    by_session.insert(key, route);
                }
            }
        }
    }

    let mut merged: Vec<ThreadRoute> = by_session.into_values().collect();
    merged.extend(unclaimed);
    merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(thread: &str, session: &str, updated_at: i64) -> ThreadRoute {
        ThreadRoute {
            thread_id: thread.into(),
            parent_channel_id: "chan-1".into(),
            mapping_key: "/home/me/proj".into(),
            provider: Provider::Claude,
            provider_session_id: session.into(),
            owner_user_id: None,
            cwd: "/home/me/proj".into(),
            created_at: updated_at,
            updated_at,
            auto_discovered: true,
        }
    }

    #[test]
    fn upsert_get_round_trip() {
        let store = RouteStore::in_memory().unwrap();
        let r = route("t1", "s1", 100);
        store.upsert(&r).unwrap();
        assert_eq!(store.get("t1").unwrap().unwrap(), r);
        assert!(store.get("t2").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = RouteStore::in_memory().unwrap();
        store.upsert(&route("t1", "s1", 100)).unwrap();
        let mut newer = route("t1", "s2", 200);
        newer.parent_channel_id = "chan-2".into();
        store.upsert(&newer).unwrap();

        let got = store.get("t1").unwrap().unwrap();
        assert_eq!(got.provider_session_id, "s2");
        assert_eq!(got.parent_channel_id, "chan-2");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn find_by_session_and_delete() {
        let store = RouteStore::in_memory().unwrap();
        store.upsert(&route("t1", "s1", 100)).unwrap();
        assert!(store
            .find_by_session(Provider::Claude, "s1")
            .unwrap()
            .is_some());
        assert!(store
            .find_by_session(Provider::Codex, "s1")
            .unwrap()
            .is_none());
        assert!(store.delete("t1").unwrap());
        assert!(!store.delete("t1").unwrap());
    }

    #[test]
    fn cwd_claim_fills_empty_session_id_only() {
        let store = RouteStore::in_memory().unwrap();
        store.upsert(&route("t1", "", 100)).unwrap();

        let unclaimed = store
            .find_unclaimed_by_cwd(Provider::Claude, "/home/me/proj")
            .unwrap()
            .unwrap();
        assert_eq!(unclaimed.thread_id, "t1");

        assert!(store.claim("t1", "s-real").unwrap());
        assert_eq!(
            store.get("t1").unwrap().unwrap().provider_session_id,
            "s-real"
        );
        // A second claim must not overwrite the real id.
        assert!(!store.claim("t1", "s-other").unwrap());
        assert!(store
            .find_unclaimed_by_cwd(Provider::Claude, "/home/me/proj")
            .unwrap()
            .is_none());
    }

    #[test]
    fn merge_keeps_higher_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(
            &a,
            serde_json::to_string(&vec![route("t1", "s1", 100), route("t2", "s2", 500)]).unwrap(),
        )
        .unwrap();
        std::fs::write(
            &b,
            serde_json::to_string(&vec![route("t1-new", "s1", 300)]).unwrap(),
        )
        .unwrap();

        let merged = merge_exports(&[a, b]);
        assert_eq!(merged.len(), 2);
        let s1 = merged
            .iter()
            .find(|r| r.provider_session_id == "s1")
            .unwrap();
        assert_eq!(s1.thread_id, "t1-new", "higher updated_at wins");
    }

    #[test]
    fn export_writes_auto_discovered_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = RouteStore::in_memory().unwrap();
        store.upsert(&route("t1", "s1", 100)).unwrap();
        let mut manual = route("t2", "s2", 100);
        manual.auto_discovered = false;
        store.upsert(&manual).unwrap();

        let out = dir.path().join("auto-threads.json");
        store.export_json(&out).unwrap();
        let exported: Vec<ThreadRoute> =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].thread_id, "t1");
    }
}
