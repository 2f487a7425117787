//! Auto-thread discovery.
//!
//! Subscribes to monitor refreshes. Known sessions get human-readable
//! state/phase transition messages in their bound thread; newly appeared
//! sessions in the configured target states get a thread created under a
//! channel resolved from the path registry (exact match, then longest
//! prefix; a worktree basename `name~suffix` falls back to `name`), with
//! a fallback channel when configured.
//!
//! Double-create guards, in order: an in-flight creation set, the
//! discovered map, and the route store — including the cwd-claim: a route
//! whose `provider_session_id` is still empty but whose cwd matches is
//! treated as already-mapped and claimed with the session id. That claim
//! closes the race where a chat-initiated session registers its route
//! before the backend announces the session id; regressing it recreates
//! duplicate threads.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sb_domain::config::DiscoveryConfig;
use sb_domain::snapshot::{ActivityPhase, SessionSnapshot, SnapshotState};

use crate::chat::throttle::{SendOptions, ThrottleQueue};
use crate::chat::{ChatPort, OutboundMessage};
use crate::routes::{RouteStore, ThreadRoute};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Path-prefix → channel mapping, loaded from a JSON object file.
#[derive(Debug, Default, Clone)]
pub struct ChannelRegistry {
    entries: Vec<(String, String)>,
}

impl ChannelRegistry {
    pub fn from_entries(entries: Vec<(String, String)>) -> Self {
        let mut entries = entries;
        // Longest prefix first so the first match wins.
        entries.sort_by_key(|(path, _)| std::cmp::Reverse(path.len()));
        Self { entries }
    }

    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "channel registry unreadable");
                return Self::default();
            }
        };
        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(map) => Self::from_entries(map.into_iter().collect()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "channel registry malformed");
                Self::default()
            }
        }
    }

    /// Exact match, then longest prefix. A worktree path (`name~suffix`
    /// basename) retries with the base name.
    pub fn resolve(&self, project_path: &str) -> Option<String> {
        if let Some(channel) = self.lookup(project_path) {
            return Some(channel);
        }
        if let Some(base) = worktree_base(project_path) {
            return self.lookup(&base);
        }
        None
    }

    fn lookup(&self, path: &str) -> Option<String> {
        for (prefix, channel) in &self.entries {
            if path == prefix {
                return Some(channel.clone());
            }
            let trimmed = prefix.trim_end_matches('/');
            // Prefix matches only at a path-component boundary.
            if trimmed.is_empty()
                || (path.starts_with(trimmed)
                    && path.as_bytes().get(trimmed.len()) == Some(&b'/'))
            {
                return Some(channel.clone());
            }
        }
        None
    }
}

/// `/a/b/name~suffix` → `/a/b/name`.
pub fn worktree_base(path: &str) -> Option<String> {
    let p = Path::new(path);
    let name = p.file_name()?.to_str()?;
    let base = name.split_once('~')?.0;
    Some(p.with_file_name(base).to_string_lossy().to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Watch state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Serialize, Deserialize)]
struct WatchStateFile {
    version: u32,
    #[serde(default)]
    sessions: HashMap<String, WatchEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatchEntry {
    #[serde(rename = "lastWatchAt")]
    last_watch_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct KnownSession {
    state: SnapshotState,
    phase: Option<ActivityPhase>,
}

pub struct AutoThreadDiscovery {
    port: Arc<dyn ChatPort>,
    throttle: Arc<ThrottleQueue>,
    routes: Arc<RouteStore>,
    registry: ChannelRegistry,
    config: DiscoveryConfig,
    watch_state_path: PathBuf,

    known: Mutex<HashMap<String, KnownSession>>,
    pending_creations: Mutex<HashSet<String>>,
    discovered: Mutex<HashMap<String, String>>,
    watch_state: Mutex<WatchStateFile>,
    /// Turn counts captured at each session's last monitor-log write.
    watch_turns: Mutex<HashMap<String, u64>>,
}

impl AutoThreadDiscovery {
    pub fn new(
        port: Arc<dyn ChatPort>,
        throttle: Arc<ThrottleQueue>,
        routes: Arc<RouteStore>,
        registry: ChannelRegistry,
        config: DiscoveryConfig,
        state_dir: &Path,
    ) -> Arc<Self> {
        let watch_state_path = state_dir.join("auto-thread-watch-state.json");
        let watch_state = std::fs::read_to_string(&watch_state_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(WatchStateFile {
                version: 1,
                sessions: HashMap::new(),
            });
        Arc::new(Self {
            port,
            throttle,
            routes,
            registry,
            config,
            watch_state_path,
            known: Mutex::new(HashMap::new()),
            pending_creations: Mutex::new(HashSet::new()),
            discovered: Mutex::new(HashMap::new()),
            watch_state: Mutex::new(watch_state),
            watch_turns: Mutex::new(HashMap::new()),
        })
    }

    /// Monitor refresh listener. Snapshots from one tick are processed to
    /// completion before the next tick's batch arrives (the monitor fires
    /// listeners sequentially).
    pub async fn on_monitor_refresh(&self, snapshots: Vec<SessionSnapshot>) -> sb_domain::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        for snapshot in &snapshots {
            self.emit_transitions(snapshot).await;
        }
        for snapshot in &snapshots {
            if self.qualifies(snapshot) {
                self.discover(snapshot).await;
                // Smooth thread-creation bursts.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        self.watch_pass(&snapshots).await;
        Ok(())
    }

    /// Hook path: a session announced by `SessionStart` skips the refresh
    /// wait and is bridged immediately.
    pub async fn on_session_start(&self, snapshot: &SessionSnapshot) {
        if !self.config.enabled {
            return;
        }
        if self.qualifies(snapshot) {
            self.discover(snapshot).await;
        }
    }

    /// Out-of-band message into a session's thread, if one is bound.
    pub async fn send_to_session_thread(
        &self,
        provider: sb_domain::snapshot::Provider,
        session_id: &str,
        text: &str,
    ) -> bool {
        let key = format!("{provider}:{session_id}");
        let thread = self.discovered.lock().get(&key).cloned().or_else(|| {
            self.routes
                .find_by_session(provider, session_id)
                .ok()
                .flatten()
                .map(|r| r.thread_id)
        });
        let Some(thread) = thread else {
            return false;
        };
        let send = self.throttle.send(
            &thread,
            OutboundMessage::text(text.to_string()),
            SendOptions {
                merge_key: Some(format!("fwd:{session_id}")),
                high_priority: false,
            },
        );
        if let Err(e) = send.await {
            tracing::warn!(thread = %thread, error = %e, "forward to session thread failed");
            return false;
        }
        true
    }

    // ── Transition messages ────────────────────────────────────────────

    async fn emit_transitions(&self, snapshot: &SessionSnapshot) {
        let key = snapshot.key();
        let previous = {
            let mut known = self.known.lock();
            known.insert(
                key.clone(),
                KnownSession {
                    state: snapshot.state,
                    phase: snapshot.activity_phase,
                },
            )
        };
        let Some(previous) = previous else {
            return;
        };

        let mut lines = Vec::new();
        if previous.state != snapshot.state {
            lines.push(format!(
                "state: {} → {}",
                state_label(previous.state),
                state_label(snapshot.state)
            ));
        }
        if previous.phase != snapshot.activity_phase {
            if let Some(phase) = snapshot.activity_phase {
                lines.push(phase_label(phase).to_string());
            }
        }
        if lines.is_empty() {
            return;
        }

        let thread = self.discovered.lock().get(&key).cloned().or_else(|| {
            self.routes
                .find_by_session(snapshot.provider, &snapshot.session_id)
                .ok()
                .flatten()
                .map(|r| r.thread_id)
        });
        let Some(thread) = thread else {
            return;
        };
        let text = format!("`{}` — {}", snapshot.slug, lines.join("; "));
        let send = self.throttle.send(
            &thread,
            OutboundMessage::text(text),
            SendOptions {
                merge_key: Some(format!("transition:{key}")),
                high_priority: false,
            },
        );
        if let Err(e) = send.await {
            tracing::debug!(error = %e, "transition message dropped");
        }
    }

    // ── Discovery ──────────────────────────────────────────────────────

    fn qualifies(&self, snapshot: &SessionSnapshot) -> bool {
        if snapshot.session_id.is_empty() {
            return false;
        }
        let state_name = state_label(snapshot.state);
        if !self.config.target_states.iter().any(|s| s == state_name) {
            return false;
        }
        if self
            .config
            .exclude_paths
            .iter()
            .any(|prefix| snapshot.project_path.starts_with(prefix.as_str()))
        {
            return false;
        }
        true
    }

    async fn discover(&self, snapshot: &SessionSnapshot) {
        let key = snapshot.key();

        // Guard 1: a creation for this session is already in flight.
        if !self.pending_creations.lock().insert(key.clone()) {
            return;
        }
        // Released on all paths below.
        let result = self.discover_guarded(snapshot, &key).await;
        self.pending_creations.lock().remove(&key);
        if let Err(e) = result {
            tracing::warn!(session = %key, error = %e, "thread discovery failed");
        }
    }

    async fn discover_guarded(&self, snapshot: &SessionSnapshot, key: &str) -> sb_domain::Result<()> {
        // Guard 2: already discovered in this process.
        if self.discovered.lock().contains_key(key) {
            return Ok(());
        }
        // Guard 3: the route store already maps this session.
        if let Some(route) = self
            .routes
            .find_by_session(snapshot.provider, &snapshot.session_id)?
        {
            self.discovered.lock().insert(key.to_string(), route.thread_id);
            return Ok(());
        }
        // Guard 3b, the cwd-claim: a chat-initiated route whose backend
        // session id hasn't been announced yet counts as mapped, and the
        // session id is written back into it.
        if !snapshot.project_path.is_empty() {
            if let Some(route) = self
                .routes
                .find_unclaimed_by_cwd(snapshot.provider, &snapshot.project_path)?
            {
                if self.routes.claim(&route.thread_id, &snapshot.session_id)? {
                    tracing::info!(
                        thread = %route.thread_id,
                        session = %key,
                        "claimed chat-initiated route by cwd"
                    );
                    self.discovered
                        .lock()
                        .insert(key.to_string(), route.thread_id);
                    return Ok(());
                }
            }
        }

        // Resolve the parent channel; skip sessions nobody wants.
        let parent = self
            .registry
            .resolve(&snapshot.project_path)
            .or_else(|| self.config.fallback_channel.clone());
        let Some(parent) = parent else {
            tracing::debug!(session = %key, path = %snapshot.project_path, "no channel for session");
            return Ok(());
        };

        let name = thread_name(snapshot);
        let thread_id = self
            .port
            .create_thread(&parent, &name)
            .await
            .map_err(|e| sb_domain::Error::Other(e.to_string()))?;

        let now = Utc::now().timestamp_millis();
        self.routes.upsert(&ThreadRoute {
            thread_id: thread_id.clone(),
            parent_channel_id: parent,
            mapping_key: snapshot.project_path.clone(),
            provider: snapshot.provider,
            provider_session_id: snapshot.session_id.clone(),
            owner_user_id: None,
            cwd: snapshot.project_path.clone(),
            created_at: now,
            updated_at: now,
            auto_discovered: true,
        })?;
        self.discovered
            .lock()
            .insert(key.to_string(), thread_id.clone());
        tracing::info!(session = %key, thread = %thread_id, "bridged session to thread");

        if self.config.initial_embed {
            let send = self.throttle.send(
                &thread_id,
                OutboundMessage::text(initial_embed(snapshot)),
                SendOptions::default(),
            );
            if let Err(e) = send.await {
                tracing::debug!(error = %e, "initial embed dropped");
            }
        }
        Ok(())
    }

    // ── Periodic monitor log ───────────────────────────────────────────

    async fn watch_pass(&self, snapshots: &[SessionSnapshot]) {
        let interval = chrono::Duration::minutes(self.config.watch_interval_min as i64);
        let now = Utc::now();
        let mut due: Vec<(String, String, u64)> = Vec::new();
        {
            let state = self.watch_state.lock();
            for snapshot in snapshots {
                let key = snapshot.key();
                let last = state.sessions.get(&key).map(|e| e.last_watch_at);
                let is_due = match last {
                    Some(last) => now - last >= interval,
                    // First sighting starts the clock without a log line.
                    None => false,
                };
                if is_due {
                    due.push((key, snapshot.slug.clone(), snapshot.turn_count));
                } else if last.is_none() {
                    due.push((key, String::new(), u64::MAX)); // marker: seed only
                }
            }
        }

        let mut dirty = false;
        for (key, slug, turn_count) in due {
            if turn_count == u64::MAX {
                self.watch_state
                    .lock()
                    .sessions
                    .insert(key.clone(), WatchEntry { last_watch_at: now });
                self.watch_turns.lock().entry(key).or_insert(0);
                dirty = true;
                continue;
            }
            let previous_turns = self
                .watch_turns
                .lock()
                .get(&key)
                .copied()
                .unwrap_or(0);
            let Some(thread) = self.discovered.lock().get(&key).cloned() else {
                continue;
            };
            let text = format!(
                "monitor log: `{slug}` — {turn_count} turn(s) total ({} since last watch)",
                turn_count.saturating_sub(previous_turns)
            );
            let send = self.throttle.send(
                &thread,
                OutboundMessage::text(text),
                SendOptions::default(),
            );
            if let Err(e) = send.await {
                tracing::debug!(error = %e, "monitor log dropped");
            }
            self.watch_state
                .lock()
                .sessions
                .insert(key.clone(), WatchEntry { last_watch_at: now });
            self.watch_turns.lock().insert(key, turn_count);
            dirty = true;
        }

        if dirty {
            self.persist_watch_state();
        }
    }

    fn persist_watch_state(&self) {
        let json = {
            let mut state = self.watch_state.lock();
            state.version = 1;
            serde_json::to_string_pretty(&*state)
        };
        let Ok(json) = json else { return };
        if let Some(parent) = self.watch_state_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.watch_state_path.with_extension("json.tmp");
        if std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.watch_state_path))
            .is_err()
        {
            tracing::warn!("failed to persist watch state");
        }
    }
}

fn state_label(state: SnapshotState) -> &'static str {
    match state {
        SnapshotState::Active => "active",
        SnapshotState::Idle => "idle",
        SnapshotState::Completed => "completed",
        SnapshotState::Stale => "stale",
    }
}

fn phase_label(phase: ActivityPhase) -> &'static str {
    match phase {
        ActivityPhase::Busy => "working",
        ActivityPhase::Interactable => "ready for input",
        ActivityPhase::WaitingPermission => "waiting for a permission grant",
        ActivityPhase::WaitingQuestion => "waiting for an answer",
    }
}

fn thread_name(snapshot: &SessionSnapshot) -> String {
    let base = if snapshot.slug.is_empty() {
        snapshot.project_name.clone()
    } else {
        snapshot.slug.clone()
    };
    sb_domain::snapshot::truncate_chars(&format!("{} · {}", snapshot.project_name, base), 90)
}

fn initial_embed(snapshot: &SessionSnapshot) -> String {
    let mut lines = vec![format!("session `{}`", snapshot.session_id)];
    lines.push(format!("path: `{}`", snapshot.project_path));
    if let Some(model) = &snapshot.model {
        lines.push(format!("model: {model}"));
    }
    if let Some(branch) = &snapshot.git_branch {
        lines.push(format!("branch: `{branch}`"));
    }
    if let Some(msg) = &snapshot.last_user_message {
        lines.push(format!("> {msg}"));
    }
    lines.join("\n")
}
