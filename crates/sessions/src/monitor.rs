//! The session monitor.
//!
//! Each refresh tick correlates three sources into a map of
//! `session id → SessionSnapshot`:
//!
//! 1. the process table (pid, `--resume` id, cpu/rss, cwd, open handles),
//! 2. transcript files under the assistant project roots (incrementally
//!    re-parsed only when their mtime moved),
//! 3. phases injected out-of-band by the hook receiver — which win over
//!    phases parsed from the transcript when fresher than the last tick.
//!
//! Only one refresh runs at a time; calls that arrive mid-refresh set a
//! queued flag that triggers exactly one follow-up pass, which coalesces
//! bursty filesystem events (themselves debounced upstream).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};

use sb_domain::event::TokenUsage;
use sb_domain::snapshot::{classify_state, ActivityPhase, Provider, SessionSnapshot, SnapshotState};

use crate::codex;
use crate::process::{self, ProcessInfo};
use crate::tailer::{JsonlTailer, OffsetStore};
use crate::transcript::TranscriptExtractor;

pub type RefreshListener =
    Arc<dyn Fn(Vec<SessionSnapshot>) -> BoxFuture<'static, sb_domain::Result<()>> + Send + Sync>;

/// A hook-delivered session event (see the hook receiver).
#[derive(Debug, Clone)]
pub struct HookSessionEvent {
    pub provider: Provider,
    pub session_id: String,
    pub cwd: Option<String>,
    pub transcript_path: Option<PathBuf>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TranscriptFile {
    pub session_id: String,
    pub project_key: String,
    pub path: PathBuf,
    pub mtime: DateTime<Utc>,
}

/// `/` → `-`, the encoding assistant CLIs use for project directories.
pub fn encode_cwd(path: &Path) -> String {
    path.to_string_lossy().replace('/', "-")
}

fn list_transcripts(root: &Path) -> Vec<TranscriptFile> {
    let mut found = Vec::new();
    let Ok(projects) = std::fs::read_dir(root) else {
        return found;
    };
    for project in projects.flatten() {
        let project_key = project.file_name().to_string_lossy().to_string();
        let Ok(entries) = std::fs::read_dir(project.path()) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".jsonl") else {
                continue;
            };
            if !process::looks_like_uuid(stem) {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            found.push(TranscriptFile {
                session_id: stem.to_string(),
                project_key: project_key.clone(),
                path: entry.path(),
                mtime,
            });
        }
    }
    // Newest first within each project key.
    found.sort_by(|a, b| a.project_key.cmp(&b.project_key).then(b.mtime.cmp(&a.mtime)));
    found
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process ↔ transcript matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assign processes to transcript sessions: first by explicit session id
/// (fd handle or `--resume` argument), then by encoded cwd — at most one
/// still-unmatched process per encoded cwd binds to the newest transcript
/// under that key. A pid, once bound, stays bound to that session.
pub fn match_processes<'a>(
    procs: &'a [ProcessInfo],
    transcripts: &[TranscriptFile],
    bindings: &mut HashMap<u32, String>,
) -> HashMap<String, &'a ProcessInfo> {
    let known: std::collections::HashSet<&str> =
        transcripts.iter().map(|t| t.session_id.as_str()).collect();
    bindings.retain(|pid, _| procs.iter().any(|p| p.pid == *pid));

    let mut assigned: HashMap<String, &ProcessInfo> = HashMap::new();
    let mut unmatched: Vec<&ProcessInfo> = Vec::new();

    for proc in procs {
        if let Some(bound) = bindings.get(&proc.pid) {
            if known.contains(bound.as_str()) {
                assigned.insert(bound.clone(), proc);
                continue;
            }
        }
        let direct = proc
            .session_id
            .as_deref()
            .filter(|sid| known.contains(sid))
            .or_else(|| proc.resume_id.as_deref().filter(|sid| known.contains(sid)));
        match direct {
            Some(sid) => {
                bindings.insert(proc.pid, sid.to_string());
                assigned.insert(sid.to_string(), proc);
            }
            None => unmatched.push(proc),
        }
    }

    // cwd fallback: one process per encoded cwd, newest transcript wins.
    let mut claimed_cwd: std::collections::HashSet<String> = std::collections::HashSet::new();
    for proc in unmatched {
        let Some(cwd) = &proc.cwd else { continue };
        let encoded = encode_cwd(cwd);
        if !claimed_cwd.insert(encoded.clone()) {
            continue;
        }
        let newest = transcripts
            .iter()
            .filter(|t| t.project_key == encoded && !assigned.contains_key(&t.session_id))
            .max_by_key(|t| t.mtime);
        if let Some(t) = newest {
            bindings.insert(proc.pid, t.session_id.clone());
            assigned.insert(t.session_id.clone(), proc);
        }
    }

    assigned
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TranscriptCacheEntry {
    mtime: DateTime<Utc>,
    inode: u64,
    extractor: Arc<Mutex<TranscriptExtractor>>,
}

#[derive(Debug, Clone, Copy)]
struct HookPhaseEntry {
    phase: ActivityPhase,
    at: DateTime<Utc>,
}

pub struct SessionMonitor {
    claude_roots: Vec<PathBuf>,
    codex_root: Option<PathBuf>,
    codex_scan_days: u32,
    process_pattern: String,
    offset_store: Arc<OffsetStore>,

    snapshots: RwLock<HashMap<String, SessionSnapshot>>,
    cache: Mutex<HashMap<PathBuf, TranscriptCacheEntry>>,
    listeners: Mutex<Vec<RefreshListener>>,
    hook_phases: Mutex<HashMap<String, HookPhaseEntry>>,
    pid_bindings: Mutex<HashMap<u32, String>>,
    last_refresh_completed: Mutex<DateTime<Utc>>,

    refresh_gate: tokio::sync::Mutex<()>,
    refresh_queued: AtomicBool,
}

impl SessionMonitor {
    pub fn new(
        claude_roots: Vec<PathBuf>,
        codex_root: Option<PathBuf>,
        codex_scan_days: u32,
        offset_store: Arc<OffsetStore>,
    ) -> Self {
        Self {
            claude_roots,
            codex_root,
            codex_scan_days,
            process_pattern: "claude".into(),
            offset_store,
            snapshots: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            hook_phases: Mutex::new(HashMap::new()),
            pid_bindings: Mutex::new(HashMap::new()),
            last_refresh_completed: Mutex::new(DateTime::<Utc>::MIN_UTC),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_queued: AtomicBool::new(false),
        }
    }

    /// Default roots under the user's home directory.
    pub fn default_roots() -> Vec<PathBuf> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        vec![
            home.join(".claude").join("projects"),
            home.join(".claude-silba").join("projects"),
        ]
    }

    pub fn on_refresh(&self, listener: RefreshListener) {
        self.listeners.lock().push(listener);
    }

    /// Stale sessions are pruned from listings (they persist internally
    /// until the next refresh drops them).
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<SessionSnapshot> = self
            .snapshots
            .read()
            .values()
            .filter(|s| s.state != SnapshotState::Stale)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.snapshots.read().get(session_id).cloned()
    }

    /// Request a refresh. Coalesces: a call during an in-flight refresh
    /// queues exactly one follow-up pass.
    pub async fn refresh(&self) {
        match self.refresh_gate.try_lock() {
            Ok(_guard) => loop {
                self.refresh_once().await;
                if !self.refresh_queued.swap(false, Ordering::SeqCst) {
                    break;
                }
            },
            Err(_) => {
                self.refresh_queued.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn refresh_once(&self) {
        let now = Utc::now();
        let since_last = *self.last_refresh_completed.lock();

        let procs = process::scan(&self.process_pattern);

        let mut transcripts = Vec::new();
        for root in &self.claude_roots {
            transcripts.extend(list_transcripts(root));
        }

        for t in &transcripts {
            self.update_transcript_meta(t);
        }

        let assigned = {
            let mut bindings = self.pid_bindings.lock();
            match_processes(&procs, &transcripts, &mut bindings)
                .into_iter()
                .map(|(sid, proc)| (sid, proc.clone()))
                .collect::<HashMap<String, ProcessInfo>>()
        };

        let mut tick: HashMap<String, SessionSnapshot> = HashMap::new();
        for t in &transcripts {
            let snapshot = self.build_snapshot(t, assigned.get(&t.session_id), now, since_last);
            tick.insert(snapshot.session_id.clone(), snapshot);
        }

        if let Some(codex_root) = &self.codex_root {
            for rollout in codex::scan(codex_root, self.codex_scan_days, now) {
                if tick.contains_key(&rollout.session_id) {
                    continue;
                }
                let snapshot = codex_snapshot(&rollout, now);
                tick.insert(snapshot.session_id.clone(), snapshot);
            }
        }

        {
            let mut snapshots = self.snapshots.write();
            // Prune stale sessions that vanished from this tick.
            snapshots.retain(|sid, snap| {
                snap.state != SnapshotState::Stale || tick.contains_key(sid)
            });
            for (sid, snapshot) in tick {
                snapshots.insert(sid, snapshot);
            }
        }
        *self.last_refresh_completed.lock() = Utc::now();

        // Listener fan-out: sequential, errors logged and swallowed.
        let listeners: Vec<RefreshListener> = self.listeners.lock().clone();
        let visible = self.snapshots();
        for listener in listeners {
            if let Err(e) = listener(visible.clone()).await {
                tracing::warn!(error = %e, "refresh listener failed");
            }
        }
    }

    /// Re-tail the transcript when its mtime moved; rotation swaps in a
    /// fresh extractor.
    fn update_transcript_meta(&self, t: &TranscriptFile) {
        let inode = std::fs::metadata(&t.path)
            .map(|m| inode_of(&m))
            .unwrap_or(0);

        let extractor = {
            let mut cache = self.cache.lock();
            let entry = cache.entry(t.path.clone()).or_insert_with(|| TranscriptCacheEntry {
                mtime: DateTime::<Utc>::MIN_UTC,
                inode,
                extractor: Arc::new(Mutex::new(TranscriptExtractor::new())),
            });
            if entry.mtime == t.mtime && entry.inode == inode {
                return;
            }
            if entry.inode != inode {
                entry.extractor = Arc::new(Mutex::new(TranscriptExtractor::new()));
                entry.inode = inode;
            }
            entry.mtime = t.mtime;
            entry.extractor.clone()
        };

        let mut tailer = JsonlTailer::new(&t.path, self.offset_store.clone());
        let sink = extractor.clone();
        tailer.register_group("monitor", move |line| {
            sink.lock().feed(line);
            Ok(())
        });
        if let Err(e) = tailer.poll() {
            tracing::debug!(path = %t.path.display(), error = %e, "transcript tail failed");
        }
    }

    fn build_snapshot(
        &self,
        t: &TranscriptFile,
        proc: Option<&ProcessInfo>,
        now: DateTime<Utc>,
        since_last: DateTime<Utc>,
    ) -> SessionSnapshot {
        let cache = self.cache.lock();
        let extractor = cache.get(&t.path).map(|e| e.extractor.clone());
        drop(cache);

        let mut state = classify_state(t.mtime, now, proc.is_some());

        let (meta_phase, snapshot) = match extractor {
            Some(extractor) => {
                let ex = extractor.lock();
                let project_path = ex.cwd.clone().unwrap_or_default();
                let project_name = project_name_of(&project_path, &t.project_key);
                let slug = ex.slug.clone().unwrap_or_else(|| project_name.clone());
                let started_at = ex
                    .first_timestamp
                    .as_deref()
                    .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                let snapshot = SessionSnapshot {
                    provider: Provider::Claude,
                    session_id: t.session_id.clone(),
                    project_path,
                    project_name,
                    slug,
                    state,
                    pid: proc.map(|p| p.pid),
                    cpu_percent: proc.and_then(|p| p.cpu_percent),
                    mem_mb: proc.and_then(|p| p.mem_mb),
                    model: ex.model.clone(),
                    git_branch: ex.git_branch.clone(),
                    version: ex.version.clone(),
                    turn_count: ex.turn_count,
                    last_user_message: ex.last_user_message.clone(),
                    current_tools: ex.current_tools.clone(),
                    tokens: ex.tokens,
                    wait_reason: ex.wait_reason(),
                    wait_tool_names: ex.wait_tool_names(),
                    started_at,
                    last_activity: t.mtime,
                    activity_phase: None,
                    jsonl_path: t.path.clone(),
                };
                (Some(ex.activity_phase()), snapshot)
            }
            None => {
                let project_name = project_name_of("", &t.project_key);
                (
                    None,
                    SessionSnapshot {
                        provider: Provider::Claude,
                        session_id: t.session_id.clone(),
                        project_path: String::new(),
                        project_name: project_name.clone(),
                        slug: project_name,
                        state,
                        pid: proc.map(|p| p.pid),
                        cpu_percent: proc.and_then(|p| p.cpu_percent),
                        mem_mb: proc.and_then(|p| p.mem_mb),
                        model: None,
                        git_branch: None,
                        version: None,
                        turn_count: 0,
                        last_user_message: None,
                        current_tools: Vec::new(),
                        tokens: TokenUsage::default(),
                        wait_reason: None,
                        wait_tool_names: Vec::new(),
                        started_at: None,
                        last_activity: t.mtime,
                        activity_phase: None,
                        jsonl_path: t.path.clone(),
                    },
                )
            }
        };

        let mut snapshot = snapshot;

        // A hook phase written since the last refresh is authoritative.
        let hook_phase = self
            .hook_phases
            .lock()
            .get(&t.session_id)
            .filter(|entry| entry.at > since_last)
            .map(|entry| entry.phase);
        if let Some(phase) = hook_phase {
            state = SnapshotState::Active;
            snapshot.state = state;
            snapshot.activity_phase = Some(phase);
        } else if state == SnapshotState::Active {
            snapshot.activity_phase = meta_phase.or(Some(ActivityPhase::Busy));
        }
        snapshot.enforce_phase_invariant();
        snapshot
    }

    // ── Hook-driven mutations ──────────────────────────────────────────

    /// Create a minimal snapshot for a hook-announced session, or wake the
    /// existing one. Returns `true` when the session was new.
    pub fn register_session(&self, event: &HookSessionEvent) -> bool {
        let mut snapshots = self.snapshots.write();
        let now = Utc::now();
        if let Some(existing) = snapshots.get_mut(&event.session_id) {
            existing.state = SnapshotState::Active;
            existing.last_activity = now;
            existing.enforce_phase_invariant();
            return false;
        }

        let project_path = event.cwd.clone().unwrap_or_default();
        let project_name = project_name_of(&project_path, "");
        snapshots.insert(
            event.session_id.clone(),
            SessionSnapshot {
                provider: event.provider,
                session_id: event.session_id.clone(),
                project_path,
                project_name: project_name.clone(),
                slug: project_name,
                state: SnapshotState::Active,
                pid: None,
                cpu_percent: None,
                mem_mb: None,
                model: None,
                git_branch: None,
                version: None,
                turn_count: 0,
                last_user_message: None,
                current_tools: Vec::new(),
                tokens: TokenUsage::default(),
                wait_reason: None,
                wait_tool_names: Vec::new(),
                started_at: Some(now),
                last_activity: now,
                activity_phase: Some(ActivityPhase::Busy),
                jsonl_path: event.transcript_path.clone().unwrap_or_default(),
            },
        );
        true
    }

    pub fn update_session_state(&self, session_id: &str, state: SnapshotState) {
        if let Some(snapshot) = self.snapshots.write().get_mut(session_id) {
            snapshot.state = state;
            snapshot.last_activity = Utc::now();
            snapshot.enforce_phase_invariant();
        }
    }

    pub fn update_activity_phase(&self, session_id: &str, phase: ActivityPhase) {
        self.hook_phases.lock().insert(
            session_id.to_string(),
            HookPhaseEntry {
                phase,
                at: Utc::now(),
            },
        );
        if let Some(snapshot) = self.snapshots.write().get_mut(session_id) {
            snapshot.state = SnapshotState::Active;
            snapshot.activity_phase = Some(phase);
            snapshot.last_activity = Utc::now();
        }
    }

    // ── Background driving ─────────────────────────────────────────────

    /// Periodic full refresh.
    pub fn spawn_interval_refresh(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.refresh().await;
            }
        })
    }

    /// Watch the transcript roots and refresh after a quiet period.
    pub fn spawn_watcher(self: &Arc<Self>, debounce: Duration) -> tokio::task::JoinHandle<()> {
        use notify::{PollWatcher, RecursiveMode, Watcher};

        let monitor = self.clone();
        let roots = self.claude_roots.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
            let config =
                notify::Config::default().with_poll_interval(Duration::from_millis(1000));
            let mut watcher = match PollWatcher::new(
                move |event: Result<notify::Event, notify::Error>| {
                    if event.is_ok() {
                        let _ = tx.send(());
                    }
                },
                config,
            ) {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to create transcript watcher");
                    return;
                }
            };
            for root in &roots {
                if root.exists() {
                    if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                        tracing::warn!(root = %root.display(), error = %e, "watch failed");
                    }
                }
            }

            while rx.recv().await.is_some() {
                // Debounce: absorb the burst, then refresh once.
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                monitor.refresh().await;
            }
        })
    }
}

fn codex_snapshot(rollout: &codex::CodexRollout, now: DateTime<Utc>) -> SessionSnapshot {
    let state = classify_state(rollout.mtime, now, false);
    let project_path = rollout.cwd.clone().unwrap_or_default();
    let project_name = project_name_of(&project_path, "");
    let mut snapshot = SessionSnapshot {
        provider: Provider::Codex,
        session_id: rollout.session_id.clone(),
        project_path,
        project_name: project_name.clone(),
        slug: project_name,
        state,
        pid: None,
        cpu_percent: None,
        mem_mb: None,
        model: rollout.model.clone(),
        git_branch: None,
        version: None,
        turn_count: 0,
        last_user_message: None,
        current_tools: Vec::new(),
        tokens: TokenUsage::default(),
        wait_reason: None,
        wait_tool_names: Vec::new(),
        started_at: None,
        last_activity: rollout.mtime,
        activity_phase: None,
        jsonl_path: rollout.path.clone(),
    };
    if snapshot.state == SnapshotState::Active {
        snapshot.activity_phase = Some(ActivityPhase::Busy);
    }
    snapshot.enforce_phase_invariant();
    snapshot
}

fn project_name_of(project_path: &str, project_key: &str) -> String {
    if !project_path.is_empty() {
        if let Some(name) = Path::new(project_path).file_name() {
            return name.to_string_lossy().to_string();
        }
    }
    project_key
        .rsplit('-')
        .next()
        .unwrap_or(project_key)
        .to_string()
}

#[cfg(target_family = "unix")]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(target_family = "unix"))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}
