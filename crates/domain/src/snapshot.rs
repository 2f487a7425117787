//! Monitor-produced session snapshots.
//!
//! A [`SessionSnapshot`] is the monitor's reconstruction of one running (or
//! recently running) assistant session, correlated from the process table,
//! the session's transcript file, and out-of-band hook events. Snapshots
//! are immutable per refresh tick; only hook-driven phase/state updates
//! write single fields between ticks.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::TokenUsage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which backend a session belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Provider {
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "codex-app-server")]
    CodexAppServer,
    #[serde(rename = "claude")]
    Claude,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Codex => "codex",
            Provider::CodexAppServer => "codex-app-server",
            Provider::Claude => "claude",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Provider::Codex),
            "codex-app-server" => Ok(Provider::CodexAppServer),
            "claude" => Ok(Provider::Claude),
            other => Err(crate::Error::Config(format!("unknown provider: {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coarse lifecycle state, classified by transcript recency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Active,
    Idle,
    Completed,
    Stale,
}

/// Sub-state within `Active`: what the agent is doing or waiting on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPhase {
    Busy,
    Interactable,
    WaitingPermission,
    WaitingQuestion,
}

/// Why an active session is blocked on the human, if it is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    UserQuestion,
    Permission,
}

/// Classify a session by the age of its last transcript mutation.
///
/// Under one hour of silence, a still-running process keeps the session at
/// `Idle` rather than `Completed`.
pub fn classify_state(last_activity: DateTime<Utc>, now: DateTime<Utc>, has_process: bool) -> SnapshotState {
    let age = now.signed_duration_since(last_activity);
    if age < Duration::minutes(5) {
        SnapshotState::Active
    } else if age < Duration::hours(1) {
        if has_process {
            SnapshotState::Idle
        } else {
            SnapshotState::Completed
        }
    } else if age < Duration::hours(24) {
        SnapshotState::Completed
    } else {
        SnapshotState::Stale
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionSnapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub provider: Provider,
    pub session_id: String,
    pub project_path: String,
    pub project_name: String,
    pub slug: String,
    pub state: SnapshotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub turn_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<String>,
    #[serde(default)]
    pub current_tools: Vec<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<WaitReason>,
    #[serde(default)]
    pub wait_tool_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    /// Non-`None` iff `state == Active`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_phase: Option<ActivityPhase>,
    pub jsonl_path: PathBuf,
}

impl SessionSnapshot {
    /// `provider:sessionId`, the key used by discovery and watch state.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.session_id)
    }

    /// Re-establish the phase/state invariant after a state write.
    pub fn enforce_phase_invariant(&mut self) {
        match self.state {
            SnapshotState::Active => {
                if self.activity_phase.is_none() {
                    self.activity_phase = Some(ActivityPhase::Busy);
                }
            }
            _ => self.activity_phase = None,
        }
    }
}

/// Truncate to at most `max` characters, appending an ellipsis when
/// anything was cut. Operates on char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}
