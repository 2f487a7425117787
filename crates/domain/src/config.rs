//! Switchboard configuration.
//!
//! Loaded from a TOML file; every field has a serde default so a missing or
//! empty config file yields a runnable instance. `Config::validate` returns
//! severity-tagged issues; the binary refuses to start on errors and logs
//! warnings.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Environment variable holding the optional API bearer token.
    /// Unset or empty = no auth (single-owner local deployment).
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            api_token_env: d_api_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root for all persisted state (cron store, route db, watch state...).
    #[serde(default = "d_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { dir: d_state_dir() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tailer poll interval in milliseconds.
    #[serde(default = "d_500")]
    pub poll_ms: u64,
    /// Debounce applied to filesystem watch events before a refresh.
    #[serde(default = "d_10")]
    pub watch_debounce_secs: u64,
    /// How many days of Codex rollout files to scan.
    #[serde(default = "d_2")]
    pub codex_scan_days: u32,
    /// Extra transcript roots scanned in addition to the defaults
    /// (`~/.claude/projects`, `~/.claude-silba/projects`).
    #[serde(default)]
    pub extra_transcript_roots: Vec<PathBuf>,
    /// Periodic full-refresh interval in seconds.
    #[serde(default = "d_30")]
    pub refresh_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_ms: 500,
            watch_debounce_secs: 10,
            codex_scan_days: 2,
            extra_transcript_roots: Vec::new(),
            refresh_interval_secs: 30,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat egress throttle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Window within which same-`merge_key` text payloads are folded.
    #[serde(default = "d_300")]
    pub merge_window_ms: u64,
    /// Per-channel queue cap; the oldest queued item is dropped on excess.
    #[serde(default = "d_100")]
    pub channel_max_queue_size: usize,
    /// Per-channel limiter: max requests per window.
    #[serde(default = "d_5")]
    pub channel_limit: u32,
    #[serde(default = "d_5000")]
    pub channel_window_ms: u64,
    /// Global limiter: max requests per window.
    #[serde(default = "d_50")]
    pub global_limit: u32,
    #[serde(default = "d_1000_ms")]
    pub global_window_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            merge_window_ms: 300,
            channel_max_queue_size: 100,
            channel_limit: 5,
            channel_window_ms: 5_000,
            global_limit: 50,
            global_window_ms: 1_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-thread discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Snapshot states that qualify a newly seen session for a thread.
    #[serde(default = "d_target_states")]
    pub target_states: Vec<String>,
    /// Project-path prefixes that are never bridged.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Channel used when no registry entry matches the project path.
    #[serde(default)]
    pub fallback_channel: Option<String>,
    /// Send a summary embed right after creating a thread.
    #[serde(default = "d_true")]
    pub initial_embed: bool,
    /// Per-session monitor-log interval in minutes.
    #[serde(default = "d_10")]
    pub watch_interval_min: u64,
    /// Path-prefix → channel registry file. Overridden by the
    /// `SWITCHBOARD_CHANNELS_FILE` environment variable.
    #[serde(default)]
    pub channels_file: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_states: d_target_states(),
            exclude_paths: Vec::new(),
            fallback_channel: None,
            initial_embed: true,
            watch_interval_min: 10,
            channels_file: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Default per-job action timeout in milliseconds.
    #[serde(default = "d_30000")]
    pub default_timeout_ms: u64,
    /// A run older than this is considered stuck and force-cleared.
    #[serde(default = "d_stuck_hours")]
    pub stuck_run_hours: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            stuck_run_hours: 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Binary used by the subprocess line-JSON adapter.
    #[serde(default = "d_claude_bin")]
    pub claude_bin: String,
    /// Binary spawned by the JSON-RPC app-server adapter.
    #[serde(default = "d_codex_bin")]
    pub codex_app_server_bin: String,
    /// Max concurrent CLI subprocesses. Overridden by the
    /// `CLAUDE_MAX_CONCURRENT` environment variable.
    #[serde(default = "d_3")]
    pub max_concurrent: usize,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            claude_bin: d_claude_bin(),
            codex_app_server_bin: d_codex_bin(),
            max_concurrent: 3,
        }
    }
}

impl ProvidersConfig {
    /// Effective subprocess cap, honoring `CLAUDE_MAX_CONCURRENT`.
    pub fn effective_max_concurrent(&self) -> usize {
        std::env::var("CLAUDE_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.max_concurrent)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    /// Prefix for chat component custom ids.
    #[serde(default = "d_prefix")]
    pub custom_id_prefix: String,
    /// Advisory bound on simultaneously pending requests.
    #[serde(default = "d_1000")]
    pub max_pending: usize,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            custom_id_prefix: d_prefix(),
            max_pending: 1_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}", self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.throttle.channel_max_queue_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "throttle.channel_max_queue_size must be > 0".into(),
            });
        }
        if self.throttle.channel_limit == 0 || self.throttle.global_limit == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "throttle limits must be > 0".into(),
            });
        }
        if self.providers.max_concurrent == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "providers.max_concurrent must be > 0".into(),
            });
        }
        if self.discovery.enabled && self.discovery.target_states.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "discovery enabled with empty target_states — nothing will be bridged".into(),
            });
        }
        for state in &self.discovery.target_states {
            if !matches!(state.as_str(), "active" | "idle" | "completed" | "stale") {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("discovery.target_states: unknown state {state:?}"),
                });
            }
        }
        if self.cron.default_timeout_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "cron.default_timeout_ms = 0 disables the action timeout".into(),
            });
        }

        issues
    }

    /// Resolve the channel registry file, honoring the env override.
    pub fn channels_file(&self) -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SWITCHBOARD_CHANNELS_FILE") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        self.discovery.channels_file.clone()
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    4488
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_api_token_env() -> String {
    "SWITCHBOARD_API_TOKEN".into()
}
fn d_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}
fn d_target_states() -> Vec<String> {
    vec!["active".into()]
}
fn d_claude_bin() -> String {
    "claude".into()
}
fn d_codex_bin() -> String {
    "codex".into()
}
fn d_prefix() -> String {
    "sbx".into()
}
fn d_true() -> bool {
    true
}
fn d_2() -> u32 {
    2
}
fn d_3() -> usize {
    3
}
fn d_5() -> u32 {
    5
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_50() -> u32 {
    50
}
fn d_100() -> usize {
    100
}
fn d_300() -> u64 {
    300
}
fn d_500() -> u64 {
    500
}
fn d_1000() -> usize {
    1_000
}
fn d_1000_ms() -> u64 {
    1_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_stuck_hours() -> u64 {
    2
}
