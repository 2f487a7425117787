//! Cron job data model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::cron_expr::{parse_tz, CronExpr};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// One-shot: fire at `at_ms`, then never again.
    At { at_ms: i64 },
    /// Fixed interval anchored at `anchor_ms` (or the job's own history).
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// 5-field cron expression, evaluated in `tz` (UTC when unset).
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronAction {
    /// Run a shell command.
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Send a message through the chat egress pipeline.
    ChatMessage { channel_id: String, text: String },
    /// POST a JSON payload to a URL.
    Webhook { url: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Code,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    /// Set while a run is in flight; a value older than the stuck
    /// threshold is force-cleared by the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    /// Opaque 8-char id assigned at creation.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    pub source: JobSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: CronSchedule,
    pub action: CronAction,
    #[serde(default)]
    pub state: JobState,
}

/// Versioned on-disk shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronStoreFile {
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

impl CronStoreFile {
    pub fn new() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

/// Field-merge patch applied by `update`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub delete_after_run: Option<bool>,
    pub timeout_ms: Option<Option<u64>>,
    pub schedule: Option<CronSchedule>,
    pub action: Option<CronAction>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Next-run computation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compute the next firing time for a job, in epoch millis.
///
/// - `At`: the configured instant until it has run, then unset.
/// - `Every`: the next multiple of `every_ms` past the anchor. The anchor
///   defaults to `next_run_at ?? last_run_at ?? created_at`, so an overdue
///   job keeps its overdue instant and the timer fires immediately.
/// - `Cron`: next expression match in the configured timezone.
pub fn compute_next_run(job: &CronJob, now_ms: i64) -> Option<i64> {
    match &job.schedule {
        CronSchedule::At { at_ms } => {
            let already_ran = job
                .state
                .last_run_at_ms
                .map(|last| last >= *at_ms)
                .unwrap_or(false);
            if already_ran {
                None
            } else {
                Some(*at_ms)
            }
        }
        CronSchedule::Every { every_ms, anchor_ms } => {
            let every = (*every_ms).max(1);
            let anchor = anchor_ms
                .or(job.state.next_run_at_ms)
                .or(job.state.last_run_at_ms)
                .unwrap_or(job.created_at_ms);
            if now_ms < anchor {
                Some(anchor)
            } else {
                let periods = (now_ms - anchor) / every + 1;
                Some(anchor + periods * every)
            }
        }
        CronSchedule::Cron { expr, tz } => {
            let tz = parse_tz(tz.as_deref().unwrap_or("UTC"));
            let parsed = CronExpr::parse(expr).ok()?;
            let now = chrono::DateTime::from_timestamp_millis(now_ms)?;
            parsed.next_after(&now, tz).map(|dt| dt.timestamp_millis())
        }
    }
}
