//! The cron engine.
//!
//! All mutations (start, add, update, remove, ad-hoc run, timer tick) are
//! serialized through one async lock, so at most one CRUD/run critical
//! section is active. Readers observe the in-memory job list without
//! locking the critical section.
//!
//! A single timer targets the minimum `next_run_at` across enabled jobs,
//! clamped to ~24.8 days. Each pass runs every eligible job (enabled, due,
//! not already running — unless the run is stuck past the threshold and
//! gets force-cleared), races the action against the job's timeout,
//! records the outcome in the store and the append-only run log, then
//! persists once and re-arms.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use sb_domain::config::CronConfig;
use sb_domain::{Error, Result};

use super::cron_expr::CronExpr;
use super::model::{
    compute_next_run, CronAction, CronJob, CronJobPatch, CronSchedule, CronStoreFile, JobSource,
    JobState, RunStatus,
};
use super::runlog::{RunLog, RunLogEntry};
use super::store::CronStore;

/// Longest single timer arm; longer gaps re-arm when this expires.
const MAX_TIMER_MS: i64 = i32::MAX as i64;

/// Executes one job's action. Injected so the engine stays testable.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, job: &CronJob) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum CronEvent {
    Started { job_id: String },
    Finished { job_id: String, status: RunStatus },
}

/// Creation parameters for `add`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub delete_after_run: bool,
    pub source: JobSource,
    pub timeout_ms: Option<u64>,
    pub schedule: CronSchedule,
    pub action: CronAction,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CronStatus {
    pub job_count: usize,
    pub enabled_count: usize,
    pub running_count: usize,
    pub next_run_at_ms: Option<i64>,
}

pub struct CronScheduler {
    store: CronStore,
    runlog: RunLog,
    executor: Arc<dyn ActionExecutor>,
    config: CronConfig,
    jobs: RwLock<Vec<CronJob>>,
    op_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    events: broadcast::Sender<CronEvent>,
}

impl CronScheduler {
    pub fn new(state_dir: &Path, executor: Arc<dyn ActionExecutor>, config: CronConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store: CronStore::new(state_dir),
            runlog: RunLog::new(state_dir),
            executor,
            config,
            jobs: RwLock::new(Vec::new()),
            op_lock: tokio::sync::Mutex::new(()),
            timer: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.events.subscribe()
    }

    // ── Operations (serialized) ────────────────────────────────────────

    /// Load the store, seed missing next-run times, arm the timer. An
    /// overdue job keeps its overdue instant so the timer fires at once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let file = self.store.load()?;
        let now_ms = Utc::now().timestamp_millis();
        let mut jobs = file.jobs;
        for job in &mut jobs {
            if job.enabled && job.state.next_run_at_ms.is_none() {
                job.state.next_run_at_ms = compute_next_run(job, now_ms);
            }
        }
        let count = jobs.len();
        *self.jobs.write() = jobs;
        self.persist()?;
        tracing::info!(count, "cron scheduler started");
        self.arm_timer();
        Ok(())
    }

    pub async fn add(self: &Arc<Self>, new: NewJob) -> Result<CronJob> {
        let _op = self.op_lock.lock().await;
        if let CronSchedule::Cron { expr, .. } = &new.schedule {
            CronExpr::parse(expr)?;
        }
        let now_ms = Utc::now().timestamp_millis();
        let mut job = CronJob {
            id: short_id(),
            name: new.name,
            description: new.description,
            enabled: new.enabled,
            delete_after_run: new.delete_after_run,
            source: new.source,
            timeout_ms: new.timeout_ms,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            schedule: new.schedule,
            action: new.action,
            state: JobState::default(),
        };
        if job.enabled {
            job.state.next_run_at_ms = compute_next_run(&job, now_ms);
        }
        self.jobs.write().push(job.clone());
        self.persist()?;
        self.arm_timer();
        Ok(job)
    }

    /// Field-merge patch; a schedule change recomputes the next run.
    pub async fn update(self: &Arc<Self>, id: &str, patch: CronJobPatch) -> Result<CronJob> {
        let _op = self.op_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        let updated = {
            let mut jobs = self.jobs.write();
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| Error::Store(format!("no such job: {id}")))?;

            if let Some(schedule) = patch.schedule {
                if let CronSchedule::Cron { expr, .. } = &schedule {
                    CronExpr::parse(expr)?;
                }
                if schedule != job.schedule {
                    job.schedule = schedule;
                    job.state.next_run_at_ms = None;
                    job.state.next_run_at_ms = compute_next_run(job, now_ms);
                }
            }
            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(description) = patch.description {
                job.description = description;
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
                if enabled && job.state.next_run_at_ms.is_none() {
                    job.state.next_run_at_ms = compute_next_run(job, now_ms);
                }
            }
            if let Some(delete_after_run) = patch.delete_after_run {
                job.delete_after_run = delete_after_run;
            }
            if let Some(timeout_ms) = patch.timeout_ms {
                job.timeout_ms = timeout_ms;
            }
            if let Some(action) = patch.action {
                job.action = action;
            }
            job.updated_at_ms = now_ms;
            job.clone()
        };
        self.persist()?;
        self.arm_timer();
        Ok(updated)
    }

    /// Remove a job and its run-log file.
    pub async fn remove(self: &Arc<Self>, id: &str) -> bool {
        let _op = self.op_lock.lock().await;
        let removed = {
            let mut jobs = self.jobs.write();
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            jobs.len() != before
        };
        if removed {
            self.runlog.remove(id);
            if let Err(e) = self.persist() {
                tracing::warn!(error = %e, "persist after remove failed");
            }
            self.arm_timer();
        }
        removed
    }

    /// Ad-hoc execution, bypassing the schedule but updating last-run
    /// state and the run log.
    pub async fn run_now(self: &Arc<Self>, id: &str) -> Result<RunLogEntry> {
        let _op = self.op_lock.lock().await;
        let job = self
            .jobs
            .read()
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| Error::Store(format!("no such job: {id}")))?;

        let entry = self.execute_one(&job, true).await;
        self.persist()?;
        self.arm_timer();
        Ok(entry)
    }

    // ── Readers (no critical section) ──────────────────────────────────

    pub fn list(&self) -> Vec<CronJob> {
        self.jobs.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.jobs.read().iter().find(|j| j.id == id).cloned()
    }

    pub fn status(&self) -> CronStatus {
        let jobs = self.jobs.read();
        CronStatus {
            job_count: jobs.len(),
            enabled_count: jobs.iter().filter(|j| j.enabled).count(),
            running_count: jobs.iter().filter(|j| j.state.running_at_ms.is_some()).count(),
            next_run_at_ms: jobs
                .iter()
                .filter(|j| j.enabled)
                .filter_map(|j| j.state.next_run_at_ms)
                .min(),
        }
    }

    pub fn runs(&self, id: &str, limit: usize) -> Vec<RunLogEntry> {
        self.runlog.read(id, limit)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    // ── Timer ──────────────────────────────────────────────────────────

    fn arm_timer(self: &Arc<Self>) {
        let now_ms = Utc::now().timestamp_millis();
        // In-flight jobs stay in the minimum: their due window still needs
        // a tick, which records it as skipped.
        let next = self
            .jobs
            .read()
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min();

        let mut timer = self.timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let Some(next) = next else {
            return;
        };

        let delay_ms = (next - now_ms).clamp(0, MAX_TIMER_MS) as u64;
        let scheduler = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            scheduler.tick().await;
        }));
    }

    async fn tick(self: Arc<Self>) {
        let _op = self.op_lock.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        let stuck_ms = (self.config.stuck_run_hours * 3_600_000) as i64;

        // Partition the due jobs: runnable (idle, or stuck past the
        // threshold and force-cleared) vs skipped (a previous run is
        // still in flight).
        let mut runnable = Vec::new();
        let mut skipped = Vec::new();
        for job in self.jobs.read().iter() {
            if !job.enabled {
                continue;
            }
            let due = job.state.next_run_at_ms.map(|n| n <= now_ms).unwrap_or(false);
            if !due {
                continue;
            }
            match job.state.running_at_ms {
                None => runnable.push(job.clone()),
                Some(running_at) if now_ms - running_at >= stuck_ms => {
                    tracing::warn!(job_id = %job.id, "force-clearing stuck run");
                    runnable.push(job.clone());
                }
                Some(_) => skipped.push(job.clone()),
            }
        }

        for job in skipped {
            self.record_skip(&job, now_ms);
        }
        for job in runnable {
            self.execute_one(&job, false).await;
        }

        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "cron store persist failed");
        }
        self.arm_timer();
    }

    /// A due window overlapped an in-flight run: record the skip in the
    /// job state and run log, and advance the schedule. The in-flight
    /// run keeps ownership of `running_at` and the last-run fields; a
    /// one-shot's window is spent, so its next-run unsets.
    fn record_skip(&self, job: &CronJob, now_ms: i64) {
        {
            let mut jobs = self.jobs.write();
            if let Some(j) = jobs.iter_mut().find(|j| j.id == job.id) {
                j.state.last_status = Some(RunStatus::Skipped);
                j.state.next_run_at_ms =
                    compute_next_run(j, now_ms).filter(|next| *next > now_ms);
            }
        }
        let entry = RunLogEntry {
            at_ms: now_ms,
            status: RunStatus::Skipped,
            error: None,
            duration_ms: 0,
            adhoc: false,
        };
        if let Err(e) = self.runlog.append(&job.id, &entry) {
            tracing::warn!(job_id = %job.id, error = %e, "run log append failed");
        }
        let _ = self.events.send(CronEvent::Finished {
            job_id: job.id.clone(),
            status: RunStatus::Skipped,
        });
        tracing::info!(job_id = %job.id, "previous run still in flight, window skipped");
    }

    /// Run one job: mark running, emit `Started`, race the action against
    /// its timeout, record the outcome, clear running, recompute (or drop
    /// on `delete_after_run`), append the run log, emit `Finished`.
    async fn execute_one(&self, job: &CronJob, adhoc: bool) -> RunLogEntry {
        let fired_at_ms = Utc::now().timestamp_millis();
        self.with_job(&job.id, |j| j.state.running_at_ms = Some(fired_at_ms));
        let _ = self.events.send(CronEvent::Started {
            job_id: job.id.clone(),
        });
        tracing::info!(job_id = %job.id, name = %job.name, adhoc, "cron run started");

        let timeout_ms = job.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let started = std::time::Instant::now();
        let outcome = if timeout_ms == 0 {
            self.executor.execute(job).await
        } else {
            match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.executor.execute(job),
            )
            .await
            {
                Ok(result) => result,
                // The action may still complete externally; it is
                // reported as an error regardless.
                Err(_) => Err(Error::Timeout(format!("action exceeded {timeout_ms}ms"))),
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Ok, None),
            Err(e) => (RunStatus::Error, Some(e.to_string())),
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut dropped = false;
        {
            let mut jobs = self.jobs.write();
            if let Some(j) = jobs.iter_mut().find(|j| j.id == job.id) {
                j.state.running_at_ms = None;
                j.state.last_run_at_ms = Some(fired_at_ms);
                j.state.last_status = Some(status);
                j.state.last_error = error.clone();
                j.state.last_duration_ms = Some(duration_ms);
                if j.delete_after_run {
                    dropped = true;
                } else {
                    // The old `next_run_at` stays visible to the
                    // computation: an `every` job anchors its next firing
                    // on the expected fire time, not the actual one.
                    j.state.next_run_at_ms = compute_next_run(j, now_ms);
                }
            }
            if dropped {
                jobs.retain(|j| j.id != job.id);
            }
        }

        let entry = RunLogEntry {
            at_ms: fired_at_ms,
            status,
            error,
            duration_ms,
            adhoc,
        };
        if let Err(e) = self.runlog.append(&job.id, &entry) {
            tracing::warn!(job_id = %job.id, error = %e, "run log append failed");
        }
        let _ = self.events.send(CronEvent::Finished {
            job_id: job.id.clone(),
            status,
        });
        tracing::info!(job_id = %job.id, ?status, duration_ms, "cron run finished");
        entry
    }

    fn with_job(&self, id: &str, f: impl FnOnce(&mut CronJob)) {
        if let Some(job) = self.jobs.write().iter_mut().find(|j| j.id == id) {
            f(job);
        }
    }

    fn persist(&self) -> Result<()> {
        let file = CronStoreFile {
            version: 1,
            jobs: self.jobs.read().clone(),
        };
        self.store.save(&file)
    }
}

/// Opaque 8-char job id.
fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopExecutor {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl NoopExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl ActionExecutor for NoopExecutor {
        async fn execute(&self, _job: &CronJob) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                Err(Error::Other("action failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn new_job(schedule: CronSchedule) -> NewJob {
        NewJob {
            name: "job".into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            source: JobSource::User,
            timeout_ms: None,
            schedule,
            action: CronAction::Shell {
                command: "true".into(),
                cwd: None,
            },
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn add_assigns_short_id_and_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::new(dir.path(), NoopExecutor::new(), CronConfig::default());
        let job = scheduler
            .add(new_job(CronSchedule::Every {
                every_ms: 3_600_000,
                anchor_ms: None,
            }))
            .await
            .unwrap();
        assert_eq!(job.id.len(), 8);
        assert!(job.state.next_run_at_ms.is_some());
        assert_eq!(scheduler.list().len(), 1);
    }

    #[tokio::test]
    async fn invalid_cron_expression_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::new(dir.path(), NoopExecutor::new(), CronConfig::default());
        let err = scheduler
            .add(new_job(CronSchedule::Cron {
                expr: "bogus".into(),
                tz: None,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn overdue_every_job_fires_immediately_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let now_ms = Utc::now().timestamp_millis();

        // Seed a store whose job is 30s overdue.
        let store = CronStore::new(dir.path());
        let mut file = CronStoreFile::new();
        file.jobs.push(CronJob {
            id: "seed0001".into(),
            name: "overdue".into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            source: JobSource::Code,
            timeout_ms: None,
            created_at_ms: now_ms - 120_000,
            updated_at_ms: now_ms - 120_000,
            schedule: CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            action: CronAction::Shell {
                command: "true".into(),
                cwd: None,
            },
            state: JobState {
                next_run_at_ms: Some(now_ms - 30_000),
                ..Default::default()
            },
        });
        store.save(&file).unwrap();

        let executor = NoopExecutor::new();
        let scheduler = CronScheduler::new(dir.path(), executor.clone(), CronConfig::default());
        scheduler.start().await.unwrap();

        wait_for("overdue job to run", || {
            scheduler
                .get("seed0001")
                .and_then(|j| j.state.last_status)
                == Some(RunStatus::Ok)
        })
        .await;

        let job = scheduler.get("seed0001").unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(job.state.running_at_ms.is_none());
        // Next run advanced one period past the overdue fire time.
        let next = job.state.next_run_at_ms.unwrap();
        assert!(next > now_ms, "next must be in the future, got {next}");
        scheduler.stop();
    }

    #[tokio::test]
    async fn timed_out_action_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(NoopExecutor {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
            fail: false,
        });
        let scheduler = CronScheduler::new(dir.path(), executor, CronConfig::default());
        let mut job = new_job(CronSchedule::At {
            at_ms: Utc::now().timestamp_millis(),
        });
        job.timeout_ms = Some(50);
        let added = scheduler.add(job).await.unwrap();

        let entry = scheduler.run_now(&added.id).await.unwrap();
        assert_eq!(entry.status, RunStatus::Error);
        assert!(entry.error.unwrap().contains("50ms"));
        scheduler.stop();
    }

    #[tokio::test]
    async fn failing_action_records_error_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(NoopExecutor {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let scheduler = CronScheduler::new(dir.path(), executor, CronConfig::default());
        let added = scheduler
            .add(new_job(CronSchedule::Every {
                every_ms: 3_600_000,
                anchor_ms: None,
            }))
            .await
            .unwrap();

        scheduler.run_now(&added.id).await.unwrap();
        let job = scheduler.get(&added.id).unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Error));
        assert_eq!(job.state.last_error.as_deref(), Some("action failed"));

        let runs = scheduler.runs(&added.id, 10);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Error);
        assert!(runs[0].adhoc);
        scheduler.stop();
    }

    #[tokio::test]
    async fn delete_after_run_drops_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::new(dir.path(), NoopExecutor::new(), CronConfig::default());
        let mut new = new_job(CronSchedule::At {
            at_ms: Utc::now().timestamp_millis() - 1_000,
        });
        new.delete_after_run = true;
        let added = scheduler.add(new).await.unwrap();
        scheduler.start().await.unwrap();

        wait_for("one-shot job to vanish", || scheduler.get(&added.id).is_none()).await;

        // The run still left a log entry.
        assert_eq!(scheduler.runs(&added.id, 10).len(), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn stuck_run_is_force_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let now_ms = Utc::now().timestamp_millis();

        let store = CronStore::new(dir.path());
        let mut file = CronStoreFile::new();
        file.jobs.push(CronJob {
            id: "stuck001".into(),
            name: "stuck".into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            source: JobSource::Code,
            timeout_ms: None,
            created_at_ms: now_ms - 10 * 3_600_000,
            updated_at_ms: now_ms,
            schedule: CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            action: CronAction::Shell {
                command: "true".into(),
                cwd: None,
            },
            state: JobState {
                next_run_at_ms: Some(now_ms - 1_000),
                running_at_ms: Some(now_ms - 3 * 3_600_000),
                ..Default::default()
            },
        });
        store.save(&file).unwrap();

        let executor = NoopExecutor::new();
        let scheduler = CronScheduler::new(dir.path(), executor.clone(), CronConfig::default());
        scheduler.start().await.unwrap();

        wait_for("stuck job to re-run", || {
            executor.calls.load(Ordering::SeqCst) >= 1
        })
        .await;
        scheduler.stop();
    }

    #[tokio::test]
    async fn due_window_during_inflight_run_is_recorded_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let now_ms = Utc::now().timestamp_millis();

        // A fresh (non-stuck) run marker, left by a process that is still
        // working, with the next window already due.
        let store = CronStore::new(dir.path());
        let mut file = CronStoreFile::new();
        file.jobs.push(CronJob {
            id: "busy0001".into(),
            name: "busy".into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            source: JobSource::Code,
            timeout_ms: None,
            created_at_ms: now_ms - 3_600_000,
            updated_at_ms: now_ms,
            schedule: CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            action: CronAction::Shell {
                command: "true".into(),
                cwd: None,
            },
            state: JobState {
                next_run_at_ms: Some(now_ms - 1_000),
                running_at_ms: Some(now_ms - 600_000),
                ..Default::default()
            },
        });
        store.save(&file).unwrap();

        let executor = NoopExecutor::new();
        let scheduler = CronScheduler::new(dir.path(), executor.clone(), CronConfig::default());
        scheduler.start().await.unwrap();

        wait_for("window to be skipped", || {
            scheduler
                .get("busy0001")
                .and_then(|j| j.state.last_status)
                == Some(RunStatus::Skipped)
        })
        .await;

        let job = scheduler.get("busy0001").unwrap();
        assert_eq!(
            executor.calls.load(Ordering::SeqCst),
            0,
            "the in-flight run must not be doubled"
        );
        assert_eq!(
            job.state.running_at_ms,
            Some(now_ms - 600_000),
            "the in-flight marker stays untouched"
        );
        assert!(job.state.last_run_at_ms.is_none());
        assert!(job.state.next_run_at_ms.unwrap() > now_ms, "window advanced");

        let runs = scheduler.runs("busy0001", 10);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Skipped);
        assert_eq!(runs[0].duration_ms, 0);
        assert!(!runs[0].adhoc);
        scheduler.stop();
    }

    #[tokio::test]
    async fn update_schedule_recomputes_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::new(dir.path(), NoopExecutor::new(), CronConfig::default());
        let added = scheduler
            .add(new_job(CronSchedule::Every {
                every_ms: 3_600_000,
                anchor_ms: None,
            }))
            .await
            .unwrap();
        let first_next = added.state.next_run_at_ms.unwrap();

        let updated = scheduler
            .update(
                &added.id,
                CronJobPatch {
                    schedule: Some(CronSchedule::Every {
                        every_ms: 60_000,
                        anchor_ms: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second_next = updated.state.next_run_at_ms.unwrap();
        assert!(second_next < first_next);
        scheduler.stop();
    }

    #[tokio::test]
    async fn remove_deletes_job_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::new(dir.path(), NoopExecutor::new(), CronConfig::default());
        let added = scheduler
            .add(new_job(CronSchedule::Every {
                every_ms: 3_600_000,
                anchor_ms: None,
            }))
            .await
            .unwrap();
        scheduler.run_now(&added.id).await.unwrap();
        assert_eq!(scheduler.runs(&added.id, 10).len(), 1);

        assert!(scheduler.remove(&added.id).await);
        assert!(!scheduler.remove(&added.id).await);
        assert!(scheduler.runs(&added.id, 10).is_empty());
        scheduler.stop();
    }

    #[tokio::test]
    async fn events_fire_started_then_finished() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::new(dir.path(), NoopExecutor::new(), CronConfig::default());
        let mut events = scheduler.subscribe();
        let added = scheduler
            .add(new_job(CronSchedule::Every {
                every_ms: 3_600_000,
                anchor_ms: None,
            }))
            .await
            .unwrap();
        scheduler.run_now(&added.id).await.unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, CronEvent::Started { ref job_id } if *job_id == added.id));
        let second = events.recv().await.unwrap();
        assert!(matches!(
            second,
            CronEvent::Finished { status: RunStatus::Ok, .. }
        ));
        scheduler.stop();
    }
}
