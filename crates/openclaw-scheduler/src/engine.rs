use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::schedule::{compute_next_run, next_after_anti_spin};
use crate::types::{
    CronJob, Delivery, JobPayload, JobRunOutcome, JobState, LastStatus, RunCause, Schedule,
    SessionTarget, WakeMode,
};

/// Master timer never sleeps longer than this, so a config or manual-run
/// change is picked up within a bounded window instead of after an
/// arbitrarily long nap.
pub const MAX_TIMER_DELAY_MS: i64 = 60_000;

/// Collaborator that actually performs a job's effect. The scheduler only
/// owns timing, persistence, and delivery routing — not the session/agent
/// machinery, which lives in `openclaw-agent`/`openclaw-sessions` and is
/// wired in by whoever constructs the [`Scheduler`] (the gateway).
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Append a synthetic system event to the job's target session.
    async fn run_system_event(
        &self,
        job: &CronJob,
        text: &str,
    ) -> std::result::Result<Option<String>, String>;

    /// Drive a full agent turn (main or isolated, per `job.session_target`).
    async fn run_agent_turn(
        &self,
        job: &CronJob,
        message: Option<&str>,
        timeout_seconds: u64,
        allow_unsafe_external_content: bool,
    ) -> std::result::Result<Option<String>, String>;

    /// Deliver a summary through the normal channel adapter path.
    async fn announce(
        &self,
        channel: &str,
        to: &str,
        summary: &str,
    ) -> std::result::Result<(), String>;
}

/// Fields accepted when creating a job. `enabled` missing means enabled.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    pub enabled: Option<bool>,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    pub session_key: Option<String>,
    pub wake_mode: WakeMode,
    pub payload: JobPayload,
    pub delivery: Delivery,
    pub delete_after_run: Option<bool>,
    pub stagger_ms: Option<i64>,
}

/// Partial update — `None` means "leave unchanged". Only `schedule` being
/// `Some` triggers a `next_run_at_ms` recompute; every other field is a pure
/// metadata change.
#[derive(Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<Schedule>,
    pub session_target: Option<SessionTarget>,
    pub session_key: Option<String>,
    pub wake_mode: Option<WakeMode>,
    pub payload: Option<JobPayload>,
    pub delivery: Option<Delivery>,
    pub delete_after_run: Option<bool>,
    pub stagger_ms: Option<i64>,
}

/// Result of a manual `run()` call.
pub struct RunOutcome {
    pub ran: bool,
    pub reason: Option<&'static str>,
    pub result: Option<JobRunOutcome>,
}

fn validate_delivery(delivery: &Delivery) -> Result<()> {
    if let Delivery::Webhook { to, .. } = delivery {
        let trimmed = to.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(SchedulerError::InvalidWebhookUrl(to.clone()));
        }
    }
    Ok(())
}

/// Persisted cron job store + tick loop.
///
/// Jobs live in a single SQLite table as a JSON document (`doc`) with
/// `next_run_at_ms` denormalized for the polling query, and a `running`
/// flag enforcing the "one in-flight execution per job" invariant across
/// both the tick loop and manual `run()` calls.
pub struct Scheduler {
    conn: Mutex<Connection>,
    executor: Arc<dyn JobExecutor>,
    http: reqwest::Client,
    max_concurrent_runs: Option<usize>,
}

pub type SchedulerHandle = Arc<Scheduler>;

impl Scheduler {
    pub fn new(conn: Connection, executor: Arc<dyn JobExecutor>) -> Result<SchedulerHandle> {
        Self::with_concurrency(conn, executor, None)
    }

    pub fn with_concurrency(
        conn: Connection,
        executor: Arc<dyn JobExecutor>,
        max_concurrent_runs: Option<usize>,
    ) -> Result<SchedulerHandle> {
        init_db(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            executor,
            http: reqwest::Client::new(),
            max_concurrent_runs,
        }))
    }

    // -- CRUD -----------------------------------------------------------

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn add_job(&self, spec: NewJob) -> Result<CronJob> {
        validate_delivery(&spec.delivery)?;
        let now_ms = Utc::now().timestamp_millis();
        let id = Uuid::new_v4().to_string();
        let next_run_at_ms =
            compute_next_run(&id, &spec.schedule, Utc::now()).map(|dt| dt.timestamp_millis());
        let job = CronJob {
            id,
            name: spec.name,
            enabled: spec.enabled,
            delete_after_run: spec.delete_after_run,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            schedule: spec.schedule,
            session_target: spec.session_target,
            session_key: spec.session_key,
            wake_mode: spec.wake_mode,
            payload: spec.payload,
            delivery: spec.delivery,
            state: JobState {
                next_run_at_ms,
                ..Default::default()
            },
            stagger_ms: spec.stagger_ms,
        };
        self.persist(&job).await?;
        info!(job_id = %job.id, next_run_at_ms, "cron job added");
        Ok(job)
    }

    #[instrument(skip(self, patch))]
    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Result<CronJob> {
        let mut job = self
            .get_job(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;

        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = Some(enabled);
        }
        if let Some(target) = patch.session_target {
            job.session_target = target;
        }
        if let Some(key) = patch.session_key {
            job.session_key = Some(key);
        }
        if let Some(wake) = patch.wake_mode {
            job.wake_mode = wake;
        }
        if let Some(payload) = patch.payload {
            job.payload = payload;
        }
        if let Some(delivery) = patch.delivery {
            validate_delivery(&delivery)?;
            job.delivery = delivery;
        }
        if let Some(delete_after_run) = patch.delete_after_run {
            job.delete_after_run = Some(delete_after_run);
        }
        if let Some(stagger) = patch.stagger_ms {
            job.stagger_ms = Some(stagger);
        }
        // Schedule changes recompute *this job's* next_run_at_ms only — no
        // other job's state is touched by this call.
        if let Some(schedule) = patch.schedule {
            job.schedule = schedule;
            job.state.next_run_at_ms =
                compute_next_run(&job.id, &job.schedule, Utc::now()).map(|dt| dt.timestamp_millis());
        }
        job.updated_at_ms = Utc::now().timestamp_millis();

        self.persist(&job).await?;
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM cron_jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<CronJob>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM cron_jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(match doc {
            Some(doc) => Some(serde_json::from_str(&doc)?),
            None => None,
        })
    }

    pub async fn list_jobs(&self) -> Result<Vec<CronJob>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT doc FROM cron_jobs ORDER BY created_at_ms")?;
        let jobs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|doc| serde_json::from_str(&doc).ok())
            .collect();
        Ok(jobs)
    }

    async fn persist(&self, job: &CronJob) -> Result<()> {
        let doc = serde_json::to_string(job)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cron_jobs (id, doc, next_run_at_ms, running, created_at_ms)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc, next_run_at_ms = excluded.next_run_at_ms",
            params![job.id, doc, job.state.next_run_at_ms, job.created_at_ms],
        )?;
        Ok(())
    }

    /// Atomically claim a job for execution. Returns `false` if it was
    /// already running (the caller should report `{ran:false,
    /// reason:"already-running"}` without touching anything else).
    async fn try_claim(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE cron_jobs SET running = 1 WHERE id = ?1 AND running = 0",
            [id],
        )?;
        Ok(n > 0)
    }

    async fn release(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE cron_jobs SET running = 0 WHERE id = ?1", [id])?;
        Ok(())
    }

    // -- Manual trigger ---------------------------------------------------

    /// Run `id` immediately unless it's already executing.
    pub async fn run(&self, id: &str, cause: RunCause) -> Result<RunOutcome> {
        let job = self
            .get_job(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;

        if !self.try_claim(id).await? {
            return Ok(RunOutcome {
                ran: false,
                reason: Some("already-running"),
                result: None,
            });
        }

        let result = self.execute_and_record(job, cause).await;
        self.release(id).await?;
        Ok(RunOutcome {
            ran: true,
            reason: None,
            result: Some(result),
        })
    }

    // -- Tick loop ---------------------------------------------------------

    /// Drive the master timer until `shutdown` flips true.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("cron scheduler started");
        loop {
            let delay_ms = self.next_timer_delay_ms().await.unwrap_or(MAX_TIMER_DELAY_MS);
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_millis(delay_ms.max(0) as u64)) => {
                    if let Err(e) = self.clone().tick().await {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// `min(time until the soonest due enabled job, MAX_TIMER_DELAY_MS)`.
    /// Capping avoids both an overlong sleep and a tight spin loop while a
    /// run is already in progress (that job is simply excluded — it has no
    /// bearing on when the *next other* job is due).
    async fn next_timer_delay_ms(&self) -> Result<i64> {
        let now_ms = Utc::now().timestamp_millis();
        let jobs = self.list_jobs().await?;
        let soonest = jobs
            .iter()
            .filter(|j| j.is_enabled())
            .filter_map(|j| j.state.next_run_at_ms)
            .min();
        Ok(match soonest {
            Some(next) => (next - now_ms).clamp(0, MAX_TIMER_DELAY_MS),
            None => MAX_TIMER_DELAY_MS,
        })
    }

    /// Collect and run every due, enabled, not-already-running job.
    /// Per-job order within the batch is start-time order (`next_run_at_ms`
    /// ascending); concurrency is capped by `max_concurrent_runs` when set.
    async fn tick(self: Arc<Self>) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let mut due: Vec<CronJob> = self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|j| j.is_enabled())
            .filter(|j| j.state.next_run_at_ms.map(|n| n <= now_ms).unwrap_or(false))
            .collect();
        due.sort_by_key(|j| j.state.next_run_at_ms.unwrap_or(i64::MAX));

        if due.is_empty() {
            return Ok(());
        }

        let semaphore = self
            .max_concurrent_runs
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut handles = Vec::with_capacity(due.len());
        for job in due {
            if !self.try_claim(&job.id).await? {
                continue; // a manual run() beat the tick to this job
            }
            let this = Arc::clone(&self);
            let sem = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match &sem {
                    Some(s) => Some(s.clone().acquire_owned().await),
                    None => None,
                };
                let id = job.id.clone();
                this.execute_and_record(job, RunCause::Scheduled).await;
                if let Err(e) = this.release(&id).await {
                    warn!(job_id = %id, error = %e, "failed to release running flag");
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        Ok(())
    }

    /// Execute one job, persist its new state (including the anti-spin
    /// recomputed `next_run_at_ms` / deletion for exhausted one-shots), and
    /// route delivery. Caller is responsible for the `running` claim.
    async fn execute_and_record(&self, mut job: CronJob, _cause: RunCause) -> JobRunOutcome {
        let started_at_ms = Utc::now().timestamp_millis();

        let outcome = match &job.payload {
            JobPayload::SystemEvent { text } => self.executor.run_system_event(&job, text).await,
            JobPayload::AgentTurn {
                message,
                timeout_seconds,
                allow_unsafe_external_content,
            } => {
                self.executor
                    .run_agent_turn(
                        &job,
                        message.as_deref(),
                        *timeout_seconds,
                        *allow_unsafe_external_content,
                    )
                    .await
            }
        };

        let ended_at_ms = Utc::now().timestamp_millis();
        let (status, summary, error) = match outcome {
            Ok(summary) => (LastStatus::Ok, summary, None),
            Err(e) => (LastStatus::Error, None, Some(e)),
        };

        job.state.last_run_at_ms = Some(started_at_ms);
        job.state.last_duration_ms = Some(ended_at_ms - started_at_ms);
        job.state.last_status = Some(status);
        job.state.last_error = error.clone();

        // Anti-spin: recompute strictly from ended_at + MIN_REFIRE_GAP_MS so
        // a sub-second job can't refire within the same second.
        job.state.next_run_at_ms =
            next_after_anti_spin(&job.id, &job.schedule, ended_at_ms).map(|dt| dt.timestamp_millis());

        let should_delete =
            job.is_one_shot() && job.is_terminal() && job.delete_after_run.unwrap_or(false);

        if should_delete {
            if let Err(e) = self.remove_job(&job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to delete one-shot job after run");
            }
        } else if let Err(e) = self.persist(&job).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job state after run");
        }

        let result = JobRunOutcome {
            job_id: job.id.clone(),
            name: job.name.clone(),
            status,
            started_at_ms,
            ended_at_ms,
            duration_ms: ended_at_ms - started_at_ms,
            summary,
            error,
        };

        self.deliver(&job, &result).await;
        result
    }

    async fn deliver(&self, job: &CronJob, outcome: &JobRunOutcome) {
        match &job.delivery {
            Delivery::None => {}
            Delivery::Announce { channel, to } => {
                let summary = outcome
                    .summary
                    .clone()
                    .or_else(|| outcome.error.clone())
                    .unwrap_or_default();
                if let Err(e) = self.executor.announce(channel, to, &summary).await {
                    warn!(job_id = %job.id, error = %e, "announce delivery failed");
                }
            }
            Delivery::Webhook { to, best_effort } => {
                if let Err(e) = self.post_webhook(to, outcome).await {
                    if *best_effort {
                        warn!(job_id = %job.id, error = %e, "webhook delivery failed (best effort)");
                    } else {
                        error!(job_id = %job.id, error = %e, "webhook delivery failed");
                    }
                }
            }
        }
    }

    async fn post_webhook(&self, to: &str, outcome: &JobRunOutcome) -> std::result::Result<(), String> {
        let body: Value = serde_json::json!({
            "jobId": outcome.job_id,
            "name": outcome.name,
            "status": outcome.status,
            "startedAt": millis_to_rfc3339(outcome.started_at_ms),
            "endedAt": millis_to_rfc3339(outcome.ended_at_ms),
            "durationMs": outcome.duration_ms,
            "summary": outcome.summary,
            "error": outcome.error,
        });
        let resp = self
            .http
            .post(to)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("webhook endpoint returned {}", resp.status()));
        }
        Ok(())
    }
}

fn millis_to_rfc3339(ms: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingExecutor {
        system_events: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn run_system_event(
            &self,
            _job: &CronJob,
            text: &str,
        ) -> std::result::Result<Option<String>, String> {
            self.system_events.lock().unwrap().push(text.to_string());
            Ok(Some(format!("ran: {text}")))
        }

        async fn run_agent_turn(
            &self,
            _job: &CronJob,
            _message: Option<&str>,
            _timeout_seconds: u64,
            _allow_unsafe_external_content: bool,
        ) -> std::result::Result<Option<String>, String> {
            Ok(Some("agent turn ok".to_string()))
        }

        async fn announce(
            &self,
            _channel: &str,
            _to: &str,
            _summary: &str,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    async fn scheduler() -> (SchedulerHandle, Arc<RecordingExecutor>) {
        let conn = Connection::open_in_memory().unwrap();
        let exec = Arc::new(RecordingExecutor {
            system_events: std::sync::Mutex::new(Vec::new()),
        });
        let sched = Scheduler::new(conn, exec.clone()).unwrap();
        (sched, exec)
    }

    #[tokio::test]
    async fn run_twice_concurrently_reports_already_running() {
        let (sched, _exec) = scheduler().await;
        let job = sched
            .add_job(NewJob {
                name: "greet".to_string(),
                enabled: None,
                schedule: Schedule::Every { every_ms: 3_600_000, anchor_ms: None },
                session_target: SessionTarget::Isolated,
                session_key: None,
                wake_mode: WakeMode::Now,
                payload: JobPayload::SystemEvent { text: "hi".to_string() },
                delivery: Delivery::None,
                delete_after_run: None,
                stagger_ms: None,
            })
            .await
            .unwrap();

        assert!(sched.try_claim(&job.id).await.unwrap());
        let out = sched.run(&job.id, RunCause::Manual).await.unwrap();
        assert!(!out.ran);
        assert_eq!(out.reason, Some("already-running"));
    }

    #[tokio::test]
    async fn one_shot_with_delete_after_run_is_removed() {
        let (sched, _exec) = scheduler().await;
        let at = Utc::now() - chrono::Duration::seconds(1);
        let job = sched
            .add_job(NewJob {
                name: "once".to_string(),
                enabled: None,
                schedule: Schedule::At { at },
                session_target: SessionTarget::Isolated,
                session_key: None,
                wake_mode: WakeMode::Now,
                payload: JobPayload::SystemEvent { text: "bye".to_string() },
                delivery: Delivery::None,
                delete_after_run: Some(true),
                stagger_ms: None,
            })
            .await
            .unwrap();

        let out = sched.run(&job.id, RunCause::Manual).await.unwrap();
        assert!(out.ran);
        assert!(sched.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_webhook_scheme_rejected() {
        let (sched, _exec) = scheduler().await;
        let err = sched
            .add_job(NewJob {
                name: "bad".to_string(),
                enabled: None,
                schedule: Schedule::Every { every_ms: 60_000, anchor_ms: None },
                session_target: SessionTarget::Isolated,
                session_key: None,
                wake_mode: WakeMode::Now,
                payload: JobPayload::SystemEvent { text: "x".to_string() },
                delivery: Delivery::Webhook { to: "ftp://evil".to_string(), best_effort: false },
                delete_after_run: None,
                stagger_ms: None,
            })
            .await;
        assert!(matches!(err, Err(SchedulerError::InvalidWebhookUrl(_))));
    }
}
