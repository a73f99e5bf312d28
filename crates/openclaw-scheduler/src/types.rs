use serde::{Deserialize, Serialize};

/// When/how often a job should fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    /// Fire once at an absolute instant.
    At { at: chrono::DateTime<chrono::Utc> },

    /// Fire every `every_ms` milliseconds, optionally anchored to a specific
    /// instant so restarts don't drift the phase.
    Every {
        every_ms: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },

    /// Fire on a 5- or 6-field cron expression evaluated in an IANA timezone.
    /// `stagger_ms: Some(0)` means exact (no jitter); `None` lets the engine
    /// derive a deterministic stagger for top-of-hour expressions.
    Cron {
        expr: String,
        tz: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stagger_ms: Option<i64>,
    },
}

/// Where the job's output is routed once it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    /// Inject into the session's existing, possibly-busy follow-up queue.
    Main,
    /// Launch a standalone run detached from any live session.
    Isolated,
}

/// Whether the job should run as soon as it's due, or wait for the next
/// heartbeat tick of the owning session (batches with other idle work).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeMode {
    Now,
    /// Wire value is `"next-heartbeat"` (hyphenated, not `next_heartbeat`) —
    /// matches the literal value named in the spec's cron-store JSON shape.
    #[serde(rename = "next-heartbeat")]
    NextHeartbeat,
}

/// What the job actually does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobPayload {
    /// Append a synthetic system event to the session transcript; no LLM call.
    SystemEvent { text: String },
    /// Drive a full agent turn.
    AgentTurn {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// `0` means no timeout.
        #[serde(default)]
        timeout_seconds: u64,
        #[serde(default)]
        allow_unsafe_external_content: bool,
    },
}

/// How a completed (or failed) run is surfaced to a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Delivery {
    /// Side-effect-free: only the job's `state` is updated.
    None,
    /// Deliver through the normal channel adapter path.
    Announce { channel: String, to: String },
    /// POST the webhook body to `to`. Must be `http://` or `https://`.
    Webhook {
        to: String,
        #[serde(default)]
        best_effort: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    Ok,
    Error,
    Skipped,
}

impl std::fmt::Display for LastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LastStatus::Ok => "ok",
            LastStatus::Error => "error",
            LastStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Mutable run-state carried alongside the immutable job definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<LastStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<i64>,
}

/// A persisted cron job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    /// Missing in persisted state is treated as `true` (see `is_enabled`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delete_after_run: Option<bool>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    /// The session this job's output is bound to when `session_target ==
    /// Main`. Unset for `Isolated` jobs, which synthesize a one-off key.
    /// Spec §3 doesn't define how a job addresses its target session;
    /// this field is the chosen resolution (see DESIGN.md).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_key: Option<String>,
    pub wake_mode: WakeMode,
    pub payload: JobPayload,
    #[serde(default = "default_delivery")]
    pub delivery: Delivery,
    #[serde(default)]
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stagger_ms: Option<i64>,
}

fn default_delivery() -> Delivery {
    Delivery::None
}

impl CronJob {
    /// An `enabled` field absent from persisted state counts as enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self.schedule, Schedule::At { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state.last_status,
            Some(LastStatus::Ok) | Some(LastStatus::Skipped) | Some(LastStatus::Error)
        )
    }
}

/// Why a job run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCause {
    Scheduled,
    Manual,
}

/// The outcome of one job execution, passed to the delivery router.
#[derive(Debug, Clone)]
pub struct JobRunOutcome {
    pub job_id: String,
    pub name: String,
    pub status: LastStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: i64,
    pub summary: Option<String>,
    pub error: Option<String>,
}
