//! `openclaw-scheduler` — persisted cron jobs with spin-safe timer arming.
//!
//! # Overview
//!
//! Jobs are persisted to a SQLite table as JSON documents. [`engine::Scheduler`]
//! arms a single master timer for `min(time_until_next_due, MAX_TIMER_DELAY_MS)`,
//! collects every job due on each tick, and runs them through a
//! [`engine::JobExecutor`] collaborator supplied by the caller (the gateway
//! wires this to the session/agent machinery).
//!
//! # Schedule variants
//!
//! | Variant  | Behaviour                                               |
//! |----------|----------------------------------------------------------|
//! | `At`     | Single fire at an absolute instant                      |
//! | `Every`  | Repeat every N milliseconds, optionally phase-anchored  |
//! | `Cron`   | 5/6-field cron expression in an IANA timezone, staggered |
//!
//! After every fire, `next_run_at_ms` is recomputed from
//! `endedAt + MIN_REFIRE_GAP_MS` rather than the nominal fire time, so a
//! sub-second-duration job can never refire within the same second.

pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::{JobExecutor, JobPatch, NewJob, RunOutcome, Scheduler, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use schedule::{compute_next_run, next_after_anti_spin, MIN_REFIRE_GAP_MS};
pub use types::{
    CronJob, Delivery, JobPayload, JobRunOutcome, JobState, LastStatus, RunCause, Schedule,
    SessionTarget, WakeMode,
};
