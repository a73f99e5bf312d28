//! `reminder` tool — schedule a proactive reminder via the scheduler engine.
//!
//! The AI calls this tool when the user asks "remind me in 2 hours", "ping me
//! at 9am", etc. The tool persists a [`openclaw_scheduler::NewJob`] through
//! [`openclaw_scheduler::SchedulerHandle`]; the scheduler's own tick loop
//! fires it later and routes delivery through the normal `Delivery::Announce`
//! channel-adapter path — this tool never talks to the channel directly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};

use openclaw_scheduler::{Delivery, JobPayload, NewJob, Schedule, SessionTarget, WakeMode};

use crate::pipeline::context::MessageContext;

use super::{Tool, ToolResult};

/// AI tool that creates, lists, and removes scheduled reminders.
pub struct ReminderTool<C: MessageContext + 'static> {
    ctx: Arc<C>,
    /// Delivery channel name stored on the job (e.g. `"discord"`, `"terminal"`, `"ws"`).
    channel_name: String,
    /// Discord channel ID to deliver to, or `None` for a session-routed delivery.
    channel_id: Option<u64>,
    /// Session key the reminder was requested from, used both as the
    /// delivery recipient (when there's no channel ID) and as the job's
    /// bound session for `SessionTarget::Main`.
    session_key: Option<String>,
}

impl<C: MessageContext + 'static> ReminderTool<C> {
    pub fn new(
        ctx: Arc<C>,
        channel_name: &str,
        channel_id: Option<u64>,
        session_key: Option<&str>,
    ) -> Self {
        Self {
            ctx,
            channel_name: channel_name.to_string(),
            channel_id,
            session_key: session_key.map(String::from),
        }
    }

    fn recipient(&self) -> String {
        self.channel_id
            .map(|id| id.to_string())
            .or_else(|| self.session_key.clone())
            .unwrap_or_default()
    }

    async fn add_reminder(&self, input: &Value) -> ToolResult {
        let message = match input.get("message").and_then(|v| v.as_str()) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return ToolResult::error("'message' is required for the add action"),
        };

        let text = match input.get("image_url").and_then(|v| v.as_str()) {
            Some(url) if !url.is_empty() => format!("{message}\n{url}"),
            _ => message.clone(),
        };

        // Determine the schedule: recurring > fire_at > fire_in_seconds
        let schedule = if let Some(recurring) = input.get("recurring").and_then(|v| v.as_str()) {
            match Self::parse_recurring(recurring) {
                Ok(s) => s,
                Err(msg) => return ToolResult::error(msg),
            }
        } else if let Some(fire_at) = input.get("fire_at").and_then(|v| v.as_str()) {
            match chrono::DateTime::parse_from_rfc3339(fire_at) {
                Ok(dt) => Schedule::At {
                    at: dt.with_timezone(&Utc),
                },
                Err(e) => return ToolResult::error(format!("invalid fire_at datetime: {e}")),
            }
        } else if let Some(secs) = input.get("fire_in_seconds").and_then(|v| v.as_i64()) {
            if secs <= 0 {
                return ToolResult::error("fire_in_seconds must be a positive integer");
            }
            Schedule::At {
                at: Utc::now() + Duration::seconds(secs),
            }
        } else {
            return ToolResult::error(
                "one of 'fire_at', 'fire_in_seconds', or 'recurring' is required for add",
            );
        };

        let one_shot = matches!(schedule, Schedule::At { .. });
        let spec = NewJob {
            name: "reminder".to_string(),
            enabled: None,
            schedule,
            session_target: if self.session_key.is_some() {
                SessionTarget::Main
            } else {
                SessionTarget::Isolated
            },
            session_key: self.session_key.clone(),
            wake_mode: WakeMode::Now,
            payload: JobPayload::SystemEvent { text },
            delivery: Delivery::Announce {
                channel: self.channel_name.clone(),
                to: self.recipient(),
            },
            delete_after_run: Some(one_shot),
            stagger_ms: None,
        };

        match self.ctx.scheduler().add_job(spec).await {
            Ok(job) => ToolResult::success(format!(
                "Reminder scheduled!\n- Job ID: {}\n- Message: {}\n- Fires at: {}",
                job.id,
                message,
                job.state
                    .next_run_at_ms
                    .map(|ms| Utc
                        .timestamp_millis_opt(ms)
                        .single()
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_default())
                    .unwrap_or_else(|| "unknown".to_string()),
            )),
            Err(e) => ToolResult::error(format!("failed to schedule reminder: {e}")),
        }
    }

    async fn list_reminders(&self) -> ToolResult {
        match self.ctx.scheduler().list_jobs().await {
            Ok(jobs) => {
                let jobs: Vec<_> = jobs.into_iter().filter(|j| j.name == "reminder").collect();
                if jobs.is_empty() {
                    return ToolResult::success("No reminders scheduled.");
                }
                let mut out = format!("Scheduled reminders ({}):\n", jobs.len());
                for job in &jobs {
                    let next = job
                        .state
                        .next_run_at_ms
                        .map(|ms| {
                            Utc.timestamp_millis_opt(ms)
                                .single()
                                .map(|dt| dt.to_rfc3339())
                                .unwrap_or_default()
                        })
                        .unwrap_or_else(|| "N/A".to_string());
                    let status = job
                        .state
                        .last_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "pending".to_string());
                    out.push_str(&format!(
                        "- ID: {} | Next: {} | Status: {}\n",
                        job.id, next, status
                    ));
                }
                ToolResult::success(out)
            }
            Err(e) => ToolResult::error(format!("failed to list reminders: {e}")),
        }
    }

    async fn remove_reminder(&self, input: &Value) -> ToolResult {
        let job_id = match input.get("job_id").and_then(|v| v.as_str()) {
            Some(id) if !id.is_empty() => id,
            _ => return ToolResult::error("'job_id' is required for the remove action"),
        };

        match self.ctx.scheduler().remove_job(job_id).await {
            Ok(()) => ToolResult::success(format!("Reminder '{job_id}' removed.")),
            Err(e) => ToolResult::error(format!("failed to remove reminder: {e}")),
        }
    }

    /// Parse `"daily|HH:MM"` or `"interval|N"` into a [`Schedule`].
    fn parse_recurring(s: &str) -> Result<Schedule, String> {
        let mut parts = s.splitn(2, '|');
        let kind = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");

        match kind {
            "daily" => {
                let mut time = rest.splitn(2, ':');
                let hour: u32 = time
                    .next()
                    .unwrap_or("")
                    .parse()
                    .map_err(|_| "daily|HH:MM — invalid hour".to_string())?;
                let minute: u32 = time
                    .next()
                    .unwrap_or("")
                    .parse()
                    .map_err(|_| "daily|HH:MM — invalid minute".to_string())?;
                if hour > 23 || minute > 59 {
                    return Err(format!(
                        "daily|HH:MM — time {hour:02}:{minute:02} is out of range"
                    ));
                }
                Ok(Schedule::Cron {
                    expr: format!("{minute} {hour} * * *"),
                    tz: "UTC".to_string(),
                    stagger_ms: Some(0),
                })
            }
            "interval" => {
                let secs: i64 = rest
                    .parse()
                    .map_err(|_| "interval|N — N must be a positive integer".to_string())?;
                if secs <= 0 {
                    return Err("interval|N — N must be greater than 0".to_string());
                }
                Ok(Schedule::Every {
                    every_ms: secs * 1000,
                    anchor_ms: None,
                })
            }
            other => Err(format!(
                "unknown recurring type '{other}': use 'daily|HH:MM' or 'interval|N'"
            )),
        }
    }
}

#[async_trait]
impl<C: MessageContext + 'static> Tool for ReminderTool<C> {
    fn name(&self) -> &str {
        "reminder"
    }

    fn description(&self) -> &str {
        "ALWAYS use this tool when the user asks to be reminded, notified, or \
         woken up at a future time. The reminder is delivered to the user's \
         channel once the scheduler fires the underlying cron job. \
         Do NOT respond with reminder text directly; call this tool instead. \
         Actions: 'add' (create), 'list' (view all), 'remove' (cancel by job_id)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Operation: add a new reminder, list all reminders, or remove one."
                },
                "message": {
                    "type": "string",
                    "description": "Text to deliver when the reminder fires. Required for add."
                },
                "fire_at": {
                    "type": "string",
                    "description": "ISO-8601 UTC datetime when to fire (e.g. '2026-10-20T13:00:00Z'). Mutually exclusive with fire_in_seconds."
                },
                "fire_in_seconds": {
                    "type": "integer",
                    "description": "Seconds from now when to fire the reminder. Mutually exclusive with fire_at."
                },
                "recurring": {
                    "type": "string",
                    "description": "Optional recurrence pattern: 'daily|HH:MM' (UTC) or 'interval|N' (every N seconds). Overrides fire_at/fire_in_seconds."
                },
                "image_url": {
                    "type": "string",
                    "description": "Optional image URL appended on its own line (channels that auto-embed bare image URLs will render it)."
                },
                "job_id": {
                    "type": "string",
                    "description": "Job ID returned by a previous add. Required for remove."
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let action = match input.get("action").and_then(|v| v.as_str()) {
            Some(a) => a,
            None => return ToolResult::error("missing required field 'action'"),
        };

        match action {
            "add" => self.add_reminder(&input).await,
            "list" => self.list_reminders().await,
            "remove" => self.remove_reminder(&input).await,
            other => ToolResult::error(format!(
                "unknown action '{other}': must be 'add', 'list', or 'remove'"
            )),
        }
    }
}
