//! Bridges `AppState` into [`openclaw_scheduler::JobExecutor`] — the
//! collaborator the scheduler calls back into to actually run a fired job's
//! effect, mirroring how `chat::attempt::GatewayLlmAttempt` bridges
//! `AppState` into `openclaw_agent::run_loop::LlmAttempt`.
//!
//! Holds a `Weak<AppState>` rather than an `Arc` since `AppState` owns the
//! `SchedulerHandle` this executor is wired into — an `Arc` here would be a
//! reference cycle (see `AppState::new` / `Arc::new_cyclic`).

use std::sync::Weak;

use async_trait::async_trait;
use tracing::warn;

use openclaw_agent::pipeline::process_message_non_streaming;
use openclaw_agent::pipeline::MessageContext;
use openclaw_agent::provider::ProviderError;
use openclaw_memory::types::ConversationMessage;
use openclaw_scheduler::{CronJob, JobExecutor};

use crate::app::AppState;

pub struct GatewaySchedulerExecutor {
    pub app: Weak<AppState>,
}

#[async_trait]
impl JobExecutor for GatewaySchedulerExecutor {
    async fn run_system_event(
        &self,
        job: &CronJob,
        text: &str,
    ) -> std::result::Result<Option<String>, String> {
        let app = self.app.upgrade().ok_or("gateway shut down")?;
        let session_key = job
            .session_key
            .clone()
            .unwrap_or_else(|| format!("cron:{}", job.id));

        let now = chrono::Utc::now().to_rfc3339();
        app.memory
            .save_message(&ConversationMessage {
                id: 0,
                user_id: None,
                session_key: session_key.clone(),
                channel: "cron".to_string(),
                role: "system".to_string(),
                content: text.to_string(),
                model_used: None,
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                created_at: now,
            })
            .map_err(|e| e.to_string())?;
        let _ = app
            .transcripts
            .append_message(&session_key, "system", text, None, None);
        Ok(None)
    }

    async fn run_agent_turn(
        &self,
        job: &CronJob,
        message: Option<&str>,
        timeout_seconds: u64,
        _allow_unsafe_external_content: bool,
    ) -> std::result::Result<Option<String>, String> {
        let app = self.app.upgrade().ok_or("gateway shut down")?;
        let session_key = job
            .session_key
            .clone()
            .unwrap_or_else(|| format!("cron:{}", job.id));
        let prompt = message.unwrap_or("(scheduled check-in — no message body)");

        let cancel = tokio_util::sync::CancellationToken::new();
        let timeout = if timeout_seconds == 0 {
            None
        } else {
            Some(tokio::time::Duration::from_secs(timeout_seconds))
        };
        let call = process_message_non_streaming(
            &app,
            &session_key,
            "cron",
            prompt,
            None,
            None,
            None,
            Some(cancel),
            None,
        );
        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, call).await {
                Ok(r) => r,
                Err(_) => return Err("agent turn timed out".to_string()),
            },
            None => call.await,
        };

        match result {
            Ok(r) => Ok(Some(r.content)),
            Err(ProviderError::Cancelled) => Err("agent turn aborted".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn announce(
        &self,
        channel: &str,
        to: &str,
        summary: &str,
    ) -> std::result::Result<(), String> {
        let app = self.app.upgrade().ok_or("gateway shut down")?;
        match app.send_to_channel(channel, to, summary) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(channel, to, error = %e, "cron announce delivery failed");
                Err(e)
            }
        }
    }
}
