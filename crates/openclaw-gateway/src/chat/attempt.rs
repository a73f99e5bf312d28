//! Bridges `AppState` into the two collaborator traits
//! [`openclaw_agent::run_loop::AgentRunLoop`] needs: the actual LLM/tool-loop
//! call (`LlmAttempt`) and context-overflow summarization (`CompactDirect`).
//!
//! Grounded on `openclaw_agent::pipeline::process::process_message_non_streaming`
//! for how a turn is built (history load, system prompt, tool list, tool
//! loop) — this adapter runs the same steps but reports an `AttemptOutcome`
//! instead of persisting turns itself, since the run loop may call it more
//! than once (retries, post-compaction re-attempts) for a single user turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use openclaw_agent::pipeline::overflow_compact::ContextCompactor;
use openclaw_agent::provider::{ChatRequest, Message, ProviderError, Role};
use openclaw_agent::run_loop::{
    AssistantOutcome, AttemptContext, AttemptOutcome, AttemptUsage, LatestUsage, LlmAttempt,
};
use openclaw_agent::tools::tool_loop;

use crate::app::AppState;

/// Adapts `AppState` into [`LlmAttempt`] for the web-chat RPC surface.
pub struct GatewayLlmAttempt {
    pub app: Arc<AppState>,
    pub channel_name: String,
}

#[async_trait]
impl LlmAttempt for GatewayLlmAttempt {
    async fn attempt(&self, ctx: &AttemptContext, cancel: &CancellationToken) -> AttemptOutcome {
        let built = openclaw_agent::tools::build::build_tools(
            Arc::clone(&self.app),
            &self.channel_name,
            None,
            Some(&ctx.session_key),
        );
        let tool_defs = openclaw_agent::tools::build::tool_definitions(&built.tools);

        let turn_count = self.app.memory.count_turns(&ctx.session_key).unwrap_or(0) as u32;
        let now = chrono::Utc::now();
        let session_info = openclaw_agent::prompt::SessionInfo {
            session_key: ctx.session_key.clone(),
            turn_count,
            timestamp: now.format("%Y-%m-%d %H:%M UTC").to_string(),
        };
        let prompt_builder = self.app.agent.prompt().await;
        let system_prompt = prompt_builder.build_prompt(None, Some(&session_info));
        let plain = system_prompt.to_plain_text();

        // History already includes the current turn's user message — the
        // caller (`chat::handlers::chat_send`) persists it to `memory`
        // before starting the run, same as
        // `pipeline::process::process_message_non_streaming` does for every
        // other channel adapter.
        let history = self.app.memory.get_history(&ctx.session_key, 40).unwrap_or_default();
        let messages: Vec<Message> = history
            .iter()
            .map(|m| Message {
                role: if m.role == "assistant" { Role::Assistant } else { Role::User },
                content: m.content.clone(),
            })
            .collect();

        let request = ChatRequest {
            model: ctx.model.clone(),
            system: plain,
            system_prompt: Some(system_prompt),
            messages,
            max_tokens: 4096,
            stream: false,
            thinking: None,
            tools: tool_defs,
            raw_messages: None,
        };

        let timeout = Duration::from_millis(ctx.timeout_ms.max(1));
        let call = tool_loop::run_tool_loop(self.app.agent.provider(), request, &built.tools, Some(cancel));

        match tokio::time::timeout(timeout, call).await {
            Err(_elapsed) => {
                cancel.cancel();
                AttemptOutcome { timed_out: true, ..Default::default() }
            }
            Ok(Err(ProviderError::Cancelled)) => AttemptOutcome { aborted: true, ..Default::default() },
            Ok(Err(e)) => AttemptOutcome {
                prompt_error: Some(e.to_string()),
                ..Default::default()
            },
            Ok(Ok((resp, called_tools))) => {
                for name in &called_tools {
                    let _ = self.app.memory.log_tool_call(name, &ctx.session_key);
                }
                let is_error = resp.stop_reason == "error";
                AttemptOutcome {
                    assistant_texts: if is_error { Vec::new() } else { vec![resp.content.clone()] },
                    tool_names: called_tools,
                    last_assistant: Some(AssistantOutcome {
                        stop_reason: resp.stop_reason.clone(),
                        error_message: if is_error { Some(resp.content.clone()) } else { None },
                        usage: LatestUsage { total: (resp.tokens_in + resp.tokens_out) as u64 },
                    }),
                    attempt_usage: AttemptUsage {
                        input: resp.tokens_in as u64,
                        output: resp.tokens_out as u64,
                        cache_read: 0,
                        cache_write: 0,
                    },
                    ..Default::default()
                }
            }
        }
    }
}

/// Builds the `ContextCompactor` collaborator over `AppState`.
pub fn compactor_for(app: &Arc<AppState>) -> Arc<ContextCompactor<AppState>> {
    Arc::new(ContextCompactor::new(Arc::clone(app)))
}
