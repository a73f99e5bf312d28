//! Context-overflow compaction — the `compactDirect` collaborator the run
//! loop calls when a provider rejects a prompt as too large for its context
//! window (§4.3 step 4).
//!
//! Distinct from [`super::compact::compact_session_if_needed`]: that one is
//! a background fact-extraction pass triggered on a turn-count threshold and
//! writes to `user_memory`. This one runs synchronously inside a failing
//! attempt, must shrink the *next* request's token footprint immediately,
//! and reports success/failure back to the run loop rather than
//! fire-and-forgetting.

use std::sync::Arc;

use tracing::{info, warn};

use crate::provider::{ChatRequest, Message, Role};
use crate::run_loop::{CompactDirect, CompactOutcome};

use super::context::MessageContext;

/// Number of most recent turns left untouched — compaction only ever
/// summarizes everything *older* than this, so the immediate exchange that
/// triggered the overflow is never lost.
const KEEP_RECENT_TURNS: usize = 6;
/// Turns are only worth compacting once there's a meaningful tail to fold.
const MIN_TURNS_TO_COMPACT: usize = KEEP_RECENT_TURNS + 4;

/// Summarize everything but the most recent turns of a session into a single
/// condensed turn, replacing the originals. Returns `false` (without
/// touching storage) if there isn't enough history to usefully compact, or
/// if the summarization call itself fails.
pub async fn compact_direct<C: MessageContext>(ctx: &C, session_key: &str) -> bool {
    let total = match ctx.memory().count_turns(session_key) {
        Ok(n) => n as usize,
        Err(e) => {
            warn!(error = %e, session = %session_key, "overflow compact: count_turns failed");
            return false;
        }
    };

    if total <= MIN_TURNS_TO_COMPACT {
        return false;
    }

    let to_compact = total - KEEP_RECENT_TURNS;
    let old_turns = match ctx.memory().get_oldest_turns(session_key, to_compact) {
        Ok(turns) if !turns.is_empty() => turns,
        Ok(_) => return false,
        Err(e) => {
            warn!(error = %e, session = %session_key, "overflow compact: get_oldest_turns failed");
            return false;
        }
    };

    let transcript: String = old_turns
        .iter()
        .map(|m| format!("{}: {}", m.role.to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let req = ChatRequest {
        model: "claude-haiku-4-5-20251001".to_string(),
        system: concat!(
            "You are compacting a conversation to free up context window space. ",
            "Summarize the exchange below into a single dense paragraph that preserves ",
            "every decision, fact, and open thread a continuation would need. ",
            "Do not add commentary or a preamble — output only the summary paragraph."
        )
        .to_string(),
        system_prompt: None,
        messages: vec![Message {
            role: Role::User,
            content: format!("Summarize this conversation history:\n\n{transcript}"),
        }],
        max_tokens: 1024,
        stream: false,
        thinking: None,
        tools: Vec::new(),
        raw_messages: None,
    };

    let response = match ctx.agent().provider().send(&req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, session = %session_key, "overflow compact: summarization call failed");
            return false;
        }
    };

    let summary = response.content.trim();
    if summary.is_empty() {
        warn!(session = %session_key, "overflow compact: summarization returned empty content");
        return false;
    }

    let ids: Vec<i64> = old_turns.iter().map(|m| m.id).collect();
    if let Err(e) = ctx.memory().delete_turns(&ids) {
        warn!(error = %e, session = %session_key, "overflow compact: delete_turns failed");
        return false;
    }

    let user_id = old_turns.first().and_then(|m| m.user_id.clone());
    let channel = old_turns
        .first()
        .map(|m| m.channel.clone())
        .unwrap_or_default();

    let note = openclaw_memory::types::ConversationMessage {
        id: 0,
        user_id,
        session_key: session_key.to_string(),
        channel,
        role: "system".to_string(),
        content: format!("[earlier conversation summarized]: {summary}"),
        model_used: Some("claude-haiku-4-5-20251001".to_string()),
        tokens_in: response.tokens_in,
        tokens_out: response.tokens_out,
        cost_usd: 0.0,
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    if let Err(e) = ctx.memory().save_message(&note) {
        warn!(error = %e, session = %session_key, "overflow compact: failed to save summary turn");
        return false;
    }

    info!(
        session = %session_key,
        turns_compacted = ids.len(),
        "overflow compact: session history condensed"
    );
    true
}

/// Best-effort fallback when summarization itself fails: drop the content of
/// the oldest tool-result turns rather than the turns themselves, which
/// keeps the conversation's shape intact while still shrinking it.
pub async fn truncate_tool_results<C: MessageContext>(ctx: &C, session_key: &str) -> bool {
    let old_turns = match ctx.memory().get_oldest_turns(session_key, MIN_TURNS_TO_COMPACT) {
        Ok(turns) => turns,
        Err(e) => {
            warn!(error = %e, session = %session_key, "truncate tool results: get_oldest_turns failed");
            return false;
        }
    };

    let ids: Vec<i64> = old_turns
        .iter()
        .filter(|m| m.content.len() > 400)
        .map(|m| m.id)
        .collect();

    if ids.is_empty() {
        return false;
    }

    match ctx.memory().delete_turns(&ids) {
        Ok(deleted) if deleted > 0 => {
            info!(session = %session_key, deleted, "truncated oversized tool-result turns");
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!(error = %e, session = %session_key, "truncate tool results: delete_turns failed");
            false
        }
    }
}

/// Adapts any [`MessageContext`] into the run loop's [`CompactDirect`] seam.
pub struct ContextCompactor<C: MessageContext> {
    ctx: Arc<C>,
}

impl<C: MessageContext> ContextCompactor<C> {
    pub fn new(ctx: Arc<C>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl<C: MessageContext + 'static> CompactDirect for ContextCompactor<C> {
    async fn compact(&self, session_key: &str) -> CompactOutcome {
        CompactOutcome { ok: compact_direct(self.ctx.as_ref(), session_key).await }
    }

    async fn truncate_tool_results(&self, session_key: &str) -> bool {
        truncate_tool_results(self.ctx.as_ref(), session_key).await
    }
}
