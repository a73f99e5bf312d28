//! The agent run loop — one [`AgentRun`] end to end: auth-profile selection,
//! a bounded number of LLM attempts, context-overflow compaction, rate-limit
//! / auth rotation, and billing/timeout classification.
//!
//! This module owns *timing and retry policy* only. The actual LLM call
//! (including the tool-calling loop) and the actual history-summarization
//! work are collaborators supplied by the caller — [`LlmAttempt`] and
//! [`CompactDirect`] — the same seam [`crate::router::ProviderRouter`] draws
//! between "decide whether to retry" and "what a provider call does".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::auth_profile::{AuthProfileStore, ProfileSource, SelectError};

/// Structured error kinds surfaced to callers of an agent run, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ContextOverflow,
    CompactionFailure,
    Timeout,
    Auth,
    Billing,
    RateLimit,
    Unknown,
}

/// A control-flow signal: the caller should pick the next fallback
/// model/provider and retry the whole run at that level. Never represents a
/// a bug in this crate — it's thrown, not returned, matching §7's
/// "Auth/Billing/Rate ... yields `FailoverError`" propagation policy.
#[derive(Debug, Error)]
#[error("failover required: {reason} (provider={provider}, model={model})")]
pub struct FailoverError {
    pub reason: FailoverReason,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    RateLimit,
    Auth,
    Billing,
}

/// Inputs for one attempt at driving the turn through the LLM.
pub struct AttemptContext {
    pub session_key: String,
    pub session_id: String,
    pub session_file: String,
    pub workspace_dir: String,
    pub agent_dir: String,
    pub prompt: String,
    pub provider: String,
    pub model: String,
    pub auth_profile_id: String,
    pub timeout_ms: u64,
    pub run_id: String,
    pub attempt: u32,
}

/// The latest model call's usage (for `promptTokens` accounting) — §4.3's
/// "read from the *latest* model call, not accumulated" rule.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatestUsage {
    pub total: u64,
}

/// Usage accumulated across an entire attempt (possibly several tool-loop
/// iterations) — feeds `meta.agentMeta.usage`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttemptUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

#[derive(Debug, Clone)]
pub struct AssistantOutcome {
    pub stop_reason: String,
    pub error_message: Option<String>,
    pub usage: LatestUsage,
}

/// Everything one attempt at an LLM turn can report back, per §4.3 step 2.
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub aborted: bool,
    pub timed_out: bool,
    pub timed_out_during_compaction: bool,
    pub prompt_error: Option<String>,
    pub assistant_texts: Vec<String>,
    pub tool_names: Vec<String>,
    pub last_assistant: Option<AssistantOutcome>,
    pub attempt_usage: AttemptUsage,
}

/// Collaborator that drives the LLM (and its tool loop) for one attempt.
/// Implemented by the gateway/channel host over `runtime::AgentRuntime` +
/// `tools::tool_loop::run_tool_loop`; this trait is the seam so the retry
/// state machine here never depends on request-building directly.
#[async_trait]
pub trait LlmAttempt: Send + Sync {
    async fn attempt(&self, ctx: &AttemptContext, cancel: &CancellationToken) -> AttemptOutcome;
}

#[derive(Debug, Clone)]
pub struct CompactOutcome {
    pub ok: bool,
}

/// Collaborator that summarizes session history so the next attempt fits
/// the model's context window — §4.3 step 4's `compactDirect`.
#[async_trait]
pub trait CompactDirect: Send + Sync {
    async fn compact(&self, session_key: &str) -> CompactOutcome;
    /// Best-effort: truncate any oversized tool outputs already recorded in
    /// the session, used as the fallback when compaction itself fails.
    async fn truncate_tool_results(&self, session_key: &str) -> bool;
}

/// One payload the run produced for the reply dispatcher, plus whatever
/// error classification applies to the run as a whole.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantPayload {
    pub text: String,
    pub is_error: bool,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMeta {
    pub usage: AttemptUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub agent_meta: AgentMeta,
    pub error: Option<RunErrorMeta>,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunErrorMeta {
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub payloads: Vec<AssistantPayload>,
    pub meta: RunMeta,
}

/// Non-failover errors propagated out of `run` (transport problems unrelated
/// to the current attempt's overflow classification — see §4.3's preamble).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Failover(#[from] FailoverError),
    #[error("no auth profile available: {0}")]
    NoAuthProfile(#[from] SelectError),
}

/// Maximum number of compaction attempts interleaved with retries before
/// giving up with `context_overflow`, per §4.3 step 4 ("up to three
/// compaction attempts interleaved with retry attempts (4 run attempts max)").
const MAX_COMPACTIONS: u32 = 3;
const MAX_ATTEMPTS: u32 = 4;

/// Substrings that classify a prompt or assistant error as a context-window
/// overflow, per §4.3 step 3.
const OVERFLOW_MARKERS: &[&str] = &[
    "request_too_large",
    "Request size exceeds",
    "context window exceeded",
    "prompt too large",
];

fn is_context_overflow(message: &str) -> bool {
    OVERFLOW_MARKERS.iter().any(|m| message.contains(m))
}

fn is_compaction_failure(message: &str) -> bool {
    is_context_overflow(message) && message.contains("summarization failed")
}

fn classify_assistant_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if is_context_overflow(message) {
        ErrorKind::ContextOverflow
    } else if lower.contains("rate limit") || lower.contains("rate_limit") {
        ErrorKind::RateLimit
    } else if lower.contains("billing") || lower.contains("insufficient_quota") {
        ErrorKind::Billing
    } else if lower.contains("auth") || lower.contains("unauthorized") || lower.contains("invalid api key") {
        ErrorKind::Auth
    } else {
        ErrorKind::Unknown
    }
}

/// `true` for the assistant error that specifically triggers auto-pinned
/// rate-limit rotation per §4.3 step 6 ("rate-limit or 'request ended
/// without sending any chunks' assistant errors").
fn triggers_rotation(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("request ended without sending any chunks")
}

/// Drives one [`crate::auth_profile::AuthProfile`]-scoped turn through its
/// full retry/compaction/rotation state machine.
pub struct AgentRunLoop {
    auth: Arc<AuthProfileStore>,
    attempts: Arc<dyn LlmAttempt>,
    compactor: Arc<dyn CompactDirect>,
    fallback_models: Vec<String>,
}

/// Request to drive one complete [`AgentRun`](crate::run_loop), before any
/// retry/rotation/compaction has happened.
pub struct RunInput {
    pub session_key: String,
    pub session_id: String,
    pub session_file: String,
    pub workspace_dir: String,
    pub agent_dir: String,
    pub prompt: String,
    pub provider: String,
    pub model: String,
    /// `Some(id)` when the caller pinned a specific auth profile.
    pub pinned_auth_profile: Option<String>,
    pub timeout_ms: u64,
    pub run_id: String,
}

impl AgentRunLoop {
    pub fn new(
        auth: Arc<AuthProfileStore>,
        attempts: Arc<dyn LlmAttempt>,
        compactor: Arc<dyn CompactDirect>,
        fallback_models: Vec<String>,
    ) -> Self {
        Self { auth, attempts, compactor, fallback_models }
    }

    #[instrument(skip(self, input, cancel), fields(run_id = %input.run_id, session_key = %input.session_key))]
    pub async fn run(&self, input: RunInput, cancel: &CancellationToken) -> Result<RunResult, RunError> {
        let now_ms = now_ms();

        // Step 1 — select auth profile.
        let select_result = self.auth.select(&input.provider, input.pinned_auth_profile.as_deref(), now_ms);
        let (mut profile, mut source) = match select_result {
            Ok(pair) => pair,
            Err(e @ SelectError::AllInCooldown { .. }) => {
                if !self.fallback_models.is_empty() {
                    return Err(FailoverError {
                        reason: FailoverReason::RateLimit,
                        provider: input.provider.clone(),
                        model: input.model.clone(),
                    }
                    .into());
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut model = input.model.clone();
        let mut compactions_used = 0u32;
        let mut attempt_usage = AttemptUsage::default();

        for attempt_no in 1..=MAX_ATTEMPTS {
            let ctx = AttemptContext {
                session_key: input.session_key.clone(),
                session_id: input.session_id.clone(),
                session_file: input.session_file.clone(),
                workspace_dir: input.workspace_dir.clone(),
                agent_dir: input.agent_dir.clone(),
                prompt: input.prompt.clone(),
                provider: input.provider.clone(),
                model: model.clone(),
                auth_profile_id: profile.id.clone(),
                timeout_ms: input.timeout_ms,
                run_id: input.run_id.clone(),
                attempt: attempt_no,
            };

            let outcome = self.attempts.attempt(&ctx, cancel).await;
            attempt_usage.input += outcome.attempt_usage.input;
            attempt_usage.output += outcome.attempt_usage.output;
            attempt_usage.cache_read += outcome.attempt_usage.cache_read;
            attempt_usage.cache_write += outcome.attempt_usage.cache_write;

            // Compaction-induced abort is terminal, never a rotation trigger.
            if outcome.timed_out_during_compaction {
                return Ok(terminal_aborted(&outcome, &input.provider, &model, attempt_usage));
            }

            if outcome.aborted {
                return Ok(terminal_aborted(&outcome, &input.provider, &model, attempt_usage));
            }

            if outcome.timed_out {
                return Ok(RunResult {
                    payloads: vec![AssistantPayload {
                        text: "timed out".to_string(),
                        is_error: true,
                        error_kind: Some(ErrorKind::Timeout),
                    }],
                    meta: RunMeta {
                        agent_meta: AgentMeta { usage: attempt_usage },
                        error: Some(RunErrorMeta { kind: ErrorKind::Timeout }),
                        provider: input.provider.clone(),
                        model,
                    },
                });
            }

            // Step 3 — classify the outcome.
            let overflow_message = outcome
                .prompt_error
                .as_deref()
                .filter(|m| is_context_overflow(m))
                .or_else(|| {
                    outcome
                        .last_assistant
                        .as_ref()
                        .filter(|a| a.stop_reason == "error")
                        .and_then(|a| a.error_message.as_deref())
                        .filter(|m| is_context_overflow(m))
                });

            if let Some(msg) = overflow_message {
                if is_compaction_failure(msg) {
                    // Step 5 — compaction failure is terminal, no further compaction.
                    return Ok(RunResult {
                        payloads: vec![error_payload(ErrorKind::CompactionFailure)],
                        meta: RunMeta {
                            agent_meta: AgentMeta { usage: attempt_usage },
                            error: Some(RunErrorMeta { kind: ErrorKind::CompactionFailure }),
                            provider: input.provider.clone(),
                            model,
                        },
                    });
                }

                // Step 4 — context overflow handling.
                if compactions_used >= MAX_COMPACTIONS {
                    return Ok(RunResult {
                        payloads: vec![error_payload(ErrorKind::ContextOverflow)],
                        meta: RunMeta {
                            agent_meta: AgentMeta { usage: attempt_usage },
                            error: Some(RunErrorMeta { kind: ErrorKind::ContextOverflow }),
                            provider: input.provider.clone(),
                            model,
                        },
                    });
                }

                let compaction = self.compactor.compact(&input.session_key).await;
                compactions_used += 1;
                if !compaction.ok {
                    let truncated = self.compactor.truncate_tool_results(&input.session_key).await;
                    if !truncated {
                        return Ok(RunResult {
                            payloads: vec![error_payload(ErrorKind::ContextOverflow)],
                            meta: RunMeta {
                                agent_meta: AgentMeta { usage: attempt_usage },
                                error: Some(RunErrorMeta { kind: ErrorKind::ContextOverflow }),
                                provider: input.provider.clone(),
                                model,
                            },
                        });
                    }
                }
                // Retry the attempt (same profile, same model) with a
                // compacted/truncated session.
                continue;
            }

            // Assistant-level errors (rotation / billing).
            if let Some(assistant) = &outcome.last_assistant {
                if assistant.stop_reason == "error" {
                    let message = assistant.error_message.clone().unwrap_or_default();
                    let kind = classify_assistant_error(&message);

                    if kind == ErrorKind::Billing {
                        return Err(FailoverError {
                            reason: FailoverReason::Billing,
                            provider: input.provider.clone(),
                            model: model.clone(),
                        }
                        .into());
                    }

                    if kind == ErrorKind::RateLimit && triggers_rotation(&message) {
                        if source == ProfileSource::User {
                            if !self.fallback_models.is_empty() {
                                return Err(FailoverError {
                                    reason: FailoverReason::RateLimit,
                                    provider: input.provider.clone(),
                                    model: model.clone(),
                                }
                                .into());
                            }
                            // No fallback configured: surface as a rate-limit
                            // error payload rather than retrying a pin forever.
                            return Ok(RunResult {
                                payloads: vec![error_payload(ErrorKind::RateLimit)],
                                meta: RunMeta {
                                    agent_meta: AgentMeta { usage: attempt_usage },
                                    error: Some(RunErrorMeta { kind: ErrorKind::RateLimit }),
                                    provider: input.provider.clone(),
                                    model,
                                },
                            });
                        }

                        self.auth.record_rate_limit(
                            &profile.id,
                            now_ms,
                            crate::auth_profile::DEFAULT_COOLDOWN_MS,
                        );
                        match self.auth.select(&input.provider, None, now_ms) {
                            Ok((next_profile, next_source)) => {
                                warn!(
                                    from = %profile.id, to = %next_profile.id,
                                    "rate limit hit, rotating auth profile"
                                );
                                profile = next_profile;
                                source = next_source;
                                continue;
                            }
                            Err(_) => {
                                if !self.fallback_models.is_empty() {
                                    return Err(FailoverError {
                                        reason: FailoverReason::RateLimit,
                                        provider: input.provider.clone(),
                                        model: model.clone(),
                                    }
                                    .into());
                                }
                                return Ok(RunResult {
                                    payloads: vec![error_payload(ErrorKind::RateLimit)],
                                    meta: RunMeta {
                                        agent_meta: AgentMeta { usage: attempt_usage },
                                        error: Some(RunErrorMeta { kind: ErrorKind::RateLimit }),
                                        provider: input.provider.clone(),
                                        model,
                                    },
                                });
                            }
                        }
                    }

                    if kind == ErrorKind::Auth {
                        return Err(FailoverError {
                            reason: FailoverReason::Auth,
                            provider: input.provider.clone(),
                            model: model.clone(),
                        }
                        .into());
                    }

                    // Unknown assistant error: surface and stop.
                    return Ok(RunResult {
                        payloads: vec![error_payload(kind)],
                        meta: RunMeta {
                            agent_meta: AgentMeta { usage: attempt_usage },
                            error: Some(RunErrorMeta { kind }),
                            provider: input.provider.clone(),
                            model,
                        },
                    });
                }
            }

            // Success.
            self.auth.record_success(&profile.id, now_ms);
            let prompt_tokens = outcome
                .last_assistant
                .as_ref()
                .map(|a| a.usage.total)
                .unwrap_or(0);
            info!(prompt_tokens, attempts = attempt_no, "agent run completed");
            return Ok(RunResult {
                payloads: outcome
                    .assistant_texts
                    .iter()
                    .map(|t| AssistantPayload { text: t.clone(), is_error: false, error_kind: None })
                    .collect(),
                meta: RunMeta {
                    agent_meta: AgentMeta { usage: attempt_usage },
                    error: None,
                    provider: input.provider.clone(),
                    model: model.clone(),
                },
            });
        }

        // Exhausted MAX_ATTEMPTS without resolving — treat as an unknown error.
        Ok(RunResult {
            payloads: vec![error_payload(ErrorKind::Unknown)],
            meta: RunMeta {
                agent_meta: AgentMeta { usage: attempt_usage },
                error: Some(RunErrorMeta { kind: ErrorKind::Unknown }),
                provider: input.provider.clone(),
                model,
            },
        })
    }
}

fn terminal_aborted(outcome: &AttemptOutcome, provider: &str, model: &str, usage: AttemptUsage) -> RunResult {
    let text = outcome.assistant_texts.join("");
    RunResult {
        payloads: vec![AssistantPayload { text, is_error: false, error_kind: None }],
        meta: RunMeta {
            agent_meta: AgentMeta { usage },
            error: None,
            provider: provider.to_string(),
            model: model.to_string(),
        },
    }
}

fn error_payload(kind: ErrorKind) -> AssistantPayload {
    AssistantPayload {
        text: match kind {
            ErrorKind::ContextOverflow => "context window exceeded".to_string(),
            ErrorKind::CompactionFailure => "summarization failed".to_string(),
            ErrorKind::Timeout => "timed out".to_string(),
            ErrorKind::Auth => "authentication failed".to_string(),
            ErrorKind::Billing => "billing error".to_string(),
            ErrorKind::RateLimit => "rate limited".to_string(),
            ErrorKind::Unknown => "an unknown error occurred".to_string(),
        },
        is_error: true,
        error_kind: Some(kind),
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::auth_profile::AuthProfile;

    struct ScriptedAttempts {
        outcomes: StdMutex<Vec<AttemptOutcome>>,
    }

    #[async_trait]
    impl LlmAttempt for ScriptedAttempts {
        async fn attempt(&self, _ctx: &AttemptContext, _cancel: &CancellationToken) -> AttemptOutcome {
            let mut guard = self.outcomes.lock().unwrap();
            if guard.is_empty() {
                AttemptOutcome::default()
            } else {
                guard.remove(0)
            }
        }
    }

    struct AlwaysCompacts;

    #[async_trait]
    impl CompactDirect for AlwaysCompacts {
        async fn compact(&self, _session_key: &str) -> CompactOutcome {
            CompactOutcome { ok: true }
        }
        async fn truncate_tool_results(&self, _session_key: &str) -> bool {
            true
        }
    }

    fn success(text: &str) -> AttemptOutcome {
        AttemptOutcome {
            assistant_texts: vec![text.to_string()],
            last_assistant: Some(AssistantOutcome {
                stop_reason: "end_turn".to_string(),
                error_message: None,
                usage: LatestUsage { total: 10 },
            }),
            ..Default::default()
        }
    }

    fn rate_limited() -> AttemptOutcome {
        AttemptOutcome {
            last_assistant: Some(AssistantOutcome {
                stop_reason: "error".to_string(),
                error_message: Some("rate limit exceeded".to_string()),
                usage: LatestUsage::default(),
            }),
            ..Default::default()
        }
    }

    fn overflow() -> AttemptOutcome {
        AttemptOutcome {
            prompt_error: Some("context window exceeded".to_string()),
            ..Default::default()
        }
    }

    fn run_input() -> RunInput {
        RunInput {
            session_key: "sess-1".to_string(),
            session_id: "s1".to_string(),
            session_file: "/tmp/s1".to_string(),
            workspace_dir: "/tmp/ws".to_string(),
            agent_dir: "/tmp/agent".to_string(),
            prompt: "hi".to_string(),
            provider: "openai".to_string(),
            model: "gpt-5".to_string(),
            pinned_auth_profile: None,
            timeout_ms: 30_000,
            run_id: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn auto_pinned_rotation_succeeds_on_second_profile() {
        let auth = Arc::new(AuthProfileStore::new(vec![
            AuthProfile { id: "p1".to_string(), provider: "openai".to_string(), credential: "k1".to_string() },
            AuthProfile { id: "p2".to_string(), provider: "openai".to_string(), credential: "k2".to_string() },
        ]));
        let attempts = Arc::new(ScriptedAttempts {
            outcomes: StdMutex::new(vec![rate_limited(), success("ok")]),
        });
        let loop_ = AgentRunLoop::new(auth, attempts, Arc::new(AlwaysCompacts), vec![]);
        let cancel = CancellationToken::new();
        let result = loop_.run(run_input(), &cancel).await.unwrap();
        assert_eq!(result.payloads[0].text, "ok");
        assert!(result.meta.error.is_none());
    }

    #[tokio::test]
    async fn cooldown_failover_rejects_without_calling_llm() {
        let auth = Arc::new(AuthProfileStore::new(vec![
            AuthProfile { id: "p1".to_string(), provider: "openai".to_string(), credential: "k1".to_string() },
        ]));
        auth.record_rate_limit("p1", now_ms(), 3_600_000);
        let attempts = Arc::new(ScriptedAttempts { outcomes: StdMutex::new(vec![success("unused")]) });
        let loop_ = AgentRunLoop::new(auth, attempts, Arc::new(AlwaysCompacts), vec!["fallback-model".to_string()]);
        let cancel = CancellationToken::new();
        let err = loop_.run(run_input(), &cancel).await.unwrap_err();
        assert!(matches!(err, RunError::Failover(FailoverError { reason: FailoverReason::RateLimit, .. })));
    }

    #[tokio::test]
    async fn context_overflow_exhausts_three_compactions_then_terminates() {
        let auth = Arc::new(AuthProfileStore::new(vec![
            AuthProfile { id: "p1".to_string(), provider: "openai".to_string(), credential: "k1".to_string() },
        ]));
        let attempts = Arc::new(ScriptedAttempts {
            outcomes: StdMutex::new(vec![overflow(), overflow(), overflow(), overflow()]),
        });
        let loop_ = AgentRunLoop::new(auth, attempts, Arc::new(AlwaysCompacts), vec![]);
        let cancel = CancellationToken::new();
        let result = loop_.run(run_input(), &cancel).await.unwrap();
        assert_eq!(result.meta.error.unwrap().kind, ErrorKind::ContextOverflow);
    }

    #[tokio::test]
    async fn compaction_failure_message_is_terminal_immediately() {
        let auth = Arc::new(AuthProfileStore::new(vec![
            AuthProfile { id: "p1".to_string(), provider: "openai".to_string(), credential: "k1".to_string() },
        ]));
        let attempts = Arc::new(ScriptedAttempts {
            outcomes: StdMutex::new(vec![AttemptOutcome {
                prompt_error: Some("context window exceeded: summarization failed".to_string()),
                ..Default::default()
            }]),
        });
        let loop_ = AgentRunLoop::new(auth, attempts, Arc::new(AlwaysCompacts), vec![]);
        let cancel = CancellationToken::new();
        let result = loop_.run(run_input(), &cancel).await.unwrap();
        assert_eq!(result.meta.error.unwrap().kind, ErrorKind::CompactionFailure);
    }

    #[tokio::test]
    async fn timeout_without_reply_yields_explicit_payload() {
        let auth = Arc::new(AuthProfileStore::new(vec![
            AuthProfile { id: "p1".to_string(), provider: "openai".to_string(), credential: "k1".to_string() },
        ]));
        let attempts = Arc::new(ScriptedAttempts {
            outcomes: StdMutex::new(vec![AttemptOutcome { timed_out: true, ..Default::default() }]),
        });
        let loop_ = AgentRunLoop::new(auth, attempts, Arc::new(AlwaysCompacts), vec![]);
        let cancel = CancellationToken::new();
        let result = loop_.run(run_input(), &cancel).await.unwrap();
        assert_eq!(result.payloads[0].text, "timed out");
    }
}
