//! OpenAI-compatible /v1/chat/completions endpoint.
//! Enables integration with Cursor, Continue, Open Interpreter, and any
//! client that speaks the OpenAI API format.
//!
//! This is an alternate ingress, not a shortcut: every request is resolved
//! to a canonical session key through the same [`openclaw_router::route`]
//! every channel adapter uses, and the turn itself runs through the
//! follow-up queue and [`openclaw_agent::run_loop::AgentRunLoop`] exactly
//! like `chat.send` — a request that lands while a run is already in
//! flight for that session is queued as a follow-up rather than racing it
//! (§5: "at most one non-terminal AgentRun per session-key").

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use openclaw_agent::stream::StreamEvent;
use openclaw_agent::stream_subscription::{BreakMode, StreamSubscription};
use openclaw_memory::types::ConversationMessage;
use openclaw_queue::FollowupItem;
use openclaw_router::{route, PeerKind, RouteInput};

use crate::app::AppState;

/// Run timeout for a turn started directly by this endpoint, and the total
/// budget allowed while awaiting a turn that had to be queued behind an
/// in-flight run.
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
/// How often to poll for a queued follow-up's drained result. This ingress
/// has no WebSocket to push the result over, so it polls the same way
/// `GET /notifications` clients poll for pending messages.
const QUEUE_POLL_INTERVAL_MS: u64 = 250;
/// Break boundaries used to re-chunk a completed turn's text into
/// SSE deltas for `stream: true` requests (§4.6).
const STREAM_MIN_CHARS: usize = 40;
const STREAM_MAX_CHARS: usize = 400;

/// POST /v1/chat/completions — OpenAI-compatible chat endpoint.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenAiRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<OpenAiError>)> {
    let user_message = req.last_user_message().ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(OpenAiError::new("no user message found")),
        )
    })?;

    let session_key = resolve_session_key(&state, req.user.as_deref());
    info!(model = %req.model, stream = req.stream, session_key = %session_key, "OpenAI compat request");

    if req.stream {
        Ok(handle_streaming(state, session_key, user_message)
            .await
            .into_response())
    } else {
        Ok(handle_non_streaming(&state, session_key, &user_message)
            .await
            .into_response())
    }
}

/// Maps this ingress's request into [`openclaw_router::route`], the same
/// pure binding resolution every other channel adapter goes through
/// (§4.1), instead of this endpoint inventing its own session identity.
fn resolve_session_key(state: &AppState, user: Option<&str>) -> String {
    let input = RouteInput {
        channel: "openai_compat".to_string(),
        peer_kind: PeerKind::User,
        peer_id: user.unwrap_or("anonymous").to_string(),
        account_id: None,
        thread_id: None,
        sender_id: None,
        raw_session_key_override: None,
    };
    route(&input, &state.config.bindings).session_key.format()
}

/// Outcome of one turn, independent of whether it ran directly or was
/// drained from the follow-up queue.
struct TurnResult {
    text: String,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    is_error: bool,
}

/// Starts a new run directly when the resolved session is idle, or
/// enqueues `message` as a follow-up and awaits the drained result when a
/// non-terminal run already exists for it — mirrors
/// `crate::chat::handlers::chat_send`'s direct-vs-queued branch.
async fn run_turn(app: &Arc<AppState>, session_key: &str, message: &str) -> Result<TurnResult, String> {
    let already_running = app
        .runs
        .iter()
        .any(|e| e.value().session_key == session_key && !e.value().done.load(Ordering::SeqCst));

    if already_running {
        return run_via_queue(app, session_key, message).await;
    }

    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = app.memory.save_message(&ConversationMessage {
        id: 0,
        user_id: None,
        session_key: session_key.to_string(),
        channel: "openai_compat".to_string(),
        role: "user".to_string(),
        content: message.to_string(),
        model_used: None,
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: 0.0,
        created_at: now,
    }) {
        return Err(e.to_string());
    }
    let _ = app.transcripts.append_message(session_key, "user", message, None, None);

    let run_id = uuid::Uuid::now_v7().to_string();
    let result = crate::chat::run::execute_run(
        app,
        session_key.to_string(),
        message.to_string(),
        DEFAULT_TIMEOUT_MS,
        run_id.clone(),
    )
    .await
    .map_err(|e| e.to_string())?;

    crate::chat::handlers::persist_run_result(app, session_key, &run_id, &result);

    let text: String = result
        .payloads
        .iter()
        .filter(|p| !p.is_error)
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let is_error = result.meta.error.is_some();

    Ok(TurnResult {
        text,
        model: result.meta.model,
        tokens_in: result.meta.agent_meta.usage.input as u32,
        tokens_out: result.meta.agent_meta.usage.output as u32,
        is_error,
    })
}

/// Enqueues `message` on the session's existing follow-up queue (the same
/// `openclaw_queue::QueueManager` instance `chat.send` drains through) and
/// polls conversation history for the assistant reply it eventually
/// produces.
async fn run_via_queue(app: &Arc<AppState>, session_key: &str, message: &str) -> Result<TurnResult, String> {
    let baseline_id = app.memory.get_history(session_key, 1).unwrap_or_default().first().map(|m| m.id);

    app.queue.enqueue(
        session_key,
        FollowupItem {
            prompt: message.to_string(),
            message_id: None,
            origin: None,
            enqueued_at_ms: chrono::Utc::now().timestamp_millis(),
        },
    );

    let deadline = tokio::time::Instant::now() + Duration::from_millis(DEFAULT_TIMEOUT_MS);
    loop {
        tokio::time::sleep(Duration::from_millis(QUEUE_POLL_INTERVAL_MS)).await;
        let latest = app.memory.get_history(session_key, 1).unwrap_or_default().into_iter().next();
        if let Some(msg) = latest {
            if msg.role == "assistant" && Some(msg.id) != baseline_id {
                return Ok(TurnResult {
                    text: msg.content,
                    model: msg.model_used.unwrap_or_default(),
                    tokens_in: msg.tokens_in,
                    tokens_out: msg.tokens_out,
                    is_error: false,
                });
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err("timed out waiting for queued turn".to_string());
        }
    }
}

async fn handle_non_streaming(state: &Arc<AppState>, session_key: String, message: &str) -> impl IntoResponse {
    match run_turn(state, &session_key, message).await {
        Ok(turn) if !turn.is_error => {
            let reply = OpenAiResponse {
                id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
                object: "chat.completion".to_string(),
                model: turn.model,
                choices: vec![Choice {
                    index: 0,
                    message: Some(OpenAiMessage {
                        role: "assistant".to_string(),
                        content: Some(turn.text),
                    }),
                    delta: None,
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Some(Usage {
                    prompt_tokens: turn.tokens_in,
                    completion_tokens: turn.tokens_out,
                    total_tokens: turn.tokens_in + turn.tokens_out,
                }),
            };
            (StatusCode::OK, Json(reply)).into_response()
        }
        Ok(turn) => {
            warn!(error = %turn.text, "chat completions run finished with an error result");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(OpenAiError::new(&turn.text))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "chat completions failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(OpenAiError::new(&e))).into_response()
        }
    }
}

/// Runs the turn to completion, then re-chunks its final text through a
/// [`StreamSubscription`] (§4.6) so OpenAI-compat clients still see
/// incremental `chat.completion.chunk` deltas instead of one giant blob —
/// the run loop itself has no token-level stream to forward, but the break
/// logic that decides where to cut blocks is the real §4.6 implementation,
/// not an ad hoc re-split.
async fn handle_streaming(
    state: Arc<AppState>,
    session_key: String,
    message: String,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    let stream = async_stream::stream! {
        let turn = match run_turn(&state, &session_key, &message).await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "streaming chat completions failed");
                yield Ok(Event::default().data(
                    format!("{{\"error\":{{\"message\":\"{}\"}}}}", e.replace('"', "'"))
                ));
                yield Ok(Event::default().data("[DONE]"));
                return;
            }
        };

        if turn.is_error {
            warn!(error = %turn.text, "streaming chat completions run finished with an error result");
            yield Ok(Event::default().data(
                format!("{{\"error\":{{\"message\":\"{}\"}}}}", turn.text.replace('"', "'"))
            ));
            yield Ok(Event::default().data("[DONE]"));
            return;
        }

        let mut sub = StreamSubscription::new(BreakMode::Chunked {
            min_chars: STREAM_MIN_CHARS,
            max_chars: STREAM_MAX_CHARS,
        });
        let mut blocks = sub.feed(&StreamEvent::TextDelta { text: turn.text.clone() });
        blocks.extend(sub.feed(&StreamEvent::TextEnd { text: turn.text }));
        blocks.extend(sub.finish());

        for block in blocks {
            let chunk = OpenAiResponse {
                id: id.clone(),
                object: "chat.completion.chunk".to_string(),
                model: turn.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: None,
                    delta: Some(OpenAiMessage {
                        role: "assistant".to_string(),
                        content: Some(block),
                    }),
                    finish_reason: None,
                }],
                usage: None,
            };
            let json = serde_json::to_string(&chunk).unwrap_or_default();
            yield Ok(Event::default().data(json));
        }

        let done_chunk = OpenAiResponse {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            model: turn.model,
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(OpenAiMessage { role: "assistant".to_string(), content: None }),
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        };
        let json = serde_json::to_string(&done_chunk).unwrap_or_default();
        yield Ok(Event::default().data(json));
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── OpenAI API types ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[allow(dead_code)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// OpenAI's optional end-user identifier — used here as the routing
    /// peer id so repeated calls from the same caller land on the same
    /// session (falls back to `"anonymous"` when absent).
    #[serde(default)]
    pub user: Option<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

impl OpenAiRequest {
    fn last_user_message(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.clone())
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Serialize)]
struct OpenAiResponse {
    id: String,
    object: String,
    model: String,
    choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

#[derive(Serialize)]
struct Choice {
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<String>,
}

#[derive(Serialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Serialize)]
pub struct OpenAiError {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl OpenAiError {
    fn new(msg: &str) -> Self {
        Self {
            error: ErrorBody {
                message: msg.to_string(),
                error_type: "invalid_request_error".to_string(),
            },
        }
    }
}
