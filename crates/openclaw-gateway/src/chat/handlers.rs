//! `chat.history` / `chat.send` / `chat.abort` / `chat.inject` — the
//! web-chat RPC surface. Mirrors `ws/handlers.rs`'s flat
//! `handle_X(params, req_id, app) -> ResFrame` shape, generalized to take
//! `Arc<AppState>` since `chat.send` spawns a detached task that outlives
//! the request.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use openclaw_agent::run_loop::RunResult;
use openclaw_memory::types::ConversationMessage;
use openclaw_protocol::frames::ResFrame;
use openclaw_queue::FollowupItem;

use crate::app::AppState;
use crate::chat::sanitize::sanitize_message;

const DEFAULT_HISTORY_LIMIT: usize = 200;
const MAX_HISTORY_LIMIT: usize = 1000;
/// Byte budget for `chat.history` responses — oldest messages are dropped
/// first once the running total would exceed this.
const HISTORY_BYTE_BUDGET: usize = 256 * 1024;
const DEFAULT_RUN_TIMEOUT_MS: u64 = 120_000;

fn idempotency_slot(session_key: &str, idempotency_key: &str) -> String {
    format!("{session_key}:{idempotency_key}")
}

/// True if `app.transcripts` already has a file (i.e. the webchat session
/// has sent at least one message before) for `session_key`. Web-chat
/// sessions aren't rows in `SessionManager`'s SQLite table the way
/// channel-adapter sessions are, so existence is judged from the transcript
/// itself rather than from the session store.
fn session_exists(app: &AppState, session_key: &str) -> bool {
    app.transcripts
        .read_all(session_key)
        .map(|m| !m.is_empty())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// chat.history
// ---------------------------------------------------------------------------

pub async fn chat_history(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let session_key = match params.and_then(|p| p.get("sessionKey")).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'sessionKey' field"),
    };
    let limit = params
        .and_then(|p| p.get("limit"))
        .and_then(|v| v.as_u64())
        .map(|n| (n as usize).min(MAX_HISTORY_LIMIT))
        .unwrap_or(DEFAULT_HISTORY_LIMIT);

    let records = match app.transcripts.read_all(session_key) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "chat.history failed");
            return ResFrame::err(req_id, "INTERNAL_ERROR", &e.to_string());
        }
    };

    let tail: Vec<_> = records.into_iter().rev().take(limit).collect();
    let mut kept = Vec::with_capacity(tail.len());
    let mut total_bytes = 0usize;
    for record in tail {
        let entry = serde_json::json!({
            "id": record.id,
            "role": record.role,
            "content": record.content,
            "timestamp": record.timestamp,
        });
        let size = entry.to_string().len();
        if total_bytes + size > HISTORY_BYTE_BUDGET {
            break;
        }
        total_bytes += size;
        kept.push(entry);
    }
    kept.reverse();

    ResFrame::ok(req_id, serde_json::json!({ "messages": kept }))
}

// ---------------------------------------------------------------------------
// chat.send
// ---------------------------------------------------------------------------

pub async fn chat_send(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let p = match params {
        Some(p) => p,
        None => return ResFrame::err(req_id, "INVALID_PARAMS", "params object required"),
    };
    let session_key = match p.get("sessionKey").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'sessionKey' field"),
    };
    let raw_message = match p.get("message").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'message' field"),
    };
    let idempotency_key = match p.get("idempotencyKey").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'idempotencyKey' field"),
    };
    let timeout_ms = p
        .get("timeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_RUN_TIMEOUT_MS);

    let message = sanitize_message(raw_message);

    if message.trim() == "/stop" {
        let aborted = abort_runs(app, &session_key, None, "stop-command").await;
        return ResFrame::ok(req_id, serde_json::json!({ "ok": true, "aborted": aborted }));
    }

    let slot = idempotency_slot(&session_key, &idempotency_key);
    if let Some(existing) = app.idempotency.get(&slot) {
        return ResFrame::ok(
            req_id,
            serde_json::json!({ "runId": existing.value().clone(), "status": "started" }),
        );
    }

    // A non-terminal run already exists for this session: queue the
    // message as a follow-up instead of starting a second concurrent run
    // (§5's "at most one non-terminal AgentRun per session-key").
    let already_running = app.runs.iter().any(|e| {
        e.value().session_key == session_key && !e.value().done.load(Ordering::SeqCst)
    });
    if already_running {
        app.queue.enqueue(
            &session_key,
            FollowupItem {
                prompt: message,
                message_id: Some(idempotency_key),
                origin: None,
                enqueued_at_ms: chrono::Utc::now().timestamp_millis(),
            },
        );
        return ResFrame::ok(req_id, serde_json::json!({ "status": "queued" }));
    }

    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = app.memory.save_message(&ConversationMessage {
        id: 0,
        user_id: None,
        session_key: session_key.clone(),
        channel: "webchat".to_string(),
        role: "user".to_string(),
        content: message.clone(),
        model_used: None,
        tokens_in: 0,
        tokens_out: 0,
        cost_usd: 0.0,
        created_at: now,
    }) {
        warn!(error = %e, "chat.send: failed to persist user turn");
        return ResFrame::err(req_id, "INTERNAL_ERROR", &e.to_string());
    }
    let _ = app.transcripts.append_message(&session_key, "user", &message, None, None);

    let run_id = uuid::Uuid::now_v7().to_string();
    app.idempotency.insert(slot, run_id.clone());

    let app_bg = Arc::clone(app);
    let session_key_bg = session_key.clone();
    let run_id_bg = run_id.clone();
    tokio::spawn(async move {
        let result =
            crate::chat::run::execute_run(&app_bg, session_key_bg.clone(), message, timeout_ms, run_id_bg.clone())
                .await;
        match result {
            Ok(r) => {
                persist_run_result(&app_bg, &session_key_bg, &run_id_bg, &r);
                broadcast_run_outcome(&app_bg, &session_key_bg, &run_id_bg, &r);
            }
            Err(e) => {
                warn!(session_key = %session_key_bg, run_id = %run_id_bg, error = %e, "chat.send run failed");
                app_bg.broadcast_event(
                    "chat",
                    serde_json::json!({
                        "state": "error",
                        "runId": run_id_bg,
                        "sessionKey": session_key_bg,
                        "errorMessage": e.to_string(),
                    }),
                );
            }
        }
    });

    ResFrame::ok(req_id, serde_json::json!({ "runId": run_id, "status": "started" }))
}

/// Persist a finished run's assistant output to both the SQLite context
/// window (`memory`) and the NDJSON transcript, same shape
/// `process_message_non_streaming` uses for every other channel.
pub fn persist_run_result(app: &AppState, session_key: &str, run_id: &str, result: &RunResult) {
    let text: String = result
        .payloads
        .iter()
        .filter(|p| !p.is_error)
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        return;
    }
    let now = chrono::Utc::now().to_rfc3339();
    let _ = app.memory.save_message(&ConversationMessage {
        id: 0,
        user_id: None,
        session_key: session_key.to_string(),
        channel: "webchat".to_string(),
        role: "assistant".to_string(),
        content: text.clone(),
        model_used: Some(result.meta.model.clone()),
        tokens_in: result.meta.agent_meta.usage.input as u32,
        tokens_out: result.meta.agent_meta.usage.output as u32,
        cost_usd: 0.0,
        created_at: now,
    });
    let _ = app.transcripts.append_message(
        session_key,
        "assistant",
        &text,
        Some(&format!("{run_id}:assistant")),
        None,
    );
}

fn broadcast_run_outcome(app: &AppState, session_key: &str, run_id: &str, result: &RunResult) {
    if let Some(err) = &result.meta.error {
        let message = result
            .payloads
            .iter()
            .find(|p| p.is_error)
            .map(|p| p.text.clone())
            .unwrap_or_else(|| format!("{:?}", err.kind));
        app.broadcast_event(
            "chat",
            serde_json::json!({
                "state": "error",
                "runId": run_id,
                "sessionKey": session_key,
                "errorMessage": message,
            }),
        );
    } else {
        let text: String = result
            .payloads
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        app.broadcast_event(
            "chat",
            serde_json::json!({
                "state": "final",
                "runId": run_id,
                "sessionKey": session_key,
                "message": text,
            }),
        );
    }
}

// ---------------------------------------------------------------------------
// chat.abort
// ---------------------------------------------------------------------------

pub async fn chat_abort(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let session_key = match params.and_then(|p| p.get("sessionKey")).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'sessionKey' field"),
    };
    let run_id = params.and_then(|p| p.get("runId")).and_then(|v| v.as_str());

    let aborted = abort_runs(app, session_key, run_id, "rpc").await;
    ResFrame::ok(req_id, serde_json::json!({ "ok": true, "aborted": aborted }))
}

/// Cancels every matching non-terminal run for `session_key` (or just
/// `run_id` if given), persisting an idempotent abort record for any run
/// with accumulated partial text. Returns the list of aborted run ids.
async fn abort_runs(
    app: &Arc<AppState>,
    session_key: &str,
    run_id: Option<&str>,
    origin: &str,
) -> Vec<String> {
    let targets: Vec<_> = app
        .runs
        .iter()
        .filter(|e| {
            e.value().session_key == session_key
                && run_id.map(|id| id == e.key().as_str()).unwrap_or(true)
        })
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();

    let mut aborted = Vec::with_capacity(targets.len());
    for (id, handle) in targets {
        handle.cancel.cancel();
        let partial = handle.partial_text.lock().unwrap().clone();
        if !partial.is_empty() {
            let meta = serde_json::json!({
                "openclawAbort": { "aborted": true, "origin": origin, "runId": id }
            });
            let _ = app.transcripts.append_message(
                session_key,
                "assistant",
                &partial,
                Some(&format!("{id}:assistant")),
                Some(meta),
            );
        }
        aborted.push(id);
    }
    aborted
}

// ---------------------------------------------------------------------------
// chat.inject
// ---------------------------------------------------------------------------

pub async fn chat_inject(params: Option<&Value>, req_id: &str, app: &Arc<AppState>) -> ResFrame {
    let p = match params {
        Some(p) => p,
        None => return ResFrame::err(req_id, "INVALID_PARAMS", "params object required"),
    };
    let session_key = match p.get("sessionKey").and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => s,
        _ => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'sessionKey' field"),
    };
    let message = match p.get("message").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return ResFrame::err(req_id, "INVALID_PARAMS", "missing 'message' field"),
    };
    let label = p.get("label").and_then(|v| v.as_str());

    if !session_exists(app, session_key) {
        return ResFrame::err(req_id, "NOT_FOUND", &format!("session not found: {session_key}"));
    }

    let content = match label {
        Some(l) => format!("[{l}] {message}"),
        None => message.to_string(),
    };

    match app.transcripts.append_message(session_key, "assistant", &content, None, None) {
        Ok(record) => {
            app.broadcast_event(
                "chat",
                serde_json::json!({
                    "state": "injected",
                    "sessionKey": session_key,
                    "message": content,
                }),
            );
            ResFrame::ok(req_id, serde_json::json!({ "id": record.id }))
        }
        Err(e) => {
            warn!(error = %e, "chat.inject failed");
            ResFrame::err(req_id, "INTERNAL_ERROR", &e.to_string())
        }
    }
}
