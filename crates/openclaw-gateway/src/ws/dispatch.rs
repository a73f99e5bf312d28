use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use openclaw_protocol::{frames::ResFrame, methods};

use crate::app::AppState;
use crate::{chat, ws::handlers};

type WsSink = SplitSink<WebSocket, Message>;

/// Route a WS method call to the correct handler.
///
/// `tx` is threaded through for methods that might need to push frames of
/// their own ahead of the final response; every handler today streams
/// progress through `AppState::broadcast_event` instead, so it currently
/// goes unused, but keeping it in the signature means a future handler
/// doesn't need a dispatcher rewrite to get it.
pub async fn route(
    method: &str,
    params: Option<&serde_json::Value>,
    req_id: &str,
    app: &Arc<AppState>,
    _tx: &mut WsSink,
) -> ResFrame {
    match method {
        "ping" => ResFrame::ok(req_id, serde_json::json!({ "pong": true })),

        methods::AGENT_STATUS => ResFrame::ok(
            req_id,
            serde_json::json!({
                "agents": [{
                    "id": "main",
                    "model": "claude-sonnet-4-6",
                    "status": "idle"
                }]
            }),
        ),

        methods::CHAT_HISTORY => chat::handlers::chat_history(params, req_id, app).await,
        methods::CHAT_SEND => chat::handlers::chat_send(params, req_id, app).await,
        methods::CHAT_ABORT => chat::handlers::chat_abort(params, req_id, app).await,
        methods::CHAT_INJECT => chat::handlers::chat_inject(params, req_id, app).await,

        methods::MESH_RUN => chat::mesh::mesh_run(params, req_id, app).await,
        methods::MESH_STATUS => chat::mesh::mesh_status(params, req_id, app).await,
        methods::MESH_CANCEL => chat::mesh::mesh_cancel(params, req_id, app).await,
        methods::MESH_RETRY => chat::mesh::mesh_retry(params, req_id, app).await,

        methods::SESSIONS_LIST => handlers::handle_sessions_list(params, req_id, app).await,
        methods::SESSIONS_GET => handlers::handle_sessions_get(params, req_id, app).await,

        methods::MEMORY_SEARCH => handlers::handle_memory_search(params, req_id, app).await,
        methods::MEMORY_LEARN => handlers::handle_memory_learn(params, req_id, app).await,
        methods::MEMORY_FORGET => handlers::handle_memory_forget(params, req_id, app).await,

        methods::CRON_LIST => handlers::handle_cron_list(req_id, app).await,
        methods::CRON_ADD => handlers::handle_cron_add(params, req_id, app).await,
        methods::CRON_DELETE => handlers::handle_cron_remove(params, req_id, app).await,

        methods::TERMINAL_EXEC => handlers::handle_terminal_exec(params, req_id, app).await,
        methods::TERMINAL_CREATE => handlers::handle_terminal_create(params, req_id, app).await,
        methods::TERMINAL_WRITE => handlers::handle_terminal_write(params, req_id, app).await,
        methods::TERMINAL_READ => handlers::handle_terminal_read(params, req_id, app).await,
        methods::TERMINAL_KILL => handlers::handle_terminal_kill(params, req_id, app).await,
        methods::TERMINAL_LIST => handlers::handle_terminal_list(req_id, app).await,
        methods::TERMINAL_EXEC_BG => handlers::handle_terminal_exec_bg(params, req_id, app).await,
        methods::TERMINAL_JOB_STATUS => {
            handlers::handle_terminal_job_status(params, req_id, app).await
        }
        methods::TERMINAL_JOB_LIST => handlers::handle_terminal_job_list(req_id, app).await,
        methods::TERMINAL_JOB_KILL => handlers::handle_terminal_job_kill(params, req_id, app).await,

        _ => ResFrame::err(
            req_id,
            "METHOD_NOT_FOUND",
            &format!("method '{}' not yet implemented", method),
        ),
    }
}
