//! Drives one web-chat `AgentRun` to completion and tracks it in
//! `AppState::runs` so `chat.abort` can cancel it and persist whatever
//! partial text it had accumulated (§4.3, §4.7, §5 "at most one
//! non-terminal AgentRun per session-key").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use openclaw_agent::auth_profile::{AuthProfile, AuthProfileStore};
use openclaw_agent::run_loop::{AgentRunLoop, AssistantPayload, RunError, RunInput, RunResult};
use openclaw_dispatch::{DeliveredPayload, Deliver, DispatchConfig, Payload, ReplyDispatcher};
use openclaw_queue::{Clock, OriginTarget, RunFollowup};

use crate::app::AppState;
use crate::chat::attempt::{compactor_for, GatewayLlmAttempt};

/// Wall-clock `QueueManager::Clock` — the queue only needs millisecond
/// timestamps for debounce/cooldown math, no test seam required at the
/// gateway layer (unlike `openclaw-queue`'s own unit tests, which use a
/// fake clock).
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Bookkeeping for one in-flight (or just-finished) run, looked up by
/// `chat.abort` and by `sessions.get`/`chat.history` callers wanting to know
/// whether a session currently has a non-terminal run.
pub struct RunHandle {
    pub session_key: String,
    pub cancel: CancellationToken,
    pub partial_text: StdMutex<String>,
    pub done: AtomicBool,
}

/// One fresh [`AuthProfileStore`] seeded from whatever provider the gateway
/// is currently configured with. The web-chat surface doesn't (yet) expose
/// per-call provider pinning, so a single "default" profile is enough to
/// satisfy `AgentRunLoop::run`'s profile-selection step without changing its
/// behavior for the common single-credential case.
pub fn default_auth_profiles(provider_name: &str) -> Arc<AuthProfileStore> {
    Arc::new(AuthProfileStore::new(vec![AuthProfile {
        id: "default".to_string(),
        provider: provider_name.to_string(),
        credential: String::new(),
    }]))
}

/// Run one AgentRun to completion, registering a [`RunHandle`] in
/// `app.runs` for the duration so `chat.abort` can find and cancel it.
pub async fn execute_run(
    app: &Arc<AppState>,
    session_key: String,
    prompt: String,
    timeout_ms: u64,
    run_id: String,
) -> Result<RunResult, RunError> {
    let cancel = CancellationToken::new();
    let handle = Arc::new(RunHandle {
        session_key: session_key.clone(),
        cancel: cancel.clone(),
        partial_text: StdMutex::new(String::new()),
        done: AtomicBool::new(false),
    });
    app.runs.insert(run_id.clone(), handle.clone());

    let model = app.agent.get_model().await;
    let provider_name = app.agent.provider().name().to_string();
    let input = RunInput {
        session_key: session_key.clone(),
        session_id: session_key.clone(),
        session_file: format!("webchat:{session_key}"),
        workspace_dir: ".".to_string(),
        agent_dir: ".".to_string(),
        prompt,
        provider: provider_name,
        model,
        pinned_auth_profile: None,
        timeout_ms,
        run_id: run_id.clone(),
    };

    let run_loop = AgentRunLoop::new(
        app.auth_profiles.clone(),
        Arc::new(GatewayLlmAttempt { app: Arc::clone(app), channel_name: "webchat".to_string() }),
        compactor_for(app),
        Vec::new(),
    );

    let mut result = run_loop.run(input, &cancel).await;

    if let Ok(r) = &mut result {
        r.payloads = apply_reply_dispatch(app, r.payloads.drain(..).collect()).await;
        let text: String = r
            .payloads
            .iter()
            .filter(|p| !p.is_error)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        *handle.partial_text.lock().unwrap() = text;
    }
    handle.done.store(true, Ordering::SeqCst);
    app.runs.remove(&run_id);
    result
}

/// Collects whatever [`ReplyDispatcher`] decides to actually deliver, in
/// order, so the caller can use the filtered/prefixed text instead of the
/// run loop's raw payloads.
struct CollectingDeliver {
    log: StdMutex<Vec<DeliveredPayload>>,
}

impl CollectingDeliver {
    fn new() -> Self {
        Self { log: StdMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Deliver for CollectingDeliver {
    async fn deliver(&self, payload: DeliveredPayload) -> Result<(), String> {
        self.log.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Runs every non-error payload from one `AgentRun` through the §4.4 reply
/// dispatcher (silent/heartbeat token filtering, response-prefix dedup)
/// before it reaches `persist_run_result`/`broadcast_run_outcome`. Error
/// payloads pass through untouched — filtering an error message the same
/// way as conversational text would risk silently dropping it.
async fn apply_reply_dispatch(app: &Arc<AppState>, payloads: Vec<AssistantPayload>) -> Vec<AssistantPayload> {
    if payloads.iter().all(|p| p.is_error) {
        return payloads;
    }

    let deliver = Arc::new(CollectingDeliver::new());
    let config = DispatchConfig { response_prefix: app.config.agent.response_prefix.clone(), ..Default::default() };
    let dispatcher = ReplyDispatcher::new(deliver.clone(), config);

    let mut out = Vec::with_capacity(payloads.len());
    let last_idx = payloads.iter().rposition(|p| !p.is_error);
    for (i, payload) in payloads.into_iter().enumerate() {
        if payload.is_error {
            out.push(payload);
            continue;
        }
        let before = deliver.log.lock().unwrap().len();
        let delivered = if Some(i) == last_idx {
            dispatcher.send_final(Payload::text(payload.text)).await
        } else {
            dispatcher.send_block(Payload::text(payload.text)).await
        };
        if delivered {
            let log = deliver.log.lock().unwrap();
            if let Some(d) = log.get(before) {
                out.push(AssistantPayload { text: d.text.clone(), is_error: false, error_kind: None });
            }
        }
    }
    dispatcher.mark_complete().await;
    out
}

/// Adapts `AppState` into [`RunFollowup`] for `openclaw_queue::QueueManager`
/// — once a session's in-flight run ends, queued follow-ups replay through
/// the exact same run machinery `chat.send` uses for the first message.
pub struct ChatFollowupRunner {
    pub app: Weak<AppState>,
}

#[async_trait]
impl RunFollowup for ChatFollowupRunner {
    async fn run(
        &self,
        session_key: &str,
        prompt: &str,
        _origin: Option<&OriginTarget>,
        _last_run: &Value,
    ) -> Result<Value, String> {
        let app = self.app.upgrade().ok_or("gateway shut down")?;
        let now = chrono::Utc::now().to_rfc3339();
        let _ = app.memory.save_message(&openclaw_memory::types::ConversationMessage {
            id: 0,
            user_id: None,
            session_key: session_key.to_string(),
            channel: "webchat".to_string(),
            role: "user".to_string(),
            content: prompt.to_string(),
            model_used: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            created_at: now,
        });

        let run_id = uuid::Uuid::now_v7().to_string();
        match execute_run(&app, session_key.to_string(), prompt.to_string(), 120_000, run_id.clone()).await {
            Ok(r) => {
                crate::chat::handlers::persist_run_result(&app, session_key, &run_id, &r);
                Ok(serde_json::json!({ "runId": run_id, "ok": true }))
            }
            Err(e) => {
                warn!(session_key, error = %e, "queued follow-up run failed");
                Err(e.to_string())
            }
        }
    }
}
