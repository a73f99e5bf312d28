use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use openclaw_agent::auth_profile::AuthProfileStore;
use openclaw_agent::runtime::AgentRuntime;
use openclaw_core::config::OpenclawConfig;
use openclaw_core::types::ChannelOutbound;
use openclaw_memory::manager::MemoryManager;
use openclaw_queue::QueueManager;
use openclaw_scheduler::SchedulerHandle;
use openclaw_sessions::transcript::TranscriptStore;
use openclaw_sessions::SessionManager;
use openclaw_terminal::manager::TerminalManager;
use openclaw_users::resolver::UserResolver;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::mesh::MeshRun;
use crate::chat::run::{ChatFollowupRunner, RunHandle, SystemClock};
use crate::ws::broadcast::EventBroadcaster;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: OpenclawConfig,
    pub event_seq: AtomicU64,
    #[allow(dead_code)]
    pub presence_version: AtomicU64,
    pub broadcaster: EventBroadcaster,
    pub agent: AgentRuntime,
    pub users: UserResolver,
    pub memory: MemoryManager,
    pub sessions: SessionManager,
    pub scheduler: SchedulerHandle,
    /// Terminal subsystem — tokio::sync::Mutex because create_session, kill,
    /// exec_background, and job_kill are async and must be awaited while the
    /// lock is held.
    pub terminal: tokio::sync::Mutex<TerminalManager>,
    /// Active WS connections: conn_id -> message sender.
    pub ws_clients: DashMap<String, mpsc::Sender<String>>,
    /// Notification queue for HTTP/terminal clients: session_key -> pending messages.
    /// Drained by `GET /notifications`.
    pub notifications: DashMap<String, Vec<String>>,
    /// Active pipeline operations: session_key -> CancellationToken.
    /// `/stop` cancels all tokens to abort running tool loops.
    pub active_operations: DashMap<String, CancellationToken>,
    /// Outbound channel senders for cross-channel messaging.
    /// Key: channel name (e.g. "discord"), Value: sender for `ChannelOutbound` messages.
    pub channel_senders: DashMap<String, mpsc::Sender<ChannelOutbound>>,
    /// Append-only NDJSON transcripts backing `chat.history`/`chat.send`/
    /// `chat.abort`/`chat.inject`.
    pub transcripts: TranscriptStore,
    /// In-flight (and just-finished) web-chat/mesh AgentRuns, keyed by runId.
    pub runs: DashMap<String, Arc<RunHandle>>,
    /// `chat.send` idempotency dedup: `"{sessionKey}:{idempotencyKey}" -> runId`.
    pub idempotency: DashMap<String, String>,
    /// Per-session follow-up queue, draining into the same run machinery
    /// `chat.send` uses for the first message in a session.
    pub queue: Arc<QueueManager<ChatFollowupRunner, SystemClock>>,
    /// Active mesh (multi-step workflow) runs, keyed by meshRunId.
    pub mesh: DashMap<String, Arc<MeshRun>>,
    /// Auth-profile store backing `AgentRunLoop`'s provider-rotation step.
    pub auth_profiles: Arc<AuthProfileStore>,
}

impl AppState {
    /// Builds `AppState` via `Arc::new_cyclic` so the scheduler executor and
    /// the follow-up queue's run-adapter can each hold a `Weak<AppState>`
    /// back-reference — both need the fully-assembled gateway (memory,
    /// transcripts, agent runtime) to drive a turn, but are themselves
    /// owned by the `AppState` they call back into.
    ///
    /// `scheduler_conn` is a fresh, unshared SQLite connection: the
    /// scheduler opens its own handle to the same database file rather than
    /// sharing one guarded by an outer mutex, mirroring how `memory` and
    /// `sessions` each get their own connection in `main.rs`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OpenclawConfig,
        agent: AgentRuntime,
        users: UserResolver,
        memory: MemoryManager,
        sessions: SessionManager,
        scheduler_conn: rusqlite::Connection,
        terminal: TerminalManager,
        transcripts: TranscriptStore,
    ) -> openclaw_scheduler::Result<Arc<Self>> {
        let provider_name = agent.provider().name().to_string();
        let mut init_err = None;
        let state = Arc::new_cyclic(|weak| {
            let queue = QueueManager::new(
                Arc::new(ChatFollowupRunner { app: weak.clone() }),
                Arc::new(SystemClock),
                openclaw_queue::QueueConfig::default(),
            );
            let executor = Arc::new(crate::scheduler_exec::GatewaySchedulerExecutor {
                app: weak.clone(),
            });
            let scheduler = match openclaw_scheduler::Scheduler::new(scheduler_conn, executor) {
                Ok(s) => s,
                Err(e) => {
                    // `Arc::new_cyclic`'s closure can't fail, so a broken
                    // scheduler init is reported via `init_err` and the
                    // dummy in-memory handle below is never served —
                    // `new` returns the error before the caller sees it.
                    init_err = Some(e);
                    openclaw_scheduler::Scheduler::new(
                        rusqlite::Connection::open_in_memory().expect("in-memory sqlite"),
                        Arc::new(crate::scheduler_exec::GatewaySchedulerExecutor {
                            app: weak.clone(),
                        }),
                    )
                    .expect("in-memory scheduler init")
                }
            };
            Self {
                config,
                event_seq: AtomicU64::new(0),
                presence_version: AtomicU64::new(0),
                broadcaster: EventBroadcaster::new(),
                agent,
                users,
                memory,
                sessions,
                scheduler,
                terminal: tokio::sync::Mutex::new(terminal),
                ws_clients: DashMap::new(),
                notifications: DashMap::new(),
                active_operations: DashMap::new(),
                channel_senders: DashMap::new(),
                transcripts,
                runs: DashMap::new(),
                idempotency: DashMap::new(),
                queue,
                mesh: DashMap::new(),
                auth_profiles: crate::chat::run::default_auth_profiles(&provider_name),
            }
        });
        match init_err {
            Some(e) => Err(e),
            None => Ok(state),
        }
    }

    /// Monotonically increasing sequence for broadcast events.
    pub fn next_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Broadcast a `{type:"event", event, payload, seq}` frame to every
    /// connected WS client, stamping it with the next sequence number.
    pub fn broadcast_event(&self, event: &str, payload: serde_json::Value) {
        let seq = self.next_seq();
        let frame = openclaw_protocol::frames::EventFrame::new(event, payload).with_seq(seq);
        if let Ok(json) = serde_json::to_string(&frame) {
            self.broadcaster.send(json);
        }
    }
}

impl openclaw_agent::pipeline::MessageContext for AppState {
    fn agent(&self) -> &openclaw_agent::runtime::AgentRuntime {
        &self.agent
    }

    fn memory(&self) -> &openclaw_memory::manager::MemoryManager {
        &self.memory
    }

    fn terminal(&self) -> &tokio::sync::Mutex<openclaw_terminal::manager::TerminalManager> {
        &self.terminal
    }

    fn scheduler(&self) -> &openclaw_scheduler::SchedulerHandle {
        &self.scheduler
    }

    fn users(&self) -> &openclaw_users::resolver::UserResolver {
        &self.users
    }

    fn connected_channels(&self) -> Vec<String> {
        self.channel_senders
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String> {
        let sender = self
            .channel_senders
            .get(channel)
            .ok_or_else(|| format!("channel '{}' is not connected", channel))?;
        sender
            .try_send(ChannelOutbound {
                recipient: recipient.to_string(),
                message: message.to_string(),
            })
            .map_err(|e| format!("failed to send to '{}': {}", channel, e))
    }

    fn gateway_port(&self) -> Option<u16> {
        Some(self.config.gateway.port)
    }

    fn database_path(&self) -> Option<&str> {
        Some(&self.config.database.path)
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::ui::ui_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route(
            "/notifications",
            get(crate::http::notifications::notifications_handler),
        )
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai_compat::chat_completions),
        )
        .route(
            "/webhooks/{source}",
            post(crate::http::webhooks::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
