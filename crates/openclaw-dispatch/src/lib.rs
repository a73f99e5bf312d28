//! Reply Dispatcher — ordered, policy-filtered delivery of one run's
//! outbound payloads to whatever channel originated the turn (§4.4).
//!
//! The dispatcher itself never knows how to send anything; it wraps a
//! caller-supplied [`Deliver`] and enforces three things the originating
//! channel adapter should not have to reimplement: strict FIFO ordering
//! across `tool`/`block`/`final` sends, silent/heartbeat token filtering
//! and response-prefix dedup, and human-delay pacing between block
//! replies.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// In-band marker meaning "produce no visible reply". A lone occurrence,
/// or `<SILENT_REPLY> -- trailing commentary`, is dropped entirely unless
/// media is attached, in which case the marker is stripped and the media
/// still delivers.
pub const SILENT_REPLY_TOKEN: &str = "<SILENT_REPLY>";
/// In-band marker meaning "this is a keepalive, not real content". Stripped
/// before delivery; a lone heartbeat with no media is dropped.
pub const HEARTBEAT_TOKEN: &str = "<HEARTBEAT>";

/// Which of the three delivery channels a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// Output produced while a tool call is in flight (e.g. a progress note).
    Tool,
    /// One chunk of the assistant's streamed/blocked reply.
    Block,
    /// The run's terminal reply.
    Final,
}

/// A caller-constructed payload before dispatcher policy has been applied.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub blocks: Option<Vec<String>>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), media_url: None, blocks: None }
    }

    pub fn media(url: impl Into<String>) -> Self {
        Self { text: None, media_url: Some(url.into()), blocks: None }
    }
}

/// The payload actually handed to [`Deliver`] after policy has run.
#[derive(Debug, Clone)]
pub struct DeliveredPayload {
    pub kind: SendKind,
    pub text: String,
    pub media_url: Option<String>,
    pub blocks: Option<Vec<String>>,
}

/// Sends one already-filtered payload to the originating channel.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, payload: DeliveredPayload) -> Result<(), String>;
}

/// Notified when a delivery attempt fails.
#[async_trait]
pub trait OnError: Send + Sync {
    async fn on_error(&self, kind: SendKind, error: &str);
}

/// Notified once the dispatcher has drained and completion was signaled.
pub trait OnIdle: Send + Sync {
    fn on_idle(&self);
}

/// Notified whenever a heartbeat token is stripped from outgoing text,
/// receiving the original (pre-strip) text.
pub trait OnHeartbeatStrip: Send + Sync {
    fn on_heartbeat_strip(&self, original: &str);
}

/// Notified when the run loop has picked a model (surfaced to the UI layer
/// the dispatcher delivers into, independent of actual message content).
pub trait OnModelSelected: Send + Sync {
    fn on_model_selected(&self, model: &str);
}

/// Human-delay pacing applied to block replies after the first in a run.
#[derive(Debug, Clone, Copy)]
pub enum HumanDelay {
    /// Uniform random delay in `[min_ms, max_ms]`. If `max_ms <= min_ms`
    /// the delay is always `min_ms`.
    Uniform { min_ms: u64, max_ms: u64 },
    /// A loosely human-like distribution: never faster than `min_ms`, with
    /// some spread above it.
    Natural { min_ms: u64 },
}

impl Default for HumanDelay {
    fn default() -> Self {
        HumanDelay::Natural { min_ms: 800 }
    }
}

/// Construction-time configuration for a [`ReplyDispatcher`].
#[derive(Default)]
pub struct DispatchConfig {
    pub response_prefix: Option<String>,
    pub human_delay: Option<HumanDelay>,
    pub on_error: Option<Arc<dyn OnError>>,
    pub on_idle: Option<Arc<dyn OnIdle>>,
    pub on_heartbeat_strip: Option<Arc<dyn OnHeartbeatStrip>>,
    pub on_model_selected: Option<Arc<dyn OnModelSelected>>,
}

struct DispatcherState {
    first_block_sent: bool,
    completed: bool,
}

/// Serializes and filters one run's outbound payloads before handing them
/// to a [`Deliver`]. One instance per run.
///
/// Delivery order is strict FIFO across all three send kinds: callers await
/// each `send_*` call, and an internal `tokio::sync::Mutex` (which queues
/// waiters fairly) ensures a slow `tool` delivery is never overtaken by a
/// `block`/`final` call issued concurrently from another task.
pub struct ReplyDispatcher<D: Deliver> {
    deliver: Arc<D>,
    config: DispatchConfig,
    state: Mutex<DispatcherState>,
}

impl<D: Deliver> ReplyDispatcher<D> {
    pub fn new(deliver: Arc<D>, config: DispatchConfig) -> Self {
        Self {
            deliver,
            config,
            state: Mutex::new(DispatcherState { first_block_sent: false, completed: false }),
        }
    }

    /// Surface the chosen model to the configured `onModelSelected` hook.
    pub fn model_selected(&self, model: &str) {
        if let Some(hook) = &self.config.on_model_selected {
            hook.on_model_selected(model);
        }
    }

    /// Send a tool-channel payload. Never delayed.
    #[instrument(skip(self, payload))]
    pub async fn send_tool(&self, payload: Payload) -> bool {
        self.send(SendKind::Tool, payload).await
    }

    /// Send one block of the assistant's reply. Delayed per `human_delay`
    /// config, except the first block of the run, which is immediate.
    ///
    /// Holds the state lock across the delay and the delivery itself, same
    /// as [`ReplyDispatcher::send`] — otherwise a concurrent `send_tool`/
    /// `send_final` could slip in and deliver mid-delay, breaking the FIFO
    /// ordering this type promises.
    #[instrument(skip(self, payload))]
    pub async fn send_block(&self, payload: Payload) -> bool {
        let Some(delivered) = self.apply_policy(payload) else {
            return false;
        };

        let mut guard = self.state.lock().await;
        if guard.first_block_sent {
            if let Some(delay) = self.config.human_delay {
                let delay_ms = delay_ms_for(delay);
                if delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
        guard.first_block_sent = true;

        let result = self.deliver_checked(DeliveredPayload { kind: SendKind::Block, ..delivered }).await;
        drop(guard);
        result
    }

    /// Send the run's terminal reply. Valid any time up to and including
    /// the call to [`ReplyDispatcher::mark_complete`].
    #[instrument(skip(self, payload))]
    pub async fn send_final(&self, payload: Payload) -> bool {
        self.send(SendKind::Final, payload).await
    }

    /// Mark the run complete. Since every `send_*` call already awaits its
    /// own delivery, there is no queue left to drain by the time this
    /// returns — `on_idle` fires immediately.
    pub async fn mark_complete(&self) {
        let mut guard = self.state.lock().await;
        guard.completed = true;
        drop(guard);
        if let Some(hook) = &self.config.on_idle {
            hook.on_idle();
        }
    }

    async fn send(&self, kind: SendKind, payload: Payload) -> bool {
        let Some(delivered) = self.apply_policy(payload) else {
            return false;
        };
        let _guard = self.state.lock().await;
        self.deliver_checked(DeliveredPayload { kind, ..delivered }).await
    }

    async fn deliver_checked(&self, payload: DeliveredPayload) -> bool {
        let kind = payload.kind;
        match self.deliver.deliver(payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(?kind, error = %e, "dispatch: delivery failed");
                if let Some(hook) = &self.config.on_error {
                    hook.on_error(kind, &e).await;
                }
                false
            }
        }
    }

    /// Apply the §4.4 filtering contract. Returns `None` when the payload
    /// should be dropped entirely.
    fn apply_policy(&self, payload: Payload) -> Option<DeliveredPayload> {
        let has_media = payload.media_url.is_some()
            || payload.blocks.as_ref().map(|b| !b.is_empty()).unwrap_or(false);
        let mut text = payload.text.unwrap_or_default();
        let trimmed = text.trim();

        if trimmed.is_empty() && !has_media {
            return None;
        }

        if trimmed == SILENT_REPLY_TOKEN || trimmed.starts_with(&format!("{SILENT_REPLY_TOKEN} --")) {
            if !has_media {
                return None;
            }
            text = String::new();
        } else if trimmed.contains(HEARTBEAT_TOKEN) {
            let original = trimmed.to_string();
            let stripped = trimmed.replace(HEARTBEAT_TOKEN, "").trim().to_string();
            if let Some(hook) = &self.config.on_heartbeat_strip {
                hook.on_heartbeat_strip(&original);
            }
            if stripped.is_empty() && !has_media {
                return None;
            }
            text = stripped;
        } else {
            text = trimmed.to_string();
        }

        if let Some(prefix) = &self.config.response_prefix {
            if !text.is_empty() && !text.starts_with(prefix.as_str()) {
                text = format!("{prefix}{text}");
            }
        }

        debug!(chars = text.len(), has_media, "dispatch: payload passed policy");
        // `kind` is filled in by the caller (`send`/`send_block`); `Tool` is
        // an arbitrary placeholder overwritten before use.
        Some(DeliveredPayload { kind: SendKind::Tool, text, media_url: payload.media_url, blocks: payload.blocks })
    }
}

fn delay_ms_for(delay: HumanDelay) -> u64 {
    match delay {
        HumanDelay::Uniform { min_ms, max_ms } => {
            if max_ms <= min_ms {
                min_ms
            } else {
                min_ms + jitter_nanos() % (max_ms - min_ms)
            }
        }
        HumanDelay::Natural { min_ms } => {
            let spread = min_ms.max(1);
            min_ms + jitter_nanos() % spread
        }
    }
}

/// Sub-second jitter derived from the clock, matching the dependency-light
/// style `openclaw-channels`' reconnect backoff uses instead of pulling in
/// `rand` for a single random offset.
fn jitter_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingDeliver {
        log: StdMutex<Vec<DeliveredPayload>>,
    }

    impl RecordingDeliver {
        fn new() -> Self {
            Self { log: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Deliver for RecordingDeliver {
        async fn deliver(&self, payload: DeliveredPayload) -> Result<(), String> {
            self.log.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_text_without_media_is_dropped() {
        let deliver = Arc::new(RecordingDeliver::new());
        let dispatcher = ReplyDispatcher::new(deliver.clone(), DispatchConfig::default());
        let sent = dispatcher.send_final(Payload::text("   ")).await;
        assert!(!sent);
        assert!(deliver.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_token_alone_is_dropped_but_with_media_delivers_empty_text() {
        let deliver = Arc::new(RecordingDeliver::new());
        let dispatcher = ReplyDispatcher::new(deliver.clone(), DispatchConfig::default());

        assert!(!dispatcher.send_final(Payload::text(SILENT_REPLY_TOKEN)).await);
        assert!(deliver.log.lock().unwrap().is_empty());

        let with_media = Payload { text: Some(format!("{SILENT_REPLY_TOKEN} -- thinking")), media_url: Some("http://x/y.png".into()), blocks: None };
        assert!(dispatcher.send_final(with_media).await);
        let log = deliver.log.lock().unwrap();
        assert_eq!(log[0].text, "");
        assert_eq!(log[0].media_url.as_deref(), Some("http://x/y.png"));
    }

    #[tokio::test]
    async fn heartbeat_token_is_stripped_and_lone_heartbeat_dropped() {
        let deliver = Arc::new(RecordingDeliver::new());
        let dispatcher = ReplyDispatcher::new(deliver.clone(), DispatchConfig::default());

        assert!(!dispatcher.send_block(Payload::text(HEARTBEAT_TOKEN)).await);

        let mixed = Payload::text(format!("still here {HEARTBEAT_TOKEN}"));
        assert!(dispatcher.send_block(mixed).await);
        let log = deliver.log.lock().unwrap();
        assert_eq!(log[0].text, "still here");
    }

    #[tokio::test]
    async fn response_prefix_is_not_doubled() {
        let deliver = Arc::new(RecordingDeliver::new());
        let config = DispatchConfig { response_prefix: Some("[bot] ".to_string()), ..Default::default() };
        let dispatcher = ReplyDispatcher::new(deliver.clone(), config);

        dispatcher.send_final(Payload::text("hello")).await;
        dispatcher.send_final(Payload::text("[bot] already prefixed")).await;

        let log = deliver.log.lock().unwrap();
        assert_eq!(log[0].text, "[bot] hello");
        assert_eq!(log[1].text, "[bot] already prefixed");
    }

    #[tokio::test]
    async fn fifo_order_preserved_across_kinds() {
        let deliver = Arc::new(RecordingDeliver::new());
        let dispatcher = Arc::new(ReplyDispatcher::new(deliver.clone(), DispatchConfig::default()));

        dispatcher.send_tool(Payload::text("tool-1")).await;
        dispatcher.send_block(Payload::text("block-1")).await;
        dispatcher.send_final(Payload::text("final-1")).await;
        dispatcher.mark_complete().await;

        let log = deliver.log.lock().unwrap();
        let texts: Vec<&str> = log.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["tool-1", "block-1", "final-1"]);
        assert_eq!(log[0].kind, SendKind::Tool);
        assert_eq!(log[1].kind, SendKind::Block);
        assert_eq!(log[2].kind, SendKind::Final);
    }

    #[tokio::test(start_paused = true)]
    async fn first_block_is_immediate_subsequent_blocks_are_delayed() {
        let deliver = Arc::new(RecordingDeliver::new());
        let config = DispatchConfig { human_delay: Some(HumanDelay::Uniform { min_ms: 50, max_ms: 50 }), ..Default::default() };
        let dispatcher = Arc::new(ReplyDispatcher::new(deliver.clone(), config));

        dispatcher.send_block(Payload::text("first")).await;
        assert_eq!(deliver.log.lock().unwrap().len(), 1);

        let d2 = dispatcher.clone();
        let handle = tokio::spawn(async move { d2.send_block(Payload::text("second")).await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(deliver.log.lock().unwrap().len(), 1, "second block must not deliver before its delay elapses");

        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        assert!(handle.await.unwrap());
        assert_eq!(deliver.log.lock().unwrap().len(), 2);
    }
}
