//! Shared context interface for all channel adapters.
//!
//! `MessageContext` is the single trait that every channel host (gateway, discord,
//! future telegram, etc.) must implement. It replaces the old `DiscordAppContext`
//! and lets the pipeline crate stay channel-agnostic.

use openclaw_memory::manager::MemoryManager;
use openclaw_scheduler::SchedulerHandle;
use openclaw_terminal::manager::TerminalManager;
use openclaw_users::resolver::UserResolver;

use crate::runtime::AgentRuntime;

/// Minimal context interface required by the shared message pipeline.
///
/// Implemented by `AppState` in `openclaw-gateway` and any future channel host.
/// Defined here (in `openclaw-agent`) to avoid circular dependency: all channel
/// crates depend on `openclaw-agent`; `openclaw-agent` depends only on `openclaw-core`,
/// `openclaw-memory`, `openclaw-scheduler`, `openclaw-terminal`, and `openclaw-users`.
pub trait MessageContext: Send + Sync {
    fn agent(&self) -> &AgentRuntime;
    fn memory(&self) -> &MemoryManager;
    fn terminal(&self) -> &tokio::sync::Mutex<TerminalManager>;
    fn scheduler(&self) -> &SchedulerHandle;
    fn users(&self) -> &UserResolver;
    /// Names of channels currently wired up with a live outbound sender.
    fn connected_channels(&self) -> Vec<String>;
    /// Route a message out through a connected channel adapter (used by the
    /// `send_message` tool for cross-channel proactive delivery).
    fn send_to_channel(&self, channel: &str, recipient: &str, message: &str) -> Result<(), String>;
    /// Gateway's own HTTP/WS port, when known (used by slash-command help text).
    fn gateway_port(&self) -> Option<u16> {
        None
    }
    /// Path to the primary SQLite database file, when known.
    fn database_path(&self) -> Option<&str> {
        None
    }
}
