//! `openclaw-queue` — per-session follow-up queue and drain loop.
//!
//! While an agent run is in flight, further inbound messages for the same
//! session don't interrupt it; they accumulate here. Once the run ends (and
//! after a short debounce so a burst of messages settles), the queue either
//! merges everything into one `collect` prompt or replays items one at a
//! time in arrival order, depending on [`QueueConfig::mode`]. A cap with a
//! configurable [`DropPolicy`] bounds memory use under sustained overload.

pub mod manager;
pub mod state;
pub mod types;

pub use manager::{Clock, QueueManager, RunFollowup};
pub use state::{build_collect_prompt, build_overflow_note, FollowupQueueState};
pub use types::{DedupeMode, DropPolicy, FollowupItem, OriginTarget, QueueConfig, QueueMode};
