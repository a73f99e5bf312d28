//! Discord context interface — re-exported from the shared pipeline.
//!
//! `DiscordAppContext` is now an alias for `openclaw_agent::pipeline::MessageContext`.
//! All channel adapters share the same trait, defined once in `openclaw-agent` to
//! avoid circular dependencies.

pub use openclaw_agent::pipeline::MessageContext as DiscordAppContext;
