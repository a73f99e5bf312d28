//! Telegram context interface — re-exported from the shared pipeline.
//!
//! `TelegramAppContext` is an alias for `openclaw_agent::pipeline::MessageContext`.
//! All channel adapters share the same trait, defined once in `openclaw-agent`.

pub use openclaw_agent::pipeline::MessageContext as TelegramAppContext;
