//! Tool re-export for the Telegram adapter.
//!
//! All tools are shared — implemented once in `openclaw-agent` and re-exported here
//! following the same thin-wrapper pattern as `openclaw-discord/src/tools.rs`.

pub use openclaw_agent::tools::build::build_tools;
