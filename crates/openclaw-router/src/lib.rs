//! `openclaw-router` — maps an inbound message to a canonical [`SessionKey`]
//! and resolves which agent owns it.
//!
//! `route()` is a pure function: same `(RouteInput, BindingsConfig)` always
//! yields the same [`RouteResult`], with no I/O and no shared state. Callers
//! own fetching the current config snapshot and caching its own session
//! bookkeeping (follow-up queues, transcripts) keyed by the returned
//! [`SessionKey`].

pub mod error;
pub mod key;
pub mod route;

pub use error::{Result, RouterError};
pub use key::{PeerKind, SessionKey};
pub use route::{route, AccountBinding, Binding, BindingsConfig, MatchKind, RouteInput, RouteResult, RoutingMeta};
