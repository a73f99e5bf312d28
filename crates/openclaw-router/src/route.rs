use serde::{Deserialize, Serialize};

use crate::key::{PeerKind, SessionKey};

/// One inbound message's routing-relevant identity. Carries no I/O handles —
/// `route()` below is a pure function of this plus a [`BindingsConfig`]
/// snapshot.
#[derive(Debug, Clone)]
pub struct RouteInput {
    pub channel: String,
    pub peer_kind: PeerKind,
    pub peer_id: String,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    #[allow(dead_code)]
    pub sender_id: Option<String>,
    /// `X-RawSessionKey` override accepted from the RPC surface. When
    /// present it takes precedence over every binding lookup.
    pub raw_session_key_override: Option<String>,
}

/// One configured `{channel, peer.kind, peer.id}` → agent binding, optionally
/// narrowed to a specific thread/topic or a channel account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub channel: String,
    pub peer_kind: PeerKind,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub agent_id: String,
}

/// A channel-account-level binding: every peer on this `{channel,
/// account_id}` routes to `agent_id` unless a more specific [`Binding`]
/// matches first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBinding {
    pub channel: String,
    pub account_id: String,
    pub agent_id: String,
}

/// Immutable routing-config snapshot — one per `route()` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingsConfig {
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub account_bindings: Vec<AccountBinding>,
    pub default_agent: String,
}

/// Which resolution rule produced the final agent id — useful for logging
/// and for RPC responses that want to explain a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// `X-RawSessionKey` override bypassed binding resolution entirely.
    Override,
    /// An explicit peer binding matched, narrowed to this thread/topic.
    ExplicitTopic,
    /// An explicit peer binding matched at the group/user level.
    ExplicitPeer,
    /// A channel-account binding matched; no peer-level binding existed.
    Account,
    /// Nothing matched; fell through to the configured default agent.
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMeta {
    pub matched: MatchKind,
}

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub session_key: SessionKey,
    pub agent_id: String,
    pub routing_meta: RoutingMeta,
}

/// Map an inbound message to a canonical [`SessionKey`] and the agent id
/// that should handle it.
///
/// Resolution order: (1) explicit peer bindings, with a topic-specific
/// binding beating a group-level one for the same peer; (2) channel
/// account-id bindings; (3) the configured default agent. `raw_session_key`
/// overrides everything when present (a user-pinned session always wins).
///
/// Pure function of `input` + `config` — no I/O, no shared state.
pub fn route(input: &RouteInput, config: &BindingsConfig) -> RouteResult {
    if let Some(raw) = &input.raw_session_key_override {
        if let Ok(key) = SessionKey::parse(raw) {
            let agent_id = key.agent_id.clone();
            return RouteResult {
                session_key: key,
                agent_id,
                routing_meta: RoutingMeta {
                    matched: MatchKind::Override,
                },
            };
        }
    }

    // Most-specific peer binding wins; among peer bindings, a topic-scoped
    // one beats a topic-less (group-wide) one for the same peer.
    let topic_match = config.bindings.iter().find(|b| {
        b.channel == input.channel
            && b.peer_kind == input.peer_kind
            && b.peer_id == input.peer_id
            && b.thread_id.is_some()
            && b.thread_id == input.thread_id
    });
    let peer_match = topic_match.or_else(|| {
        config.bindings.iter().find(|b| {
            b.channel == input.channel
                && b.peer_kind == input.peer_kind
                && b.peer_id == input.peer_id
                && b.thread_id.is_none()
        })
    });

    if let Some(binding) = peer_match {
        let kind = if binding.thread_id.is_some() {
            MatchKind::ExplicitTopic
        } else {
            MatchKind::ExplicitPeer
        };
        return RouteResult {
            session_key: SessionKey::new(
                binding.agent_id.clone(),
                input.channel.clone(),
                input.peer_kind,
                input.peer_id.clone(),
                input.thread_id.clone(),
                input.account_id.clone(),
            ),
            agent_id: binding.agent_id.clone(),
            routing_meta: RoutingMeta { matched: kind },
        };
    }

    if let Some(account_id) = &input.account_id {
        if let Some(binding) = config
            .account_bindings
            .iter()
            .find(|b| b.channel == input.channel && &b.account_id == account_id)
        {
            return RouteResult {
                session_key: SessionKey::new(
                    binding.agent_id.clone(),
                    input.channel.clone(),
                    input.peer_kind,
                    input.peer_id.clone(),
                    input.thread_id.clone(),
                    input.account_id.clone(),
                ),
                agent_id: binding.agent_id.clone(),
                routing_meta: RoutingMeta { matched: MatchKind::Account },
            };
        }
    }

    RouteResult {
        session_key: SessionKey::new(
            config.default_agent.clone(),
            input.channel.clone(),
            input.peer_kind,
            input.peer_id.clone(),
            input.thread_id.clone(),
            input.account_id.clone(),
        ),
        agent_id: config.default_agent.clone(),
        routing_meta: RoutingMeta { matched: MatchKind::Default },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(channel: &str, peer_id: &str, thread: Option<&str>) -> RouteInput {
        RouteInput {
            channel: channel.to_string(),
            peer_kind: PeerKind::Group,
            peer_id: peer_id.to_string(),
            account_id: None,
            thread_id: thread.map(|s| s.to_string()),
            sender_id: None,
            raw_session_key_override: None,
        }
    }

    #[test]
    fn falls_back_to_default_agent_with_no_bindings() {
        let cfg = BindingsConfig {
            default_agent: "main".to_string(),
            ..Default::default()
        };
        let r = route(&input("slack", "C1", None), &cfg);
        assert_eq!(r.agent_id, "main");
        assert_eq!(r.routing_meta.matched, MatchKind::Default);
    }

    #[test]
    fn topic_binding_beats_group_binding() {
        let cfg = BindingsConfig {
            bindings: vec![
                Binding {
                    channel: "telegram".to_string(),
                    peer_kind: PeerKind::Group,
                    peer_id: "-100".to_string(),
                    thread_id: None,
                    account_id: None,
                    agent_id: "group-agent".to_string(),
                },
                Binding {
                    channel: "telegram".to_string(),
                    peer_kind: PeerKind::Group,
                    peer_id: "-100".to_string(),
                    thread_id: Some("7".to_string()),
                    account_id: None,
                    agent_id: "topic-agent".to_string(),
                },
            ],
            default_agent: "main".to_string(),
            ..Default::default()
        };
        let r = route(&input("telegram", "-100", Some("7")), &cfg);
        assert_eq!(r.agent_id, "topic-agent");
        assert_eq!(r.routing_meta.matched, MatchKind::ExplicitTopic);

        let r2 = route(&input("telegram", "-100", Some("9")), &cfg);
        assert_eq!(r2.agent_id, "group-agent");
        assert_eq!(r2.routing_meta.matched, MatchKind::ExplicitPeer);
    }

    #[test]
    fn account_binding_used_when_no_peer_binding_matches() {
        let cfg = BindingsConfig {
            account_bindings: vec![AccountBinding {
                channel: "discord".to_string(),
                account_id: "acct-1".to_string(),
                agent_id: "acct-agent".to_string(),
            }],
            default_agent: "main".to_string(),
            ..Default::default()
        };
        let mut i = input("discord", "U1", None);
        i.peer_kind = PeerKind::User;
        i.account_id = Some("acct-1".to_string());
        let r = route(&i, &cfg);
        assert_eq!(r.agent_id, "acct-agent");
        assert_eq!(r.routing_meta.matched, MatchKind::Account);
    }

    #[test]
    fn raw_session_key_override_bypasses_bindings() {
        let cfg = BindingsConfig {
            default_agent: "main".to_string(),
            ..Default::default()
        };
        let key = SessionKey::new("pinned", "web", PeerKind::User, "u1", None, None);
        let mut i = input("telegram", "-100", None);
        i.raw_session_key_override = Some(key.format());
        let r = route(&i, &cfg);
        assert_eq!(r.agent_id, "pinned");
        assert_eq!(r.routing_meta.matched, MatchKind::Override);
    }

    #[test]
    fn same_inputs_produce_same_session_key_pure_function() {
        let cfg = BindingsConfig {
            default_agent: "main".to_string(),
            ..Default::default()
        };
        let i = input("slack", "C1", None);
        let a = route(&i, &cfg);
        let b = route(&i, &cfg);
        assert_eq!(a.session_key, b.session_key);
    }
}
