use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

/// Whether a peer is a single user DM or a multi-user group/channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    User,
    Group,
}

impl PeerKind {
    fn as_str(self) -> &'static str {
        match self {
            PeerKind::User => "user",
            PeerKind::Group => "group",
        }
    }
}

/// Telegram-style forum "General" topic carries id `1`, which is really "no
/// topic" in disguise — routing must not fork a session over it.
const IMPLICIT_GENERAL_TOPIC: &str = "1";

/// Canonical, opaque identifier of an agent × channel × peer × thread ×
/// account tuple. Two inputs that describe the same conversation always
/// format to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: String,
    pub channel: String,
    pub peer_kind: PeerKind,
    pub peer_id: String,
    pub thread_id: Option<String>,
    pub account_id: Option<String>,
}

impl SessionKey {
    pub fn new(
        agent_id: impl Into<String>,
        channel: impl Into<String>,
        peer_kind: PeerKind,
        peer_id: impl Into<String>,
        thread_id: Option<String>,
        account_id: Option<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel: channel.into(),
            peer_kind,
            peer_id: peer_id.into(),
            thread_id: normalize_thread(thread_id),
            account_id,
        }
    }

    /// `agent:<id>:<channel>:<kind>:<peer>[:topic:<id>][:account:<id>]`
    pub fn format(&self) -> String {
        let mut s = format!(
            "agent:{}:{}:{}:{}",
            self.agent_id,
            self.channel,
            self.peer_kind.as_str(),
            self.peer_id
        );
        if let Some(thread) = &self.thread_id {
            s.push_str(&format!(":topic:{thread}"));
        }
        if let Some(account) = &self.account_id {
            s.push_str(&format!(":account:{account}"));
        }
        s
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("agent:")
            .ok_or_else(|| RouterError::InvalidKey(format!("missing 'agent:' prefix: {s}")))?;
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() < 4 {
            return Err(RouterError::InvalidKey(format!("too few segments: {s}")));
        }
        let agent_id = parts[0].to_string();
        let channel = parts[1].to_string();
        let peer_kind = match parts[2] {
            "user" => PeerKind::User,
            "group" => PeerKind::Group,
            other => {
                return Err(RouterError::InvalidKey(format!(
                    "unknown peer kind '{other}': {s}"
                )))
            }
        };
        let peer_id = parts[3].to_string();

        let mut thread_id = None;
        let mut account_id = None;
        let mut i = 4;
        while i < parts.len() {
            match parts.get(i) {
                Some(&"topic") => {
                    thread_id = parts.get(i + 1).map(|s| s.to_string());
                    i += 2;
                }
                Some(&"account") => {
                    account_id = parts.get(i + 1).map(|s| s.to_string());
                    i += 2;
                }
                _ => break,
            }
        }

        if agent_id.is_empty() || channel.is_empty() || peer_id.is_empty() {
            return Err(RouterError::InvalidKey(format!(
                "key components must not be empty: {s}"
            )));
        }

        Ok(Self::new(agent_id, channel, peer_kind, peer_id, thread_id, account_id))
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// The implicit-General-topic rule: `Some("1")` collapses to `None` so a
/// group message posted to (or without) the General topic always lands on
/// the same session as a plain group message.
fn normalize_thread(thread_id: Option<String>) -> Option<String> {
    match thread_id {
        Some(t) if t == IMPLICIT_GENERAL_TOPIC => None,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple_key() {
        let key = SessionKey::new("main", "telegram", PeerKind::Group, "-100123", None, None);
        let s = key.format();
        let parsed = SessionKey::parse(&s).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn roundtrip_with_topic_and_account() {
        let key = SessionKey::new(
            "main",
            "telegram",
            PeerKind::Group,
            "-100123",
            Some("42".to_string()),
            Some("acct-1".to_string()),
        );
        let parsed = SessionKey::parse(&key.format()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn general_topic_normalizes_to_no_topic() {
        let with_general = SessionKey::new(
            "main",
            "telegram",
            PeerKind::Group,
            "-100123",
            Some("1".to_string()),
            None,
        );
        let without = SessionKey::new("main", "telegram", PeerKind::Group, "-100123", None, None);
        assert_eq!(with_general, without);
        assert_eq!(with_general.format(), without.format());
    }

    #[test]
    fn distinct_topics_are_distinct_sessions() {
        let a = SessionKey::new(
            "main",
            "telegram",
            PeerKind::Group,
            "-100123",
            Some("2".to_string()),
            None,
        );
        let b = SessionKey::new(
            "main",
            "telegram",
            PeerKind::Group,
            "-100123",
            Some("3".to_string()),
            None,
        );
        assert_ne!(a, b);
    }
}
