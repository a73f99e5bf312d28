use serde::{Deserialize, Serialize};

/// The originating channel/peer/thread/account an item arrived on. Two
/// items "share a target" (and so can be merged into one collect prompt)
/// when their composite keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginTarget {
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl OriginTarget {
    pub fn composite_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.channel,
            self.to,
            self.account.as_deref().unwrap_or(""),
            self.thread.as_deref().unwrap_or("")
        )
    }
}

/// One message that arrived while a run was already in flight for this
/// session.
#[derive(Debug, Clone)]
pub struct FollowupItem {
    pub prompt: String,
    pub message_id: Option<String>,
    /// `None` means the item's origin can't be routed individually — it
    /// forces the drain into per-item mode even under `collect`.
    pub origin: Option<OriginTarget>,
    pub enqueued_at_ms: i64,
}

impl FollowupItem {
    /// Short preview used in overflow-summary / drop-preview text.
    pub fn preview(&self) -> String {
        const MAX: usize = 80;
        if self.prompt.chars().count() <= MAX {
            self.prompt.clone()
        } else {
            let truncated: String = self.prompt.chars().take(MAX).collect();
            format!("{truncated}…")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Collect,
    Followup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Summarize,
    DropNewest,
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeMode {
    /// Only drop an incoming item when its `message_id` matches a queued one.
    MessageId,
    /// Additionally dedupe on `(channel, to, prompt)` when `message_id` is
    /// absent from the incoming item.
    Prompt,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub debounce_ms: i64,
    pub cap: usize,
    pub drop_policy: DropPolicy,
    pub dedupe_mode: DedupeMode,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Followup,
            debounce_ms: 1_500,
            cap: 20,
            drop_policy: DropPolicy::Summarize,
            dedupe_mode: DedupeMode::MessageId,
        }
    }
}
