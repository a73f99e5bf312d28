use std::collections::VecDeque;

use serde_json::Value;

use crate::types::{DedupeMode, DropPolicy, FollowupItem, OriginTarget, QueueConfig};

/// Per-session-key queue contents. Guarded by a mutex in [`crate::manager`];
/// every method here is a synchronous, lock-held operation — the spec's
/// "mutex held only for microseconds at enqueue/pop boundaries" invariant.
pub struct FollowupQueueState {
    pub items: VecDeque<FollowupItem>,
    pub config: QueueConfig,
    pub draining: bool,
    pub last_enqueued_at_ms: i64,
    pub dropped_count: u64,
    pub drop_previews: Vec<String>,
    /// Carried-forward context from the previous run, fed to the next
    /// `collect` prompt / single-item run so the model keeps continuity.
    pub last_run: Value,
}

impl FollowupQueueState {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: VecDeque::new(),
            config,
            draining: false,
            last_enqueued_at_ms: 0,
            dropped_count: 0,
            drop_previews: Vec::new(),
            last_run: Value::Null,
        }
    }

    pub fn is_empty_and_settled(&self) -> bool {
        self.items.is_empty() && self.dropped_count == 0
    }

    /// Enqueue `item`, applying dedupe then cap/drop policy. Returns `true`
    /// if the item (or a replacement slot for it) ended up queued, `false`
    /// if it was dropped outright (dedupe hit, or `drop_newest` at cap).
    ///
    /// Invariant: `items.len() <= cap` holds after this call returns.
    pub fn enqueue(&mut self, item: FollowupItem, now_ms: i64) -> bool {
        self.last_enqueued_at_ms = now_ms;

        if self.is_duplicate(&item) {
            return false;
        }

        if self.items.len() < self.config.cap {
            self.items.push_back(item);
            return true;
        }

        match self.config.drop_policy {
            DropPolicy::DropNewest => false,
            DropPolicy::DropOldest => {
                self.items.pop_front();
                self.items.push_back(item);
                true
            }
            DropPolicy::Summarize => {
                if let Some(oldest) = self.items.pop_front() {
                    self.drop_previews.push(oldest.preview());
                    self.dropped_count += 1;
                }
                self.items.push_back(item);
                true
            }
        }
    }

    fn is_duplicate(&self, item: &FollowupItem) -> bool {
        if let Some(id) = &item.message_id {
            return self.items.iter().any(|q| q.message_id.as_deref() == Some(id.as_str()));
        }
        if self.config.dedupe_mode == DedupeMode::Prompt {
            let incoming_target = item.origin.as_ref().map(OriginTarget::composite_key);
            return self.items.iter().any(|q| {
                q.message_id.is_none()
                    && q.prompt == item.prompt
                    && q.origin.as_ref().map(OriginTarget::composite_key) == incoming_target
            });
        }
        false
    }

    /// `true` when every queued item shares one origin target and all are
    /// routable — the only condition under which `collect` mode may merge.
    pub fn all_same_routable_target(&self) -> bool {
        let mut targets = self.items.iter().map(|i| i.origin.as_ref());
        let Some(first) = targets.next() else {
            return true;
        };
        let Some(first_key) = first else {
            return false; // an unroutable item forces forced-individual mode
        };
        let first_key = first_key.composite_key();
        targets.all(|o| o.map(|t| t.composite_key()) == Some(first_key.clone()))
    }

    pub fn has_overflow(&self) -> bool {
        self.dropped_count > 0
    }

    pub fn clear_overflow(&mut self) {
        self.dropped_count = 0;
        self.drop_previews.clear();
    }
}

/// `[Queued messages while agent was busy]` prompt merging every item in
/// `snapshot`, in enqueue order, plus a trailing note about any drops.
pub fn build_collect_prompt(snapshot: &[FollowupItem], dropped_count: u64, drop_previews: &[String]) -> String {
    let mut out = String::from("[Queued messages while agent was busy]\n");
    for (i, item) in snapshot.iter().enumerate() {
        out.push_str(&format!("---\nQueued #{}\n{}\n", i + 1, item.prompt));
    }
    if dropped_count > 0 {
        out.push_str(&build_overflow_note(dropped_count, drop_previews));
    }
    out
}

/// `[Queue overflow] Dropped N message(s) due to cap.` plus short previews,
/// used both as the trailing note on a collect prompt and as the standalone
/// `followup`-mode overflow prompt.
pub fn build_overflow_note(dropped_count: u64, drop_previews: &[String]) -> String {
    let mut out = format!("[Queue overflow] Dropped {dropped_count} message(s) due to cap.");
    for preview in drop_previews {
        out.push_str(&format!("\n- {preview}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueMode;

    fn item(prompt: &str, msg_id: Option<&str>) -> FollowupItem {
        FollowupItem {
            prompt: prompt.to_string(),
            message_id: msg_id.map(|s| s.to_string()),
            origin: Some(OriginTarget {
                channel: "slack".to_string(),
                to: "C1".to_string(),
                account: None,
                thread: None,
            }),
            enqueued_at_ms: 0,
        }
    }

    #[test]
    fn cap_is_never_exceeded() {
        let mut cfg = QueueConfig::default();
        cfg.cap = 3;
        let mut state = FollowupQueueState::new(cfg);
        for i in 0..10 {
            state.enqueue(item(&format!("m{i}"), None), i as i64);
            assert!(state.items.len() <= 3);
        }
    }

    #[test]
    fn message_id_dedupe_drops_incoming() {
        let mut state = FollowupQueueState::new(QueueConfig::default());
        assert!(state.enqueue(item("hi", Some("a")), 0));
        assert!(!state.enqueue(item("hi again", Some("a")), 1));
        assert_eq!(state.items.len(), 1);
    }

    #[test]
    fn prompt_dedupe_requires_mode_and_absent_message_id() {
        let mut cfg = QueueConfig::default();
        cfg.dedupe_mode = DedupeMode::Prompt;
        let mut state = FollowupQueueState::new(cfg);
        assert!(state.enqueue(item("same text", None), 0));
        assert!(!state.enqueue(item("same text", None), 1));
        assert_eq!(state.items.len(), 1);
    }

    #[test]
    fn summarize_drop_policy_records_preview_and_keeps_cap() {
        let mut cfg = QueueConfig::default();
        cfg.cap = 2;
        cfg.drop_policy = DropPolicy::Summarize;
        let mut state = FollowupQueueState::new(cfg);
        state.enqueue(item("one", None), 0);
        state.enqueue(item("two", None), 1);
        state.enqueue(item("three", None), 2);
        assert_eq!(state.items.len(), 2);
        assert_eq!(state.dropped_count, 1);
        assert_eq!(state.drop_previews, vec!["one".to_string()]);
    }

    #[test]
    fn collect_prompt_numbers_items_in_order() {
        let snapshot = vec![item("first", None), item("second", None)];
        let prompt = build_collect_prompt(&snapshot, 0, &[]);
        assert!(prompt.starts_with("[Queued messages while agent was busy]\n"));
        assert!(prompt.contains("Queued #1\nfirst"));
        assert!(prompt.contains("Queued #2\nsecond"));
    }

    #[test]
    fn distinct_targets_break_same_target_check() {
        let mut state = FollowupQueueState::new(QueueConfig {
            mode: QueueMode::Collect,
            ..QueueConfig::default()
        });
        state.enqueue(item("a", None), 0);
        assert!(state.all_same_routable_target());

        let mut other = item("b", None);
        other.origin = Some(OriginTarget {
            channel: "slack".to_string(),
            to: "C2".to_string(),
            account: None,
            thread: None,
        });
        state.enqueue(other, 1);
        assert!(!state.all_same_routable_target());
    }
}
