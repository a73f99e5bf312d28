use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{instrument, warn};

use crate::state::{build_collect_prompt, build_overflow_note, FollowupQueueState};
use crate::types::{FollowupItem, QueueConfig, QueueMode};

/// Runs one follow-up item (or a merged collect prompt) against an agent.
/// Implemented by the gateway over its real run-loop; a session's
/// `last_run` context threads success output back into the next call.
#[async_trait]
pub trait RunFollowup: Send + Sync {
    async fn run(
        &self,
        session_key: &str,
        prompt: &str,
        origin: Option<&crate::types::OriginTarget>,
        last_run: &Value,
    ) -> Result<Value, String>;
}

/// Wall-clock source, injected so drain timing is test-controllable without
/// relying on real elapsed time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

struct QueueEntry {
    state: Mutex<FollowupQueueState>,
    notify: Notify,
}

/// Owns every session's follow-up queue and the background drain task that
/// debounces, merges (or individually replays), and runs queued items once
/// the session's in-flight run ends.
///
/// Entries are never removed once created — a session's queue is cheap
/// (a `VecDeque` and a mutex) and the alternative, reclaiming the `DashMap`
/// slot exactly when the drain loop goes idle, races the next enqueue
/// unless guarded by the same lock the drain loop's exit check uses. A
/// single mutex-guarded `draining` flag inside [`FollowupQueueState`]
/// serializes "should I spawn a drain loop" against "should this drain
/// loop stop" instead.
pub struct QueueManager<R: RunFollowup + 'static, C: Clock + 'static> {
    entries: DashMap<String, Arc<QueueEntry>>,
    runner: Arc<R>,
    clock: Arc<C>,
    default_config: QueueConfig,
}

impl<R: RunFollowup + 'static, C: Clock + 'static> QueueManager<R, C> {
    pub fn new(runner: Arc<R>, clock: Arc<C>, default_config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            runner,
            clock,
            default_config,
        })
    }

    /// Enqueue `item` for `session_key`, spawning a drain task if one isn't
    /// already running for this session.
    #[instrument(skip(self, item), fields(session_key))]
    pub fn enqueue(self: &Arc<Self>, session_key: &str, item: FollowupItem) {
        let entry = self
            .entries
            .entry(session_key.to_string())
            .or_insert_with(|| {
                Arc::new(QueueEntry {
                    state: Mutex::new(FollowupQueueState::new(self.default_config.clone())),
                    notify: Notify::new(),
                })
            })
            .clone();

        let now = self.clock.now_ms();
        let key = session_key.to_string();
        let mgr = self.clone();
        tokio::spawn(async move {
            let should_spawn = {
                let mut state = entry.state.lock().await;
                state.enqueue(item, now);
                if state.draining {
                    false
                } else {
                    state.draining = true;
                    true
                }
            };
            entry.notify.notify_one();

            if should_spawn {
                let mgr = mgr.clone();
                tokio::spawn(async move {
                    mgr.drain_loop(key, entry).await;
                });
            }
        });
    }

    async fn debounce_wait(&self, entry: &QueueEntry) {
        loop {
            let (debounce_ms, elapsed) = {
                let state = entry.state.lock().await;
                (state.config.debounce_ms, self.clock.now_ms() - state.last_enqueued_at_ms)
            };
            let remaining = debounce_ms - elapsed;
            if remaining <= 0 {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => {}
                _ = entry.notify.notified() => {}
            }
        }
    }

    async fn drain_loop(self: Arc<Self>, session_key: String, entry: Arc<QueueEntry>) {
        loop {
            self.debounce_wait(&entry).await;

            let mode = {
                let state = entry.state.lock().await;
                state.config.mode
            };

            let ran_anything = match mode {
                QueueMode::Collect => self.drain_collect(&session_key, &entry).await,
                QueueMode::Followup => self.drain_followup(&session_key, &entry).await,
            };

            if ran_anything {
                continue;
            }

            let mut state = entry.state.lock().await;
            if state.is_empty_and_settled() {
                state.draining = false;
                return;
            }
            // Nothing runnable yet (shouldn't normally happen) — avoid a hot
            // spin by waiting for the next notify or a short tick.
            drop(state);
            tokio::select! {
                _ = entry.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// `collect` mode: merge every queued item sharing one routable origin
    /// into a single prompt; fall back to per-item replay when origins
    /// diverge or any item is unroutable.
    async fn drain_collect(&self, session_key: &str, entry: &QueueEntry) -> bool {
        let (snapshot, dropped_count, drop_previews, last_run, forced_individual) = {
            let state = entry.state.lock().await;
            if state.items.is_empty() && !state.has_overflow() {
                return false;
            }
            let forced = !state.all_same_routable_target();
            (
                state.items.iter().cloned().collect::<Vec<_>>(),
                state.dropped_count,
                state.drop_previews.clone(),
                state.last_run.clone(),
                forced,
            )
        };

        if forced_individual {
            return self.drain_followup(session_key, entry).await;
        }

        if snapshot.is_empty() {
            return self.run_overflow_note(session_key, entry, dropped_count, drop_previews).await;
        }

        let prompt = build_collect_prompt(&snapshot, dropped_count, &drop_previews);
        let origin = snapshot[0].origin.clone();
        match self.runner.run(session_key, &prompt, origin.as_ref(), &last_run).await {
            Ok(next_context) => {
                let mut state = entry.state.lock().await;
                for _ in 0..snapshot.len() {
                    state.items.pop_front();
                }
                state.clear_overflow();
                state.last_run = next_context;
                true
            }
            Err(err) => {
                warn!(session_key, error = %err, "follow-up collect run failed, re-queuing snapshot");
                let mut state = entry.state.lock().await;
                for item in snapshot.into_iter().rev() {
                    state.items.push_front(item);
                }
                state.last_enqueued_at_ms = self.clock.now_ms();
                true
            }
        }
    }

    /// `followup` mode (and forced-individual fallback from `collect`): an
    /// overflow note, if pending, is delivered once before the next real
    /// item; otherwise pop and run the head item alone.
    async fn drain_followup(&self, session_key: &str, entry: &QueueEntry) -> bool {
        let has_overflow = {
            let state = entry.state.lock().await;
            state.has_overflow()
        };
        if has_overflow {
            let (dropped_count, drop_previews) = {
                let state = entry.state.lock().await;
                (state.dropped_count, state.drop_previews.clone())
            };
            return self.run_overflow_note(session_key, entry, dropped_count, drop_previews).await;
        }

        let (item, last_run) = {
            let mut state = entry.state.lock().await;
            let Some(item) = state.items.pop_front() else {
                return false;
            };
            (item, state.last_run.clone())
        };

        match self
            .runner
            .run(session_key, &item.prompt, item.origin.as_ref(), &last_run)
            .await
        {
            Ok(next_context) => {
                let mut state = entry.state.lock().await;
                state.last_run = next_context;
                true
            }
            Err(err) => {
                warn!(session_key, error = %err, "follow-up run failed, re-queuing item");
                let mut state = entry.state.lock().await;
                state.items.push_front(item);
                state.last_enqueued_at_ms = self.clock.now_ms();
                true
            }
        }
    }

    async fn run_overflow_note(
        &self,
        session_key: &str,
        entry: &QueueEntry,
        dropped_count: u64,
        drop_previews: Vec<String>,
    ) -> bool {
        if dropped_count == 0 {
            return false;
        }
        let note = build_overflow_note(dropped_count, &drop_previews);
        let last_run = {
            let state = entry.state.lock().await;
            state.last_run.clone()
        };
        match self.runner.run(session_key, &note, None, &last_run).await {
            Ok(next_context) => {
                let mut state = entry.state.lock().await;
                state.clear_overflow();
                state.last_run = next_context;
            }
            Err(err) => {
                warn!(session_key, error = %err, "overflow notice delivery failed, will retry next drain pass");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::types::OriginTarget;

    struct TestClock {
        start: tokio::time::Instant,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                start: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            tokio::time::Instant::now().duration_since(self.start).as_millis() as i64
        }
    }

    struct FakeRunner {
        prompts: StdMutex<Vec<String>>,
        fail_first_n: AtomicUsize,
    }

    impl FakeRunner {
        fn new(fail_first_n: usize) -> Self {
            Self {
                prompts: StdMutex::new(Vec::new()),
                fail_first_n: AtomicUsize::new(fail_first_n),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RunFollowup for FakeRunner {
        async fn run(
            &self,
            _session_key: &str,
            prompt: &str,
            _origin: Option<&OriginTarget>,
            _last_run: &Value,
        ) -> Result<Value, String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail_first_n.load(AtomicOrdering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err("boom".to_string());
            }
            Ok(Value::Null)
        }
    }

    fn item(prompt: &str) -> FollowupItem {
        FollowupItem {
            prompt: prompt.to_string(),
            message_id: None,
            origin: Some(OriginTarget {
                channel: "slack".to_string(),
                to: "C1".to_string(),
                account: None,
                thread: None,
            }),
            enqueued_at_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn followup_mode_runs_single_item_after_debounce() {
        let runner = Arc::new(FakeRunner::new(0));
        let clock = Arc::new(TestClock::new());
        let mgr = QueueManager::new(
            runner.clone(),
            clock,
            QueueConfig {
                debounce_ms: 50,
                ..QueueConfig::default()
            },
        );

        mgr.enqueue("sess-1", item("hello"));
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(runner.calls(), vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_mode_merges_same_target_items_into_one_prompt() {
        let runner = Arc::new(FakeRunner::new(0));
        let clock = Arc::new(TestClock::new());
        let mgr = QueueManager::new(
            runner.clone(),
            clock,
            QueueConfig {
                mode: QueueMode::Collect,
                debounce_ms: 50,
                ..QueueConfig::default()
            },
        );

        mgr.enqueue("sess-1", item("first"));
        tokio::task::yield_now().await;
        mgr.enqueue("sess-1", item("second"));
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("Queued #1\nfirst"));
        assert!(calls[0].contains("Queued #2\nsecond"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_requeues_item_and_retries() {
        let runner = Arc::new(FakeRunner::new(1));
        let clock = Arc::new(TestClock::new());
        let mgr = QueueManager::new(
            runner.clone(),
            clock,
            QueueConfig {
                debounce_ms: 50,
                ..QueueConfig::default()
            },
        );

        mgr.enqueue("sess-1", item("retry-me"));
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(100)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(runner.calls(), vec!["retry-me".to_string(), "retry-me".to_string()]);
    }
}
