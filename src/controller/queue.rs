//! Rate-limited work queue
//!
//! Keys are deduplicated while pending, and a key handed out by [`WorkQueue::get`]
//! is never handed out again before [`WorkQueue::done`] is called for it. A key
//! added while it is being processed is parked in the dirty set and re-queued
//! on `done`, so handlers never run concurrently for the same key.
//!
//! Failed keys are retried through [`WorkQueue::add_rate_limited`] with a
//! per-key exponential delay that is reset by [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use super::metrics;

/// Initial retry delay of a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound of the retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential failure backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl ExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Records a failure for `key` and returns how long to wait before retrying.
    pub fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // 2^31 * 5ms is far beyond any sane cap already
        let factor = 2_u32.saturating_pow(exp.min(31));
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

impl Default for ExponentialRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed out, in insertion order
    queue: VecDeque<String>,
    /// Keys waiting to be processed (queued, or re-added while processing)
    dirty: HashSet<String>,
    /// Keys handed out by `get` and not yet marked done
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Deduplicating, rate-limited work queue shared between event handlers and a worker.
#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    limiter: Mutex<ExponentialRateLimiter>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_rate_limiter(name, ExponentialRateLimiter::default())
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: ExponentialRateLimiter) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            limiter: Mutex::new(limiter),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A poisoned lock only means a panic happened while holding it; the
    // sets are still consistent because every mutation is a single call.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter(&self) -> MutexGuard<'_, ExponentialRateLimiter> {
        self.limiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `key` as needing processing. Never blocks.
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.to_string()) {
            return;
        }
        metrics::inc_workqueue_adds(&self.name);

        // Re-queued by `done` once the current processing finishes.
        if state.processing.contains(key) {
            return;
        }

        state.queue.push_back(key.to_string());
        metrics::set_workqueue_depth(&self.name, state.queue.len());
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Adds `key` after its current backoff delay and bumps the failure count.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.limiter().when(key);
        metrics::inc_workqueue_retries(&self.name);
        debug!(queue = %self.name, key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Resets the failure count of `key`.
    pub fn forget(&self, key: &str) {
        self.limiter().forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter().num_requeues(key)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the state so that a
            // notification sent in between isn't lost.
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_workqueue_depth(&self.name, state.queue.len());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as processed. If it was re-added meanwhile it's queued again.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            metrics::set_workqueue_depth(&self.name, state.queue.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys ready to be handed out, in queue order.
    pub fn pending(&self) -> Vec<String> {
        self.state().queue.iter().cloned().collect()
    }

    /// Stops accepting new keys and wakes up every waiting `get`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_backoff() {
        let mut limiter =
            ExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
        assert_eq!(limiter.when("a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues("a"), 3);
        // Other keys are independent
        assert_eq!(limiter.when("b"), Duration::from_millis(5));

        for _ in 0..20 {
            limiter.when("a");
        }
        assert_eq!(limiter.when("a"), Duration::from_secs(1));

        limiter.forget("a");
        assert_eq!(limiter.num_requeues("a"), 0);
        assert_eq!(limiter.when("a"), Duration::from_millis(5));
    }

    #[test]
    fn test_rate_limiter_does_not_overflow() {
        let mut limiter = ExponentialRateLimiter::default();
        for _ in 0..100 {
            assert!(limiter.when("k") <= DEFAULT_MAX_DELAY);
        }
    }

    #[tokio::test]
    async fn test_pending_keys_are_deduplicated() {
        let queue = WorkQueue::new("test-dedup");
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.pending(), vec!["ns/a".to_string(), "ns/b".to_string()]);

        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_key_is_not_handed_out_twice_while_processing() {
        let queue = WorkQueue::new("test-processing");
        queue.add("ns/a");
        let key = queue.get().await.unwrap();

        // Two events arrive while the first one is being processed.
        queue.add("ns/a");
        queue.add("ns/a");
        assert!(queue.is_empty(), "key must not be ready while in flight");

        queue.done(&key);
        assert_eq!(queue.pending(), vec!["ns/a".to_string()]);

        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty(), "one dirty cycle yields exactly one more get");
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = WorkQueue::new("test-wait");
        let q = Arc::clone(&queue);
        let handle = tokio::spawn(async move { q.get().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("ns/late");

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/late"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_and_rejects_adds() {
        let queue = WorkQueue::new("test-shutdown");
        let q = Arc::clone(&queue);
        let handle = tokio::spawn(async move { q.get().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shut_down();

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);

        queue.add("ns/a");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_keys_first() {
        let queue = WorkQueue::new("test-drain");
        queue.add("ns/a");
        queue.shut_down();
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_add_rate_limited_requeues_after_delay() {
        let queue = WorkQueue::with_rate_limiter(
            "test-rate-limited",
            ExponentialRateLimiter::new(Duration::from_millis(20), Duration::from_secs(1)),
        );
        queue.add_rate_limited("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 1);
        assert!(queue.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/a"));

        queue.forget("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 0);
    }
}
