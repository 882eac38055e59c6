// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Deduplicating, rate-limited work queue with a retry ceiling.
//!
//! A key is held at most once while pending and is never handed to two
//! workers at the same time: a key added while it is being processed is
//! parked in the dirty set and re-queued when the worker calls [`WorkQueue::done`].

use crate::constants::queue::{BASE_DELAY_MS, MAX_DELAY_SECS, MAX_RETRIES};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying it
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let exp = failures.get(key).copied().unwrap_or(0);
        failures.insert(key.clone(), exp.saturating_add(1));

        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl<K: Eq + Hash + Clone> Default for ExponentialRateLimiter<K> {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(BASE_DELAY_MS),
            Duration::from_secs(MAX_DELAY_SECS),
        )
    }
}

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
}

#[derive(Debug)]
struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    shutdown: CancellationToken,
    limiter: ExponentialRateLimiter<K>,
    max_retries: u32,
}

/// Shared handle to the queue; clones refer to the same queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, ExponentialRateLimiter::default(), MAX_RETRIES)
    }

    pub fn with_rate_limiter(
        name: impl Into<String>,
        limiter: ExponentialRateLimiter<K>,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                limiter,
                max_retries,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing. Duplicate pending adds collapse into one.
    pub fn add(&self, key: K) {
        if self.is_shutting_down() {
            return;
        }

        let mut state = self.state();
        if state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Re-queued by done() once the current worker lets go of it
            return;
        }
        state.queue.push_back(key);
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed, unless the queue shuts down first
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = queue.inner.shutdown.cancelled() => {}
            }
        });
    }

    /// Block until a key is available. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            if self.is_shutting_down() {
                return None;
            }

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = self.inner.shutdown.cancelled() => {}
            }
        }
    }

    /// Release `key` after processing; re-queues it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        debug!(queue = %self.inner.name, "Shutting down work queue");
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// The key was processed successfully: clear its retry history
    pub fn ack_success(&self, key: &K) {
        self.forget(key);
    }

    /// The key failed. Requeue with backoff below the retry ceiling, otherwise
    /// drop it and reset its history. Returns whether the key was requeued.
    pub fn ack_failure(&self, key: K, err: &dyn Display) -> bool {
        let attempts = self.num_requeues(&key);
        if attempts < self.inner.max_retries {
            info!(
                queue = %self.inner.name,
                key = %key,
                attempt = attempts + 1,
                error = %err,
                "Error syncing key, requeueing"
            );
            self.add_rate_limited(key);
            return true;
        }

        error!(
            queue = %self.inner.name,
            key = %key,
            error = %err,
            "Dropping key out of the queue after {} retries",
            self.inner.max_retries
        );
        self.forget(&key);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "openshift-machine-api/machine-health-check-operator";

    fn new_queue() -> WorkQueue<String> {
        WorkQueue::new("test")
    }

    #[test]
    fn test_rate_limiter_doubles_from_base() {
        let limiter = ExponentialRateLimiter::<String>::default();
        let key = KEY.to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.when(&key), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&key), 3);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn test_rate_limiter_caps_at_max() {
        let limiter =
            ExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        let key = KEY.to_string();

        let delays: Vec<_> = (0..6).map(|_| limiter.when(&key)).collect();
        assert_eq!(delays[3], Duration::from_millis(30));
        assert_eq!(delays[5], Duration::from_millis(30));

        // Far past the point where the multiplier overflows
        for _ in 0..100 {
            limiter.when(&key);
        }
        assert_eq!(limiter.when(&key), Duration::from_millis(30));
    }

    #[test]
    fn test_add_coalesces_duplicates() {
        let queue = new_queue();
        for _ in 0..5 {
            queue.add(KEY.to_string());
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_add_while_processing_is_requeued_on_done() {
        let queue = new_queue();
        queue.add(KEY.to_string());

        let key = queue.get().await.unwrap();
        assert!(queue.is_empty());

        // Events arriving mid-reconcile must not hand the key to a second worker
        queue.add(KEY.to_string());
        queue.add(KEY.to_string());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), KEY);
    }

    #[tokio::test]
    async fn test_done_without_new_add_leaves_queue_empty() {
        let queue = new_queue();
        queue.add(KEY.to_string());
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_order_across_keys() {
        let queue = new_queue();
        queue.add("a".to_string());
        queue.add("b".to_string());
        queue.add("a".to_string());

        assert_eq!(queue.get().await.unwrap(), "a");
        assert_eq!(queue.get().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getter() {
        let queue = new_queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_ignored() {
        let queue = new_queue();
        queue.shut_down();
        queue.add(KEY.to_string());
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_blocked_getter_receives_later_add() {
        let queue = new_queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add(KEY.to_string());

        assert_eq!(waiter.await.unwrap().as_deref(), Some(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_delays_requeue() {
        let queue = new_queue();
        queue.add_rate_limited(KEY.to_string());
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.num_requeues(&KEY.to_string()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_failure_drops_after_ceiling() {
        let queue = new_queue();
        let key = KEY.to_string();
        let err = "boom";

        for attempt in 1..=MAX_RETRIES {
            assert!(queue.ack_failure(key.clone(), &err));
            assert_eq!(queue.num_requeues(&key), attempt);
        }

        assert!(!queue.ack_failure(key.clone(), &err));
        assert_eq!(queue.num_requeues(&key), 0);

        // A fresh failure after the drop starts from the base delay again
        assert!(queue.ack_failure(key.clone(), &err));
        assert_eq!(queue.num_requeues(&key), 1);
    }

    #[tokio::test]
    async fn test_ack_success_resets_retries() {
        let queue = new_queue();
        let key = KEY.to_string();
        queue.ack_failure(key.clone(), &"boom");
        queue.ack_failure(key.clone(), &"boom");
        assert_eq!(queue.num_requeues(&key), 2);

        queue.ack_success(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }
}
