//! Steer work queue: deduplicating admission, per-key backoff, clean drain.
//!
//! Keys are opaque strings. The queue guarantees at most one pending instance
//! of a key, never hands the same key to two consumers at once, and parks a
//! key re-added mid-flight until the holder calls [`WorkQueue::done`].

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

/// First retry delay for a failing key.
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Backoff ceiling; persistent failures keep retrying at this cadence.
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    shutting_down: bool,
}

/// Per-key exponential backoff accounting. Failure policy lives here, not in
/// the consumer: consumers report outcomes, the backoff decides how long to
/// wait before the next attempt.
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<String, u32>>,
}

impl ItemBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }

    /// Delay before the next attempt for `key`; each call counts one more
    /// consecutive failure. Doublings saturate at the ceiling.
    pub fn delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().expect("backoff lock");
        let n = failures.entry(key.to_string()).or_insert(0);
        let exp = *n;
        *n += 1;
        let mut d = self.base;
        for _ in 0..exp {
            d = d.saturating_mul(2);
            if d >= self.max {
                return self.max;
            }
        }
        d.min(self.max)
    }

    /// Consecutive-failure count for `key`.
    pub fn retries(&self, key: &str) -> u32 {
        self.failures.lock().expect("backoff lock").get(key).copied().unwrap_or(0)
    }

    /// Clear failure state for `key`; the next delay starts from the base.
    pub fn forget(&self, key: &str) {
        self.failures.lock().expect("backoff lock").remove(key);
    }
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY)
    }
}

/// Concurrent-safe work queue of reconcile keys.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    backoff: ItemBackoff,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), backoff: ItemBackoff::default() })
    }

    /// Admit `key`. Idempotent: a key already pending is coalesced, a key
    /// currently in flight is parked and re-queued when its holder finishes.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.shutting_down {
            return;
        }
        if !inner.dirty.insert(key.clone()) {
            return;
        }
        counter!("steer_queue_adds_total", 1);
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        gauge!("steer_queue_depth", inner.queue.len() as f64);
        drop(inner);
        self.notify.notify_one();
    }

    /// Admit `key` after `delay`. Delays scheduled before shutdown still
    /// fire, but their add is dropped by the shutdown guard.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.inner.lock().expect("queue lock").shutting_down {
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-admit `key` after its computed backoff delay; counts one failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = self.backoff.delay(&key);
        counter!("steer_queue_retries_total", 1);
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Block until a key is available or the queue is shut down and drained.
    /// `None` means shutdown: the caller's loop should exit.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock");
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    gauge!("steer_queue_depth", inner.queue.len() as f64);
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    // Notify stores a single permit; chain the wakeup so a
                    // burst of adds cannot strand a second blocked consumer.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker for `key`. Must be called exactly once
    /// per successful `get`. If an add arrived while the key was in flight,
    /// it is re-queued now.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Reset backoff state for `key`; called when an attempt succeeds.
    pub fn forget(&self, key: &str) {
        self.backoff.forget(key);
    }

    /// Consecutive-failure count currently recorded for `key`.
    pub fn retries(&self, key: &str) -> u32 {
        self.backoff.retries(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop admitting new keys and wake every blocked `get`. Keys already
    /// queued are still handed out so consumers can finish the drain.
    pub fn shut_down(&self) {
        self.inner.lock().expect("queue lock").shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().expect("queue lock").shutting_down
    }
}
