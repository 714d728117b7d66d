//! Deduplicating, rate-limited work queue keyed by `namespace/name`.
//!
//! A key is in at most one of three places: queued, being processed, or
//! neither. Adding a queued key is a no-op. Adding a key that is being
//! processed marks it dirty; it is queued again when the worker calls
//! [`WorkQueue::done`]. This gives at most one concurrent pass per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::models::{RateLimitConfig, RequeueConfig};

type BucketLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Queue tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name used in logs
    pub name: String,
    pub requests_per_second: f64,
    pub burst_size: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, rate: &RateLimitConfig, requeue: &RequeueConfig) -> Self {
        Self {
            name: name.into(),
            requests_per_second: rate.requests_per_second,
            burst_size: rate.burst_size,
            initial_backoff: Duration::from_millis(requeue.initial_backoff_ms),
            max_backoff: Duration::from_millis(requeue.max_backoff_ms),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(
            "default",
            &RateLimitConfig::default(),
            &RequeueConfig::default(),
        )
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
    failures: HashMap<String, (u32, ExponentialBackoff)>,
}

pub struct WorkQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    bucket: Option<BucketLimiter>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let bucket = bucket_quota(config.requests_per_second, config.burst_size)
            .map(RateLimiter::direct);
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            bucket,
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for a key. Returns `None` once the queue has been shut down.
    ///
    /// The caller must call [`WorkQueue::done`] with the key when finished.
    pub async fn get(&self) -> Option<String> {
        loop {
            // Registered before the state check so a concurrent add cannot slip by
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key taken with [`WorkQueue::get`], requeueing it if it was
    /// added again while being processed.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeue `key` after its exponential per-key backoff, then wait for a
    /// token from the shared bucket.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let (count, backoff) = state
                .failures
                .entry(key.clone())
                .or_insert_with(|| (0, self.new_backoff()));
            *count += 1;
            backoff.next_backoff().unwrap_or(self.config.max_backoff)
        };
        debug!(queue = %self.config.name, key = %key, delay_ms = delay.as_millis(), "requeue with backoff");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(bucket) = &queue.bucket {
                bucket.until_ready().await;
            }
            queue.add(key);
        });
    }

    /// Times `key` has been requeued through [`WorkQueue::add_rate_limited`]
    /// since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).map_or(0, |(count, _)| *count)
    }

    /// Reset the backoff history of `key`.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Stop accepting keys and release every waiting [`WorkQueue::get`].
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.config.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Token bucket refilling `rate` tokens per second. `None` when the rate is
/// not positive, which disables the bucket.
fn bucket_quota(rate: f64, burst: u32) -> Option<Quota> {
    if rate <= 0.0 || !rate.is_finite() {
        return None;
    }
    let period = Duration::from_secs_f64(1.0 / rate);
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    Quota::with_period(period).map(|quota| quota.allow_burst(burst))
}
