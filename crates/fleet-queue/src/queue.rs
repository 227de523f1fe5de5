//! De-duplicating work queue with at-most-one in-flight processing per key.
//!
//! A key lives in at most one of three places: waiting in `queue`, marked
//! `dirty` while waiting, or in `processing` while a worker holds it. Adds
//! for a key that is being processed are parked in `dirty` and re-queued
//! when the worker calls [`WorkQueue::done`].
//!
//! Delayed adds keep one deadline per key in `waiting`; only the earliest
//! pending deadline delivers the key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fleet_common::{metrics, ObjectKey};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::rate_limit::RateLimiter;

#[derive(Default)]
struct State {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    waiting: HashMap<ObjectKey, Instant>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    limiter: Mutex<RateLimiter>,
    notify: Notify,
}

/// Rate-limited, de-duplicating queue of resource keys. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Create a queue with the default rate limiter
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_limiter(name, RateLimiter::default())
    }

    /// Create a queue with a custom rate limiter
    pub fn with_limiter(name: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                limiter: Mutex::new(limiter),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name, used as the `queue` metric attribute
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: ObjectKey) {
        let depth = {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                return;
            }
            trace!(queue = %self.inner.name, key = %key, "enqueued");
            state.queue.push_back(key);
            state.queue.len()
        };
        metrics::record_queue_depth(&self.inner.name, depth);
        self.inner.notify.notify_one();
    }

    /// Enqueue `key` after `delay`.
    ///
    /// A key already waiting for an earlier (or equal) deadline keeps it and
    /// this call is dropped; a later pending deadline is superseded.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|pending| *pending <= deadline) {
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if queue.take_waiting(&key, deadline) {
                queue.add(key);
            }
        });
    }

    // Claim the pending deadline for `key` if it is still `deadline`
    fn take_waiting(&self, key: &ObjectKey, deadline: Instant) -> bool {
        let mut state = self.inner.state.lock();
        if state.waiting.get(key) == Some(&deadline) {
            state.waiting.remove(key);
            true
        } else {
            false
        }
    }

    /// Number of keys with a pending delayed add
    pub fn num_waiting(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Enqueue `key` after the rate limiter's delay for it
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let delay = self.inner.limiter.lock().when(&key);
        self.add_after(key, delay);
    }

    /// Clear the rate limiter's failure history for `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.inner.limiter.lock().forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.inner.limiter.lock().num_requeues(key)
    }

    /// Number of keys waiting (not counting keys being processed)
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key; `None` once the queue is shutting down
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let depth = state.queue.len();
                    drop(state);
                    metrics::record_queue_depth(&self.inner.name, depth);
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer being processed
    pub fn done(&self, key: &ObjectKey) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
