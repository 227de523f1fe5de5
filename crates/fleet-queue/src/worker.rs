//! Worker pool driving a [`Reconciler`] from a [`WorkQueue`]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_common::metrics::{self, ReconcileOutcome};
use fleet_common::{Error, ObjectKey, Result};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;

/// What the queue should do with a key after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Converged; forget the key
    Done,
    /// Try again through the rate limiter
    Requeue,
    /// Try again after a fixed delay, forgetting the backoff history
    RequeueAfter(Duration),
}

impl Action {
    /// Converged
    pub fn done() -> Self {
        Action::Done
    }

    /// Requeue after `d`, or forget when `d` is zero
    pub fn requeue_after(d: Duration) -> Self {
        if d.is_zero() {
            Action::Done
        } else {
            Action::RequeueAfter(d)
        }
    }
}

/// A reconcile function bound to a queue
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Reconcile the object identified by `key`
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Run `workers` loops against `queue` until `cancel` fires.
///
/// On cancellation the queue stops handing out keys and this returns once
/// every in-flight reconcile has finished.
pub async fn run<R>(queue: WorkQueue, reconciler: Arc<R>, workers: usize, cancel: CancellationToken)
where
    R: Reconciler + ?Sized,
{
    let workers = workers.max(1);
    info!(queue = %queue.name(), workers, "starting workers");

    let mut set = JoinSet::new();
    for id in 0..workers {
        set.spawn(worker_loop(queue.clone(), reconciler.clone(), id));
    }

    cancel.cancelled().await;
    info!(queue = %queue.name(), "shutting down workers");
    queue.shutdown();

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(queue = %queue.name(), error = %e, "worker task failed");
        }
    }
    info!(queue = %queue.name(), "workers stopped");
}

async fn worker_loop<R>(queue: WorkQueue, reconciler: Arc<R>, id: usize)
where
    R: Reconciler + ?Sized,
{
    while let Some(key) = queue.get().await {
        process(&queue, reconciler.as_ref(), &key, id).await;
        queue.done(&key);
    }
}

/// Invoke the reconciler once and apply exactly one queue outcome.
///
/// A panicking reconcile counts as a failed one; the worker keeps running.
async fn process<R>(queue: &WorkQueue, reconciler: &R, key: &ObjectKey, worker: usize)
where
    R: Reconciler + ?Sized,
{
    let name = queue.name();
    metrics::record_dequeue(name);

    let start = Instant::now();
    let result = match AssertUnwindSafe(reconciler.reconcile(key)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::internal_with_context(
            "reconcile",
            format!("panicked: {}", panic_message(panic.as_ref())),
        )),
    };
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Err(e) => {
            metrics::record_reconcile(name, ReconcileOutcome::Failure, elapsed);
            metrics::record_requeue_rate_limited(name);
            warn!(
                queue = %name,
                key = %key,
                worker,
                retryable = e.is_retryable(),
                error = %e,
                "reconcile failed, requeueing with backoff"
            );
            queue.add_rate_limited(key.clone());
        }
        Ok(action) => {
            metrics::record_reconcile(name, ReconcileOutcome::Success, elapsed);
            match action {
                Action::Done => {
                    debug!(queue = %name, key = %key, "reconciled");
                    queue.forget(key);
                }
                Action::RequeueAfter(delay) => {
                    metrics::record_requeue_after(name);
                    debug!(
                        queue = %name,
                        key = %key,
                        delay_ms = delay.as_millis(),
                        "reconciled, requeue after delay"
                    );
                    queue.forget(key);
                    queue.add_after(key.clone(), delay);
                }
                Action::Requeue => {
                    metrics::record_requeue_rate_limited(name);
                    queue.add_rate_limited(key.clone());
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts invocations and tracks concurrency per key
    #[derive(Default)]
    struct CountingReconciler {
        calls: Mutex<HashMap<ObjectKey, usize>>,
        in_flight: Mutex<HashMap<ObjectKey, usize>>,
        max_per_key: AtomicUsize,
        delay: Duration,
        fail_first: bool,
        panic_first: bool,
        outcome: Option<Action>,
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
            let call = {
                let mut calls = self.calls.lock();
                let n = calls.entry(key.clone()).or_default();
                *n += 1;
                *n
            };
            {
                let mut in_flight = self.in_flight.lock();
                let n = in_flight.entry(key.clone()).or_default();
                *n += 1;
                self.max_per_key.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            *self.in_flight.lock().entry(key.clone()).or_default() -= 1;

            if self.fail_first && call == 1 {
                return Err(Error::internal("first attempt fails"));
            }
            if self.panic_first && call == 1 {
                panic!("first attempt panics");
            }
            Ok(self.outcome.unwrap_or(Action::Done))
        }
    }

    impl CountingReconciler {
        fn calls(&self, key: &ObjectKey) -> usize {
            self.calls.lock().get(key).copied().unwrap_or(0)
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    /// Story: Ten watch events for the same object arrive before a worker is
    /// free; the object is reconciled once.
    #[tokio::test]
    async fn story_burst_of_adds_reconciles_once() {
        let queue = WorkQueue::new("dedup");
        for _ in 0..10 {
            queue.add(key("web"));
        }
        let reconciler = Arc::new(CountingReconciler::default());
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run(queue.clone(), reconciler.clone(), 4, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        runner.await.expect("run");

        assert_eq!(reconciler.calls(&key("web")), 1);
    }

    /// Story: With four workers, keys keep arriving for one object while it
    /// is being reconciled. Two reconciles of that object never overlap.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_same_key_is_never_processed_concurrently() {
        let queue = WorkQueue::new("in-flight");
        let reconciler = Arc::new(CountingReconciler {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run(queue.clone(), reconciler.clone(), 4, cancel.clone()));

        for _ in 0..10 {
            queue.add(key("web"));
            queue.add(key("api"));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        runner.await.expect("run");

        assert_eq!(reconciler.max_per_key.load(Ordering::SeqCst), 1);
        assert!(reconciler.calls(&key("web")) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_requeued_through_the_rate_limiter() {
        let queue = WorkQueue::new("errors");
        queue.add(key("web"));
        let reconciler = Arc::new(CountingReconciler {
            fail_first: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run(queue.clone(), reconciler.clone(), 1, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reconciler.calls(&key("web")), 1);
        assert_eq!(queue.num_requeues(&key("web")), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.calls(&key("web")), 2);
        assert_eq!(queue.num_requeues(&key("web")), 0, "success forgets");

        cancel.cancel();
        runner.await.expect("run");
    }

    /// Story: The single worker's first reconcile of `web` panics. The key
    /// is released and retried with backoff, and the same worker goes on to
    /// reconcile `api`.
    #[tokio::test(start_paused = true)]
    async fn story_panicking_reconcile_is_retried_and_worker_survives() {
        let queue = WorkQueue::new("panics");
        queue.add(key("web"));
        let reconciler = Arc::new(CountingReconciler {
            panic_first: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run(queue.clone(), reconciler.clone(), 1, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reconciler.calls(&key("web")), 1);
        assert_eq!(queue.num_requeues(&key("web")), 1);

        queue.add(key("api"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.calls(&key("api")), 1);
        assert_eq!(reconciler.calls(&key("web")), 2);
        assert_eq!(queue.num_requeues(&key("web")), 0);

        cancel.cancel();
        runner.await.expect("run");
    }

    #[test]
    fn panic_payloads_are_described() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("boom"));
        let borrowed: Box<dyn Any + Send> = Box::new("bang");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(owned.as_ref()), "boom");
        assert_eq!(panic_message(borrowed.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_schedules_a_fixed_delay() {
        let queue = WorkQueue::new("after");
        queue.add(key("web"));
        let reconciler = Arc::new(CountingReconciler {
            outcome: Some(Action::requeue_after(Duration::from_secs(5))),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run(queue.clone(), reconciler.clone(), 1, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(reconciler.calls(&key("web")), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reconciler.calls(&key("web")), 2);

        cancel.cancel();
        runner.await.expect("run");
    }

    /// Story: Shutdown arrives while a slow reconcile is running; `run`
    /// waits for it instead of abandoning the write half-way.
    #[tokio::test]
    async fn story_shutdown_drains_in_flight_work() {
        let queue = WorkQueue::new("drain");
        queue.add(key("slow"));
        let reconciler = Arc::new(CountingReconciler {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(run(queue.clone(), reconciler.clone(), 1, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        runner.await.expect("run");

        assert_eq!(reconciler.calls(&key("slow")), 1);
        assert_eq!(
            reconciler.in_flight.lock().get(&key("slow")).copied(),
            Some(0),
            "reconcile finished before run returned"
        );
    }

    #[test]
    fn zero_requeue_after_means_done() {
        assert_eq!(Action::requeue_after(Duration::ZERO), Action::Done);
        assert_eq!(
            Action::requeue_after(Duration::from_secs(1)),
            Action::RequeueAfter(Duration::from_secs(1))
        );
    }
}
