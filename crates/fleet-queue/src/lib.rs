//! Reconcile queue: a rate-limited, de-duplicating queue of resource keys and
//! the worker pool that drains it.
//!
//! ```ignore
//! let queue = WorkQueue::new("appset");
//! queue.add(ObjectKey::new("prod", "web"));
//! fleet_queue::run(queue, Arc::new(reconciler), 4, cancel).await;
//! ```

#![deny(missing_docs)]

mod queue;
pub mod rate_limit;
mod worker;

pub use queue::WorkQueue;
pub use rate_limit::RateLimiter;
pub use worker::{run, Action, Reconciler};
