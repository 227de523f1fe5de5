//! Metrics registry for fleet observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile queues (dequeues, outcomes, durations, requeues, depth)
//! - Resource reconciliation (operations per kind)
//! - Fleet registry (cluster connectivity, rebuilds)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for fleet metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("fleet"));

// ============================================================================
// Reconcile Queue Metrics
// ============================================================================

/// Counter of items handed to workers
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEQUEUE: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_workqueue_dequeue_total")
        .with_description("Total number of items dequeued by workers")
        .with_unit("{items}")
        .build()
});

/// Counter of successful reconcile invocations
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_RECONCILE_SUCCESS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_workqueue_reconcile_success_total")
        .with_description("Total number of successful reconciles")
        .with_unit("{reconciles}")
        .build()
});

/// Counter of failed reconcile invocations
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_RECONCILE_FAILURE: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_workqueue_reconcile_failure_total")
        .with_description("Total number of failed reconciles")
        .with_unit("{reconciles}")
        .build()
});

/// Histogram of reconcile duration
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("fleet_workqueue_reconcile_duration_seconds")
        .with_description("Duration of reconcile invocations in seconds")
        .with_unit("s")
        .build()
});

/// Counter of explicit delayed requeues
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_REQUEUE_AFTER: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_workqueue_requeue_after_total")
        .with_description("Total number of requeues with an explicit delay")
        .with_unit("{items}")
        .build()
});

/// Counter of rate-limited requeues
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_REQUEUE_RATE_LIMITED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_workqueue_requeue_rate_limited_total")
        .with_description("Total number of rate-limited requeues")
        .with_unit("{items}")
        .build()
});

/// Gauge of items waiting in the queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("fleet_workqueue_depth")
        .with_description("Number of items waiting to be processed")
        .with_unit("{items}")
        .build()
});

// ============================================================================
// Resource Reconciler Metrics
// ============================================================================

/// Counter of resource reconciler decisions
///
/// Labels:
/// - `kind`: resource kind
/// - `operation`: create, update, recreate, delete, unchanged
pub static RESOURCE_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_resource_operations_total")
        .with_description("Total number of resource reconcile decisions")
        .with_unit("{operations}")
        .build()
});

// ============================================================================
// Registry Metrics
// ============================================================================

/// Gauge of registered clusters by connectivity
///
/// Labels:
/// - `state`: connected, disconnected
pub static CLUSTERS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("fleet_clusters")
        .with_description("Number of registered clusters by connectivity")
        .with_unit("{clusters}")
        .build()
});

/// Counter of registry rebuilds
///
/// Labels:
/// - `result`: success, error
pub static REGISTRY_REBUILDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_registry_rebuilds_total")
        .with_description("Total number of registry rebuilds")
        .with_unit("{rebuilds}")
        .build()
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Outcome of one reconcile invocation, as seen by the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Reconcile returned Ok
    Success,
    /// Reconcile returned Err
    Failure,
}

/// Record a dequeue on the named queue
pub fn record_dequeue(queue: &str) {
    QUEUE_DEQUEUE.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a reconcile outcome and its duration
pub fn record_reconcile(queue: &str, outcome: ReconcileOutcome, duration_secs: f64) {
    let attrs = [KeyValue::new("queue", queue.to_string())];
    match outcome {
        ReconcileOutcome::Success => QUEUE_RECONCILE_SUCCESS.add(1, &attrs),
        ReconcileOutcome::Failure => QUEUE_RECONCILE_FAILURE.add(1, &attrs),
    }
    QUEUE_RECONCILE_DURATION.record(duration_secs, &attrs);
}

/// Record an explicit delayed requeue
pub fn record_requeue_after(queue: &str) {
    QUEUE_REQUEUE_AFTER.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a rate-limited requeue
pub fn record_requeue_rate_limited(queue: &str) {
    QUEUE_REQUEUE_RATE_LIMITED.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record the current queue depth
pub fn record_queue_depth(queue: &str, depth: usize) {
    QUEUE_DEPTH.record(depth as i64, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a resource reconciler decision
pub fn record_resource_operation(kind: &str, operation: &'static str) {
    RESOURCE_OPERATIONS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Record registry connectivity counts
pub fn record_clusters(connected: usize, disconnected: usize) {
    CLUSTERS.record(connected as i64, &[KeyValue::new("state", "connected")]);
    CLUSTERS.record(disconnected as i64, &[KeyValue::new("state", "disconnected")]);
}

/// Record a registry rebuild
pub fn record_registry_rebuild(success: bool) {
    let result = if success { "success" } else { "error" };
    REGISTRY_REBUILDS.add(1, &[KeyValue::new("result", result)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without a meter provider these go to the no-op meter; the point is
    // that every helper is callable from any thread without panicking.
    #[test]
    fn helpers_record_without_provider() {
        record_dequeue("appset");
        record_reconcile("appset", ReconcileOutcome::Success, 0.01);
        record_reconcile("appset", ReconcileOutcome::Failure, 0.02);
        record_requeue_after("appset");
        record_requeue_rate_limited("appset");
        record_queue_depth("appset", 3);
        record_resource_operation("Deployment", "create");
        record_clusters(2, 1);
        record_registry_rebuild(true);
    }
}
