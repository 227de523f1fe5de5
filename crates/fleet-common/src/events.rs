//! Kubernetes Event recording for the fleet controllers.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (e.g. "InvalidSpec")
    /// * `action` - What was being done (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Publisher that keeps every event in memory, for assertions in tests.
#[derive(Default, Clone)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

/// One event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event is attached to
    pub object: String,
    /// True for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event note
    pub note: Option<String>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events with the given reason
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Spec failed validation (deploy type, missing chart)
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// A child resource was created or updated
    pub const RESOURCE_APPLIED: &str = "ResourceApplied";
    /// A child resource could not be applied
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// Aggregated status reached Running
    pub const RUNNING: &str = "Running";
    /// An orphaned per-cluster child was removed
    pub const UNEXPECTED_DELETED: &str = "UnexpectedDeleted";
    /// Deletion of per-cluster children is in progress
    pub const DELETING: &str = "Deleting";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Deleting child resources
    pub const DELETE: &str = "Delete";
    /// Applying child resources
    pub const APPLY: &str = "Apply";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<RecordingEventPublisher>();
    }

    #[tokio::test]
    async fn recording_publisher_captures_warnings() {
        let publisher = RecordingEventPublisher::new();
        let obj_ref = ObjectReference {
            name: Some("web".to_string()),
            ..Default::default()
        };

        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::RECONCILE,
                Some("deployType must be helm".to_string()),
            )
            .await;
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::RUNNING,
                actions::RECONCILE,
                None,
            )
            .await;

        let warnings = publisher.with_reason(reasons::INVALID_SPEC);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].warning);
        assert_eq!(warnings[0].object, "web");
        assert_eq!(publisher.events().len(), 2);
    }
}
