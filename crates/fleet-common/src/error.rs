//! Error types for the fleet orchestrator
//!
//! Errors carry the cluster and resource they concern so that a log line is
//! enough to locate the failing object. API server responses are classified
//! into not-found, conflict and invalid at the cluster handle boundary, which
//! lets the reconcilers branch on the error kind instead of status codes.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that does not map onto a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Requested object does not exist
    #[error("{kind} {key} not found in cluster {cluster}")]
    NotFound {
        /// Cluster the lookup ran against
        cluster: String,
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        key: String,
    },

    /// Optimistic-concurrency conflict (stale resource version)
    #[error("conflict writing {kind} {key} in cluster {cluster}: {message}")]
    Conflict {
        /// Cluster the write ran against
        cluster: String,
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        key: String,
        /// Server message
        message: String,
    },

    /// The API server rejected the object as invalid (e.g. immutable field)
    #[error("invalid {kind} {key} in cluster {cluster}: {message}")]
    Invalid {
        /// Cluster the write ran against
        cluster: String,
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        key: String,
        /// Server message
        message: String,
    },

    /// Validation error for a declarative spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// `namespace/name` of the resource with the invalid spec
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Cluster is not part of the current registry snapshot
    #[error("cluster {cluster} not exist")]
    ClusterNotFound {
        /// Requested cluster name
        cluster: String,
    },

    /// Cluster is registered but its last health probe failed
    #[error("cluster {cluster} disconnected")]
    ClusterDisconnected {
        /// Requested cluster name
        cluster: String,
    },

    /// A component that may only be started once was started again
    #[error("{component} can't repeat start")]
    AlreadyStarted {
        /// Component name (cluster name or "registry")
        component: String,
    },

    /// A bounded call did not complete in time
    #[error("{operation} timed out after {timeout:?} in cluster {cluster}")]
    Timeout {
        /// Cluster the call ran against
        cluster: String,
        /// Operation name
        operation: String,
        /// Configured bound
        timeout: Duration,
    },

    /// Invalid process or component configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Three-way merge computation failed
    #[error("patch error for {kind} {key}: {message}")]
    Patch {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Rendering a chart bundle failed
    #[error("render error for release {release}: {message}")]
    Render {
        /// Release name (pod set name)
        release: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "registry", "appset", "fanout")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(
        cluster: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            cluster: cluster.into(),
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        cluster: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            cluster: cluster.into(),
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-object error
    pub fn invalid(
        cluster: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            cluster: cluster.into(),
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error for the given resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a patch computation error
    pub fn patch(kind: impl Into<String>, key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Patch {
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a render error
    pub fn render(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Render {
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(e),
            } => e.code == 404,
            _ => false,
        }
    }

    /// True if a write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(e),
            } => e.code == 409,
            _ => false,
        }
    }

    /// True if the API server rejected the object as invalid
    pub fn is_invalid(&self) -> bool {
        match self {
            Error::Invalid { .. } => true,
            Error::Kube {
                source: kube::Error::Api(e),
            } => e.code == 422,
            _ => false,
        }
    }

    /// Check if this error is retryable by the queue's backoff
    ///
    /// Spec errors and configuration mistakes need a human to fix them; a
    /// retry will not change the outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(e) => !(400..500).contains(&e.code) || e.code == 409,
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
            Error::AlreadyStarted { .. } => false,
            _ => true,
        }
    }

    /// Get the cluster this error concerns, if any
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::NotFound { cluster, .. }
            | Error::Conflict { cluster, .. }
            | Error::Invalid { cluster, .. }
            | Error::ClusterNotFound { cluster }
            | Error::ClusterDisconnected { cluster }
            | Error::Timeout { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error classification drives reconcile decisions
    // ==========================================================================

    /// Story: The resource reconciler branches on not-found to decide between
    /// create and update, so both the typed variant and a raw 404 must count.
    #[test]
    fn story_not_found_is_recognized_in_both_shapes() {
        let typed = Error::not_found("east", "Deployment", "default/web");
        assert!(typed.is_not_found());
        assert_eq!(
            typed.to_string(),
            "Deployment default/web not found in cluster east"
        );

        let raw: Error = api_error(404).into();
        assert!(raw.is_not_found());
        assert!(!raw.is_conflict());
    }

    /// Story: Stale writes are retried locally; the reconciler needs to tell
    /// them apart from immutable-field rejections which force a recreate.
    #[test]
    fn story_conflict_and_invalid_are_distinct() {
        let conflict = Error::conflict("east", "Job", "ns/migrate", "stale");
        let invalid = Error::invalid("east", "Job", "ns/migrate", "field is immutable");

        assert!(conflict.is_conflict() && !conflict.is_invalid());
        assert!(invalid.is_invalid() && !invalid.is_conflict());

        let raw_conflict: Error = api_error(409).into();
        let raw_invalid: Error = api_error(422).into();
        assert!(raw_conflict.is_conflict());
        assert!(raw_invalid.is_invalid());
    }

    /// Story: Registry lookups report missing and unhealthy clusters with
    /// different messages so operators can tell them apart in events.
    #[test]
    fn story_registry_errors_name_the_cluster() {
        let missing = Error::ClusterNotFound {
            cluster: "west".to_string(),
        };
        let down = Error::ClusterDisconnected {
            cluster: "west".to_string(),
        };

        assert_eq!(missing.to_string(), "cluster west not exist");
        assert_eq!(down.to_string(), "cluster west disconnected");
        assert_eq!(missing.cluster(), Some("west"));
        assert_eq!(down.cluster(), Some("west"));
    }

    /// Story: Spec mistakes are not retried by backoff, transient failures are
    #[test]
    fn story_error_retryability() {
        assert!(!Error::validation_for("ns/app", "deployType must be helm").is_retryable());
        assert!(!Error::configuration("exec timeout too small").is_retryable());
        assert!(Error::ClusterDisconnected {
            cluster: "a".into()
        }
        .is_retryable());
        assert!(Error::Timeout {
            cluster: "a".into(),
            operation: "get".into(),
            timeout: Duration::from_secs(5),
        }
        .is_retryable());

        let forbidden: Error = api_error(403).into();
        assert!(!forbidden.is_retryable());
        let unavailable: Error = api_error(503).into();
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn test_already_started_message() {
        let err = Error::AlreadyStarted {
            component: "cluster east".to_string(),
        };
        assert_eq!(err.to_string(), "cluster east can't repeat start");
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("something broke");
        match err {
            Error::Internal { context, .. } => assert_eq!(context, UNKNOWN_CONTEXT),
            _ => panic!("expected Internal"),
        }
    }

    #[test]
    fn test_cluster_accessor_absent_for_generic_errors() {
        assert_eq!(Error::serialization("bad json").cluster(), None);
        assert_eq!(Error::render("web", "bad template").cluster(), None);
    }
}
