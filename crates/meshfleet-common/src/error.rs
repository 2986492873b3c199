//! Error types for the meshfleet control plane
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants follow the failure kinds the controllers act on: validation
//! failures are surfaced to the submitter, conflicts and transient failures
//! are retried, not-found is a no-op, and fatal errors stop the process.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for meshfleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.gateway")
        field: Option<String>,
    },

    /// Optimistic-concurrency loss; re-read and retry
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Resource that was modified concurrently
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Object vanished between enqueue and reconcile
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name (namespace/name when namespaced)
        name: String,
    },

    /// Network or timeout failure worth retrying
    #[error("transient error [{context}]: {message}")]
    Transient {
        /// Where the failure happened (e.g., "repo", "remote-cluster")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Codebase repository error
    #[error("repo error: {message}")]
    Repo {
        /// Description of what failed
        message: String,
        /// HTTP status returned by the repo server, if any
        status: Option<u16>,
    },

    /// Unrecoverable startup misconfiguration
    #[error("fatal error: {message}")]
    Fatal {
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

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "supervisor", "federation")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a transient error with context
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a repo error, optionally carrying the HTTP status
    pub fn repo(msg: impl Into<String>, status: Option<u16>) -> Self {
        Self::Repo {
            message: msg.into(),
            status,
        }
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal {
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

    /// Check if this error is retryable
    ///
    /// Validation, serialization and fatal errors need a config fix.
    /// Kubernetes errors are retryable unless they are 4xx, except 409
    /// which means a concurrent writer won and the caller should re-read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => false,
            Error::Transient { .. } => true,
            Error::Repo { status, .. } => !matches!(status, Some(s) if (400..500).contains(s)),
            Error::Fatal { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Repo { status, .. } => *status == Some(404),
            _ => false,
        }
    }

    /// True when the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Conflict { resource, .. } => Some(resource),
            Error::NotFound { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Kinds Drive Controller Behaviour
    // ==========================================================================

    /// Story: an OutCluster record missing its gateway is refused with a
    /// field path the user can act on
    #[test]
    fn story_validation_errors_point_at_the_field() {
        let err = Error::validation_for_field(
            "east",
            "spec.gateway",
            "gateway must be set in OutCluster mode",
        );
        assert!(err.to_string().contains("validation error for east"));
        assert_eq!(err.resource(), Some("east"));
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.gateway"))
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: a record deleted between enqueue and reconcile becomes a no-op
    #[test]
    fn story_not_found_is_distinguished() {
        assert!(Error::not_found("Cluster", "east").is_not_found());
        assert!(Error::from(api_error(404)).is_not_found());
        assert!(Error::repo("codebase missing", Some(404)).is_not_found());
        assert!(!Error::from(api_error(500)).is_not_found());
    }

    /// Story: losing an optimistic-concurrency race is retried after a re-read
    #[test]
    fn story_conflicts_are_retried() {
        let err = Error::from(api_error(409));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(Error::conflict("shop/cart", "resourceVersion changed").is_retryable());
    }

    /// Story: repo and network hiccups are retried, bad requests are not
    #[test]
    fn story_transient_failures_are_retryable() {
        assert!(Error::transient("repo", "connection reset").is_retryable());
        assert!(Error::repo("bad gateway", Some(502)).is_retryable());
        assert!(Error::repo("transport failure", None).is_retryable());
        assert!(!Error::repo("stale version", Some(400)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
    }

    #[test]
    fn fatal_and_serialization_errors_are_not_retryable() {
        assert!(!Error::fatal("missing POD_NAMESPACE").is_retryable());
        let err = Error::serialization_for_kind("MeshConfig", "missing field");
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("MeshConfig")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn internal_errors_carry_context() {
        let err = Error::internal_with_context("supervisor", "task panicked");
        assert!(err.to_string().contains("[supervisor]"));
        assert!(Error::internal("x").to_string().contains(UNKNOWN_CONTEXT));
    }
}
