//! Repo client errors

use thiserror::Error;

/// Errors returned by [`RepoClient`](crate::RepoClient) implementations
#[derive(Debug, Error)]
pub enum RepoError {
    /// The request never produced a response (connect, timeout, TLS)
    #[error("request to {path} failed: {message}")]
    Transport {
        /// Repo path of the request
        path: String,
        /// Underlying failure
        message: String,
    },

    /// The server answered with a non-2xx status
    #[error("repo server responded {status} for {path}: {message}")]
    Status {
        /// Repo path of the request
        path: String,
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// A codebase reported a version that cannot be committed on
    #[error("{version} is not a valid version of {path}")]
    InvalidVersion {
        /// Codebase path
        path: String,
        /// Reported version
        version: i64,
    },

    /// A response or document could not be (de)serialized or edited
    #[error("document error for {path}: {message}")]
    Document {
        /// Repo path of the document
        path: String,
        /// Description of what failed
        message: String,
    },
}

impl RepoError {
    /// HTTP status, when the server responded
    pub fn status(&self) -> Option<u16> {
        match self {
            RepoError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transport failures and 5xx responses are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::Transport { .. } => true,
            RepoError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<RepoError> for meshfleet_common::Error {
    fn from(e: RepoError) -> Self {
        if let RepoError::Transport { .. } = e {
            return meshfleet_common::Error::transient("repo", e.to_string());
        }
        let status = e.status();
        meshfleet_common::Error::repo(e.to_string(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_become_transient_errors() {
        let err: meshfleet_common::Error = RepoError::Transport {
            path: "/base/ingress".to_string(),
            message: "timed out".to_string(),
        }
        .into();
        assert!(matches!(err, meshfleet_common::Error::Transient { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn status_errors_keep_their_code() {
        let repo_err = RepoError::Status {
            path: "/base/ingress".to_string(),
            status: 400,
            message: "version too old".to_string(),
        };
        assert!(!repo_err.is_transient());
        let err: meshfleet_common::Error = repo_err.into();
        assert!(matches!(
            err,
            meshfleet_common::Error::Repo {
                status: Some(400),
                ..
            }
        ));
        assert!(!err.is_retryable());
    }
}
