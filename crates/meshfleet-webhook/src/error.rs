//! Webhook error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// No handler is registered for the request path
    #[error("no webhook registered at {0}")]
    UnknownPath(String),

    /// An error occurred while communicating with the Kubernetes API
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Serving TLS failed
    #[error("webhook server error: {0}")]
    Server(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WebhookError::InvalidReview(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            WebhookError::UnknownPath(path) => (StatusCode::NOT_FOUND, path.clone()),
            WebhookError::Kube(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            WebhookError::Serialization(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            WebhookError::Server(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WebhookError> for meshfleet_common::Error {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Kube(source) => Self::Kube { source },
            WebhookError::Serialization(e) => Self::serialization(e.to_string()),
            other => Self::internal_with_context("webhook", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_review_is_a_bad_request() {
        let response = WebhookError::InvalidReview("no request".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unknown_path_is_not_found() {
        let response = WebhookError::UnknownPath("/nope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn converts_into_common_error() {
        let err: meshfleet_common::Error = WebhookError::Server("bind failed".to_string()).into();
        assert!(err.to_string().contains("bind failed"));
        assert!(matches!(err, meshfleet_common::Error::Internal { .. }));
    }
}
