//! Error taxonomy for the jobdeck gateway.
//!
//! Every failure that crosses from the gateway into the HTTP/WebSocket layer is
//! one of a small, stable set of kinds. Backend statuses are carried unchanged
//! inside the connectivity and rejection variants so the original cause is
//! never hidden.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};

/// Configuration failures. Fatal to the call that hit them, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No node with this name in the current registry generation.
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    /// Some but not all of cert/key/CA were supplied for a node.
    #[error("node '{node}' has an incomplete mutual-TLS bundle (missing: {missing})")]
    PartialCredentials { node: String, missing: String },

    /// The node address can't be turned into a channel endpoint.
    #[error("node '{node}' has an invalid address '{address}': {reason}")]
    InvalidAddress {
        node: String,
        address: String,
        reason: String,
    },

    /// The credential blobs were rejected while building the TLS config.
    #[error("node '{node}' has an unusable TLS bundle: {reason}")]
    Tls { node: String, reason: String },

    /// The node document could not be read or parsed.
    #[error("node source {source_name}: {reason}")]
    Source { source_name: String, reason: String },

    /// Gateway settings failed validation.
    #[error("{0}")]
    Validation(String),
}

/// Primary error type for the gateway.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad node name, malformed credentials or invalid settings.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Transport unavailable, deadline exceeded or an internal transport fault.
    #[error("Backend unreachable ({:?}): {}", .0.code(), .0.message())]
    Connectivity(Status),

    /// A well-formed request refused by the backend.
    #[error("Backend rejected request ({:?}): {}", .0.code(), .0.message())]
    BackendRejection(Status),

    /// Unknown or already collected install session.
    #[error("Install session '{0}' not found")]
    SessionNotFound(String),

    /// Errors from invalid user input.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Push channel capacity reached.
    #[error("Service capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Internal gateway errors.
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Classify a backend status without altering its code or message.
    pub fn from_status(status: Status) -> Self {
        if is_retryable_code(status.code()) {
            AppError::Connectivity(status)
        } else {
            AppError::BackendRejection(status)
        }
    }

    /// Whether the resilient executor may try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Connectivity(_))
    }

    /// The backend status behind this error, if there is one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            AppError::Connectivity(status) | AppError::BackendRejection(status) => Some(status),
            _ => None,
        }
    }

    /// Stable taxonomy tag used in JSON payloads and push events.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "configuration",
            AppError::Connectivity(_) => "connectivity",
            AppError::BackendRejection(_) => "backend_rejection",
            AppError::SessionNotFound(_) => "session_not_found",
            AppError::Validation(_) => "validation",
            AppError::CapacityExceeded(_) => "capacity_exceeded",
            AppError::Internal(_) | AppError::Io(_) | AppError::Json(_) => "internal",
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            AppError::Configuration(ConfigError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Configuration(ConfigError::Source { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::Connectivity(status) if status.code() == Code::DeadlineExceeded => {
                StatusCode::GATEWAY_TIMEOUT
            }
            AppError::Connectivity(_) => StatusCode::BAD_GATEWAY,
            AppError::BackendRejection(status) => match status.code() {
                Code::NotFound => StatusCode::NOT_FOUND,
                Code::InvalidArgument | Code::OutOfRange => StatusCode::BAD_REQUEST,
                Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
                Code::PermissionDenied => StatusCode::FORBIDDEN,
                Code::Unauthenticated => StatusCode::UNAUTHORIZED,
                Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
                Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) | AppError::Io(_) | AppError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Transport-class status codes; everything else is an application answer.
pub fn is_retryable_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::Internal
    )
}

/// Re-code transport failures that tonic surfaced as `Unknown`.
///
/// Connection-level faults (refused, reset, TLS handshake) sometimes arrive
/// with `Code::Unknown` and a transport error in the source chain.
pub fn normalize_transport_status(status: Status) -> Status {
    if status.code() != Code::Unknown {
        return status;
    }

    let mut source: Option<&(dyn StdError + 'static)> = status.source();
    while let Some(err) = source {
        if err.is::<tonic::transport::Error>() || err.is::<io::Error>() {
            return Status::unavailable(status.message().to_string());
        }
        source = err.source();
    }

    status
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let Some(backend) = self.status() {
            body["code"] = json!(format!("{:?}", backend.code()));
        }

        (status, Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type Result<T> = std::result::Result<T, AppError>;

/// Run a backend call under a deadline.
///
/// An expired deadline is reported as `DeadlineExceeded`, the same status the
/// backend would return, so it flows through the normal classification.
pub async fn with_deadline<T, F>(
    operation: F,
    deadline: Duration,
    context: &'static str,
) -> std::result::Result<T, Status>
where
    F: Future<Output = std::result::Result<T, Status>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(Status::deadline_exceeded(format!(
            "{}: no response within {:?}",
            context, deadline
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_keeps_status_intact() {
        let err = AppError::from_status(Status::unavailable("connection refused"));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "connectivity");
        let status = err.status().unwrap();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "connection refused");

        let err = AppError::from_status(Status::not_found("job 42"));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "backend_rejection");
        assert_eq!(err.status().unwrap().message(), "job 42");
    }

    #[test]
    fn test_internal_is_retryable() {
        assert!(is_retryable_code(Code::Internal));
        assert!(is_retryable_code(Code::DeadlineExceeded));
        assert!(!is_retryable_code(Code::FailedPrecondition));
        assert!(!is_retryable_code(Code::Cancelled));
    }

    #[test]
    fn test_http_mapping() {
        let cases = [
            (
                AppError::Configuration(ConfigError::NodeNotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Configuration(ConfigError::PartialCredentials {
                    node: "x".into(),
                    missing: "ca".into(),
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Connectivity(Status::deadline_exceeded("slow")),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                AppError::Connectivity(Status::unavailable("down")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                AppError::BackendRejection(Status::already_exists("vol")),
                StatusCode::CONFLICT,
            ),
            (
                AppError::SessionNotFound("abc".into()),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_unknown_without_transport_source_is_untouched() {
        let status = normalize_transport_status(Status::unknown("weird"));
        assert_eq!(status.code(), Code::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: std::result::Result<(), Status> = with_deadline(
            std::future::pending(),
            Duration::from_millis(50),
            "ListJobs",
        )
        .await;
        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(status.message().starts_with("ListJobs"));
    }
}
