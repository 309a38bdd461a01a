//! Node error taxonomy with retry classification.
//!
//! Distinguishes between failures the lifecycle engine retries (timeouts and
//! unclassified work-operation failures) and terminal ones (permission,
//! unknown callee, cancellation, ...).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failure raised while resolving or executing a node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    #[error("{caller} is not permitted to call {callee}")]
    PermissionDenied { caller: String, callee: String },

    #[error("Unknown node: {0}")]
    NotFound(String),

    #[error("Call depth {depth} exceeds the limit of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Transient(String),

    /// Upstream refused the request in a way retrying cannot fix
    #[error("{0}")]
    Permanent(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{failed} of {total} peers failed")]
    PartialFailure { failed: usize, total: usize },
}

impl NodeError {
    /// Create a transient (retryable) failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a terminal failure of the work operation.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transient(_) => ErrorKind::TransientFailure,
            Self::Permanent(_) => ErrorKind::PermanentFailure,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Parse(_) => ErrorKind::ParseError,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
        }
    }

    /// Check if the engine should retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(format!("{:#}", e))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Transient(format!("Invalid JSON: {}", e))
    }
}

/// Serializable classification carried on failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller lacks permission - terminal, never retried
    PermissionDenied,
    /// Unknown callee - terminal
    NotFound,
    /// Call stack grew past the configured depth - terminal
    DepthExceeded,
    /// Attempt exceeded the node timeout - retried
    Timeout,
    /// Any other work-operation failure - retried
    TransientFailure,
    /// Work operation failed for good (e.g. rejected credentials) - terminal
    PermanentFailure,
    /// Arguments were well-formed but unusable - terminal
    InvalidArgument,
    /// Cancellation signal - terminal, propagates without retry
    Cancelled,
    /// Malformed model output (ReAct self-correction only)
    ParseError,
    /// Some fan-out peers failed
    PartialFailure,
}

impl ErrorKind {
    /// Check if this error kind is retried by the lifecycle engine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::TransientFailure)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::PermissionDenied => write!(f, "Permission denied"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::DepthExceeded => write!(f, "Depth exceeded"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::TransientFailure => write!(f, "Transient failure"),
            ErrorKind::PermanentFailure => write!(f, "Permanent failure"),
            ErrorKind::InvalidArgument => write!(f, "Invalid argument"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::ParseError => write!(f, "Parse error"),
            ErrorKind::PartialFailure => write!(f, "Partial failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(NodeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(NodeError::transient("boom").is_retryable());
        assert!(!NodeError::Cancelled.is_retryable());
        assert!(!NodeError::NotFound("x".into()).is_retryable());
        assert!(!NodeError::PermissionDenied {
            caller: "a".into(),
            callee: "b".into()
        }
        .is_retryable());
        assert!(!NodeError::PartialFailure { failed: 2, total: 2 }.is_retryable());
        assert!(!NodeError::permanent("HTTP 401").is_retryable());
        assert!(!NodeError::invalid_argument("division by zero").is_retryable());
    }

    #[test]
    fn test_anyhow_maps_to_transient() {
        let err: NodeError = anyhow::anyhow!("socket closed").into();
        assert_eq!(err.kind(), ErrorKind::TransientFailure);
        assert!(err.to_string().contains("socket closed"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::PermissionDenied).unwrap();
        assert_eq!(v, serde_json::json!("permission_denied"));
    }
}
