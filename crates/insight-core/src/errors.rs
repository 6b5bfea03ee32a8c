use std::time::Duration;

/// Transport-level failures talking to the reasoning provider or one of the
/// backend services. Classified so callers can decide on retries; the core
/// itself never retries.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Fatal, not retried
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::NetworkError(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::MalformedResponse(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedResponse(_) => "malformed_response",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Why one normalization step contributed nothing to the merged record.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("chunk {index} has an unexpected shape: {reason}")]
    MalformedChunk { index: usize, reason: String },
    #[error("data fragment {index} is not an object")]
    NonObjectFragment { index: usize },
    #[error("field schema is malformed: {0}")]
    MalformedSchema(String),
    #[error("row {index} is not an object")]
    MalformedRow { index: usize },
}

/// Session gate failures. `AlreadyExists` on create is tolerated by
/// `ensure_session`; everything else reaches the boundary.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("session backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(GatewayError::RateLimited { retry_after: None }.is_retryable());
        assert!(GatewayError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(GatewayError::NetworkError("reset".into()).is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(GatewayError::AuthenticationFailed("expired".into()).is_fatal());
        assert!(GatewayError::MalformedResponse("no candidates".into()).is_fatal());
        assert!(!GatewayError::Timeout(Duration::from_secs(5)).is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(GatewayError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(GatewayError::from_status(404, "no such model".into()).is_fatal());
        assert!(GatewayError::from_status(429, "slow down".into()).is_retryable());
        assert!(GatewayError::from_status(503, "unavailable".into()).is_retryable());
        assert_eq!(GatewayError::from_status(418, "teapot".into()).error_kind(), "invalid_request");
    }

    #[test]
    fn merge_error_display() {
        let err = MergeError::NonObjectFragment { index: 2 };
        assert_eq!(err.to_string(), "data fragment 2 is not an object");
    }
}
