//! API error classification.
//!
//! Every provider call resolves to an [`ApiError`] variant so the engine can
//! decide between retrying, failing a single scope, or aborting the query.

use std::time::Duration;

use serde::Serialize;

/// Classified provider API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Retryable condition: throttling, server-side failures, transport
    /// interruptions. May carry a server-suggested backoff.
    #[error("transient API error (status {status}): {message}")]
    Transient {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    /// Fatal for the scope that issued the call.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Fatal for the scope; tables may opt to treat this as zero rows.
    #[error("not found: {0}")]
    NotFound(String),

    /// Fatal for the whole query: the request itself is wrong and retrying
    /// cannot help.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("API error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Whether the retry policy should attempt this call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    /// Server-suggested backoff, if the response carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Transient { .. } => ErrorKind::Transient,
            ApiError::Permission(_) => ErrorKind::Permission,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            ApiError::Decode(_) | ApiError::Unknown(_) => ErrorKind::Internal,
        }
    }

    /// Classify an HTTP status into an error variant.
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: String) -> Self {
        match status {
            401 | 403 => ApiError::Permission(message),
            404 | 410 => ApiError::NotFound(message),
            400 => ApiError::MalformedRequest(message),
            408 | 429 | 500..=599 => ApiError::Transient {
                status,
                retry_after,
                message,
            },
            _ => ApiError::Unknown(format!("status {status}: {message}")),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        // Connection resets and timeouts are worth retrying; the request never
        // reached a classifiable HTTP status.
        ApiError::Transient {
            status: 0,
            retry_after: None,
            message: err.to_string(),
        }
    }
}

/// Coarse error class reported to the host alongside a scope identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Transient,
    Permission,
    NotFound,
    MalformedRequest,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ApiError::from_status(403, None, "denied".into()),
            ApiError::Permission(_)
        ));
        assert!(matches!(
            ApiError::from_status(404, None, "gone".into()),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from_status(400, None, "bad filter".into()),
            ApiError::MalformedRequest(_)
        ));
        assert!(ApiError::from_status(429, None, "slow down".into()).is_transient());
        assert!(ApiError::from_status(503, None, "unavailable".into()).is_transient());
    }

    #[test]
    fn test_retry_after_only_on_transient() {
        let hint = Some(Duration::from_secs(2));
        let err = ApiError::from_status(429, hint, "quota".into());
        assert_eq!(err.retry_after(), hint);
        assert_eq!(ApiError::Permission("x".into()).retry_after(), None);
    }
}
