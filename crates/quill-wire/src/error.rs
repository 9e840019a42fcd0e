//! Error types for quill-wire

use thiserror::Error;

/// Result type alias using quill-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the quill service
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status
    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a status error from a code and message
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is worth another attempt by a caller-side policy.
    ///
    /// Nothing in this crate retries on its own. Client errors such as 401 or
    /// 404 will not go away by trying again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Sse(_) => true,
            Error::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_transport_variants() {
        assert!(Error::Sse("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_retryable_server_errors() {
        assert!(Error::status(500, "boom").is_retryable());
        assert!(Error::status(503, "unavailable").is_retryable());
        assert!(Error::status(429, "slow down").is_retryable());
    }

    #[test]
    fn test_not_retryable_client_errors() {
        assert!(!Error::status(400, "bad request").is_retryable());
        assert!(!Error::status(404, "no such repo").is_retryable());
        assert!(!Error::InvalidConfig("missing url".into()).is_retryable());
    }

    #[test]
    fn test_status_display() {
        let e = Error::status(502, "bad gateway");
        assert_eq!(e.to_string(), "Request failed with status 502: bad gateway");
    }
}
