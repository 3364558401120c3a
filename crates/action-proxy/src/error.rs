//! Error types for the action proxy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Message reported to every caller when the bundled application is gone.
pub const PROCESS_NOT_RUNNING: &str = "application process is not running";

/// Proxy-specific errors.
///
/// Every variant is reported to the caller of the `init` or `run` call that
/// triggered it; none of them stop the sidecar.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or missing invocation parameters.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
        /// HTTP status to reply with.
        status: u16,
    },

    /// The application process exited before it became reachable.
    #[error("application process is not running")]
    ReadinessFailure {
        /// Exit code reported by the supervisor.
        exit_code: i32,
    },

    /// The application process could not be launched.
    #[error("application process is not running")]
    Spawn {
        /// Launch failure detail, logged but not replied.
        message: String,
    },

    /// The application did not answer the liveness probe in time.
    #[error("application did not become ready within {}ms", .0.as_millis())]
    ReadinessTimeout(Duration),

    /// The bundled archive could not be decoded or unpacked.
    #[error("Extraction error: {message}")]
    Extraction {
        /// Error message.
        message: String,
    },

    /// The outbound call to the application failed.
    #[error("Upstream error: {message}")]
    Upstream {
        /// Error message.
        message: String,
    },

    /// Invocation payload exceeded the configured limit.
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Server startup error.
    #[error("Server error: {message}")]
    Server {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            status: 400,
        }
    }

    /// Create a configuration error rejected with `403 Forbidden`.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            status: 403,
        }
    }

    /// Create a configuration error rejected with `503 Service Unavailable`.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            status: 503,
        }
    }

    /// Create a spawn error.
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Create an extraction error.
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction {
            message: message.into(),
        }
    }

    /// Create an upstream error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error.
    #[allow(clippy::match_same_arms)]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config { status, .. } => *status,
            Self::ReadinessFailure { .. } => 502,
            Self::Spawn { .. } => 502,
            Self::ReadinessTimeout(_) => 502,
            Self::Extraction { .. } => 502,
            Self::Upstream { .. } => 502,
            Self::PayloadTooLarge { .. } => 413,
            Self::Server { .. } => 500,
            Self::Io(_) => 500,
            Self::Json(_) => 400,
        }
    }

    /// Get the error category for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::ReadinessFailure { .. } => "readiness",
            Self::Spawn { .. } => "spawn",
            Self::ReadinessTimeout(_) => "readiness_timeout",
            Self::Extraction { .. } => "extraction",
            Self::Upstream { .. } => "upstream",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Server { .. } => "server",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream(err.to_string())
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Body of a fatal reply, in the shape the invocation protocol expects.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl From<&ProxyError> for ErrorResponse {
    fn from(err: &ProxyError) -> Self {
        Self::new(err.to_string())
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = ProxyError::config("missing __ow_method");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "config");

        let err = ProxyError::forbidden("already initialized");
        assert_eq!(err.status_code(), 403);

        let err = ProxyError::unavailable("still initializing");
        assert_eq!(err.status_code(), 503);
        assert_eq!(err.category(), "config");

        let err = ProxyError::upstream("connection refused");
        assert_eq!(err.status_code(), 502);

        let err = ProxyError::extraction("bad archive");
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.category(), "extraction");
    }

    #[test]
    fn test_process_failures_share_message() {
        let exited = ProxyError::ReadinessFailure { exit_code: 1 };
        let spawn = ProxyError::spawn("No such file or directory");

        assert_eq!(exited.to_string(), PROCESS_NOT_RUNNING);
        assert_eq!(spawn.to_string(), PROCESS_NOT_RUNNING);
    }

    #[test]
    fn test_timeout_display() {
        let err = ProxyError::ReadinessTimeout(Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "application did not become ready within 1500ms"
        );
    }

    #[test]
    fn test_error_response() {
        let err = ProxyError::ReadinessFailure { exit_code: 1 };
        let resp = ErrorResponse::from(&err);

        assert_eq!(resp.error, PROCESS_NOT_RUNNING);
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            serde_json::json!({"error": PROCESS_NOT_RUNNING})
        );
    }
}
