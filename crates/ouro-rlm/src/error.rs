//! Error types for the RLM runtime.

use thiserror::Error;

/// Result type alias for RLM operations.
pub type Result<T> = std::result::Result<T, RlmError>;

/// Errors that can occur in the RLM runtime.
///
/// Errors raised *inside* executed code never surface through this type:
/// the environment captures them into `ReplResult::stderr`. Everything
/// else propagates, runs scope teardown, and re-raises to the caller.
#[derive(Debug, Error)]
pub enum RlmError {
    /// Invalid backend/environment id or missing credentials.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The environment's `setup_code` failed. Fatal for the completion.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Malformed frame on the handler socket or the session pipe.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Per-call or wall-clock deadline exceeded.
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    /// Sandbox broker unreachable past the grace period.
    #[error("Sandbox unreachable: {0}")]
    SandboxUnreachable(String),

    /// Failure driving the execution environment itself (not code inside it).
    #[error("Execution error: {0}")]
    Execution(String),

    /// External cancellation; teardown has run.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Error from the LM backend.
    #[error("Backend error: {0}")]
    Backend(String),

    /// HTTP/network transport error.
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for RlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RlmError::Timeout(e.to_string())
        } else {
            RlmError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for RlmError {
    fn from(e: serde_json::Error) -> Self {
        RlmError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for RlmError {
    fn from(e: std::io::Error) -> Self {
        RlmError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RlmError::Backend("connection refused".to_string());
        assert_eq!(err.to_string(), "Backend error: connection refused");

        let err = RlmError::Config("unknown backend 'x'".to_string());
        assert!(err.to_string().contains("unknown backend"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let bad = serde_json::from_str::<serde_json::Value>("{");
        let err: RlmError = bad.unwrap_err().into();
        assert!(matches!(err, RlmError::Serialization(_)));
    }
}
