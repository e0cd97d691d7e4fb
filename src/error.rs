// Error handling module
// Defines the session, dispatcher and storage error taxonomy

use thiserror::Error;

/// Errors surfaced by the session layer
///
/// Clone so a single refresh result can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Login rejected by the server, never retried
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Protected call still unauthorized after one refresh-and-retry cycle
    #[error("Unauthorized")]
    Unauthorized,

    /// Transport-level failure, no response received
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Non-success response that is not an authorization failure
    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Operation removed before it ran, or its result was discarded
    #[error("Cancelled")]
    Cancelled,

    /// Refresh attempt failed; the session has been cleared
    #[error("Refresh exhausted: {0}")]
    RefreshExhausted(String),

    /// Caller passed malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stored or issued token could not be interpreted
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Credential store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unexpected condition
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether the caller may reasonably retry the same call later
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::NetworkError(_) => true,
            SessionError::ServerError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Errors raised by the bounded request dispatcher itself
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Removed from the queue before admission
    #[error("Operation cancelled before admission")]
    Cancelled,

    /// Admitted but terminated without producing a result
    #[error("Operation aborted before completion")]
    Aborted,
}

impl From<DispatchError> for SessionError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Cancelled => SessionError::Cancelled,
            DispatchError::Aborted => SessionError::Internal(err.to_string()),
        }
    }
}

/// Credential store failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backing file could not be read or written
    #[error("Credential store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file content is not valid JSON
    #[error("Credential store is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Storage(err.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SessionError::InvalidCredentials;
        assert_eq!(err.to_string(), "Invalid credentials");

        let err = SessionError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "Server error: 503 - Service unavailable");

        let err = SessionError::RefreshExhausted("no refresh token".to_string());
        assert_eq!(err.to_string(), "Refresh exhausted: no refresh token");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SessionError::NetworkError("timeout".to_string()).is_retryable());
        assert!(SessionError::ServerError {
            status: 502,
            message: String::new()
        }
        .is_retryable());
        assert!(SessionError::ServerError {
            status: 429,
            message: String::new()
        }
        .is_retryable());

        assert!(!SessionError::ServerError {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!SessionError::InvalidCredentials.is_retryable());
        assert!(!SessionError::Unauthorized.is_retryable());
        assert!(!SessionError::Cancelled.is_retryable());
    }

    #[test]
    fn test_dispatch_error_conversion() {
        assert_eq!(
            SessionError::from(DispatchError::Cancelled),
            SessionError::Cancelled
        );
        assert!(matches!(
            SessionError::from(DispatchError::Aborted),
            SessionError::Internal(_)
        ));
    }

    #[test]
    fn test_store_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = SessionError::from(StoreError::from(io));
        match err {
            SessionError::Storage(msg) => assert!(msg.contains("denied")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
