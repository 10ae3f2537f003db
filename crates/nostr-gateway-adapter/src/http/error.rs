/*
[INPUT]:  Error sources (HTTP, signer backends, relays, crypto, storage)
[OUTPUT]: Structured error types with context and retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or improving error messages
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Main error type for the gateway adapter
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// The active backend (or the absence of one) cannot perform the operation
    #[error("Signing capability unavailable for {operation}")]
    CapabilityUnavailable { operation: String },

    /// The signer refused the operation
    #[error("Signer refused {operation}: {reason}")]
    PermissionDenied { operation: String, reason: String },

    /// Event or key failed verification
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Remote signer never answered the connection request
    #[error("Remote signer did not respond within {seconds}s, start a new connection request")]
    HandshakeTimeout { seconds: u64 },

    /// Relay publish/fetch failure
    #[error("Network or relay failure: {0}")]
    NetworkOrRelay(String),

    /// Session TTL elapsed or the server rejected the session
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// nostrconnect:// or bunker:// string could not be parsed
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Key material, encryption or decoding failure
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Session storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Invalid response from server or signer
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proof set rejected before anything was published
    #[error("Invalid proof set: {0}")]
    InvalidProof(String),

    /// Request timeout
    #[error("Operation timed out after {duration}s")]
    Timeout { duration: u64 },

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Http(_)
                | GatewayError::Timeout { .. }
                | GatewayError::NetworkOrRelay(_)
                | GatewayError::InvalidResponse(_)
        )
    }

    /// Get retry delay in seconds (if retryable)
    pub fn retry_delay(&self) -> Option<u64> {
        match self {
            GatewayError::Timeout { .. } => Some(1),
            GatewayError::NetworkOrRelay(_) => Some(2),
            _ => None,
        }
    }

    /// Check if error indicates the user has to log in again
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            GatewayError::SessionExpired
                | GatewayError::HandshakeTimeout { .. }
                | GatewayError::Api { code: 401, .. }
        )
    }

    /// Create an API error from status code and message
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        GatewayError::Api {
            code: status.as_u16() as i32,
            message: message.into(),
        }
    }

    pub fn capability(operation: impl Into<String>) -> Self {
        GatewayError::CapabilityUnavailable {
            operation: operation.into(),
        }
    }

    pub fn denied(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::PermissionDenied {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::NetworkOrRelay(err.to_string())
    }
}

impl From<tempfile::PersistError> for GatewayError {
    fn from(err: tempfile::PersistError) -> Self {
        GatewayError::Storage(err.error)
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
