//! Error types for the RA engine

use crate::backend::BackendKind;

/// Main error type for RA operations
#[derive(Debug, thiserror::Error)]
pub enum RaError {
    /// Transient fault on one backend connection. Triggers failover, never
    /// surfaces to callers unless the whole pool is exhausted.
    #[error("Connection failure on {kind} backend: {message}")]
    ConnectionFailure { kind: BackendKind, message: String },

    #[error("All {attempts} {kind} connections failed")]
    BackendExhausted { kind: BackendKind, attempts: usize },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    #[error("Key generation failure: {0}")]
    KeyGenFailure(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),
}

impl RaError {
    pub fn connection(kind: BackendKind, message: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            kind,
            message: message.into(),
        }
    }

    /// Whether the fault belongs to one connection and may be retried on the
    /// next pool slot.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. })
    }

    /// Stable tag used in structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailure { .. } => "connection_failure",
            Self::BackendExhausted { .. } => "backend_exhausted",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::CryptoFailure(_) => "crypto_failure",
            Self::KeyGenFailure(_) => "keygen_failure",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Configuration(_) => "configuration",
            Self::InvalidSessionState(_) => "invalid_session_state",
        }
    }
}

// Backend payloads that fail to decode are malformed responses, not link faults.

impl From<hex::FromHexError> for RaError {
    fn from(err: hex::FromHexError) -> Self {
        Self::ProtocolViolation(format!("Malformed hex field: {}", err))
    }
}

impl From<base64::DecodeError> for RaError {
    fn from(err: base64::DecodeError) -> Self {
        Self::ProtocolViolation(format!("Malformed base64 field: {}", err))
    }
}

impl From<serde_urlencoded::de::Error> for RaError {
    fn from(err: serde_urlencoded::de::Error) -> Self {
        Self::ProtocolViolation(format!("Malformed backend response: {}", err))
    }
}

/// Result type alias for RA operations
pub type Result<T> = std::result::Result<T, RaError>;
