//! Error types for Eidetic

use thiserror::Error;

/// Main error type for Eidetic operations
#[derive(Error, Debug)]
pub enum EideticError {
    /// Missing or invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An optional backend (vector index, embedding provider, cache, ...) is unreachable
    #[error("Backend unavailable: {backend}: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// A referenced entity or relationship endpoint does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed store/recall input, rejected before any backend call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A bounded wait on one fan-out branch was exceeded
    #[error("Timed out after {millis}ms: {branch}")]
    Timeout { branch: String, millis: u64 },

    /// Storage-related errors (LanceDB, in-process stores)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EideticError {
    pub fn unavailable(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable name, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::Storage(_) => "storage",
            Self::Embedding(_) => "embedding",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for EideticError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for Eidetic operations
pub type Result<T> = std::result::Result<T, EideticError>;
