//! Error types for the image service

use thiserror::Error;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Image service error types
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration error (bad document, unknown enum value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON document failed to parse
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Credential lookup failed
    #[error("Auth error: {0}")]
    Auth(String),

    /// Storage engine failure
    #[error(transparent)]
    Core(#[from] stratadisk_core::StrataError),
}
