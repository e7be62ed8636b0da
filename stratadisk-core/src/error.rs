//! Error types for StrataDisk

use thiserror::Error;

/// Result type alias for StrataDisk operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// StrataDisk error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid on-disk layer format (bad magic, truncated file, bad index)
    #[error("Format error: {0}")]
    Format(String),

    /// Operation invalid in the current state
    #[error("Invalid state: {0}")]
    State(String),

    /// Operation not supported by this file kind
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Cache full after forced eviction
    #[error("Cache exhausted: {0}")]
    Exhausted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Io(_))
    }

    /// Check if error indicates a corrupt layer file
    pub fn is_format(&self) -> bool {
        matches!(self, StrataError::Format(_))
    }
}
