//! Centralized error types for voxtrain core data structures.
//!
//! Uses thiserror for ergonomic error handling with context.

use thiserror::Error;

/// Errors raised while loading or validating core configuration files.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    /// Invalid configuration detected during validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O failure with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// JSON parse/serialize failure with path context.
    #[error("JSON error at '{path}': {message}")]
    Json { message: String, path: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Helper for creating I/O errors with path context.
pub fn io_error<P: AsRef<std::path::Path>>(err: std::io::Error, path: P) -> CoreError {
    CoreError::Io {
        message: err.to_string(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating JSON errors with path context.
pub fn json_error<P: AsRef<std::path::Path>>(err: serde_json::Error, path: P) -> CoreError {
    CoreError::Json {
        message: err.to_string(),
        path: path.as_ref().display().to_string(),
    }
}
