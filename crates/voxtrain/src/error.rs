//! Custom error types for voxtrain training.
//!
//! Provides structured error handling with context. Setup errors (bad
//! configuration, undersized validation sets, group formation failures) are
//! fatal and raised before any compute step; everything else propagates and
//! terminates the worker that hit it.

use thiserror::Error;

/// Main error type for training operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainError {
    /// Errors from the Candle tensor library.
    #[error("Candle error: {0}")]
    Candle(String),

    /// Configuration validation failures (inconsistent or missing settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The validation subset is smaller than the worker count, so at least
    /// one worker would have no validation example to process.
    #[error(
        "Validation set has {val_size} example(s) but {world_size} worker(s); \
         each worker needs at least one validation example"
    )]
    InsufficientValidationSet { val_size: usize, world_size: usize },

    /// Communication-group formation failed within the bounded wait.
    #[error("Process group join failed for rank {rank}/{world_size}: {message}")]
    GroupJoin {
        rank: usize,
        world_size: usize,
        message: String,
    },

    /// A collective operation failed mid-run.
    #[error("Collective operation failed (peer rank {peer}): {message}")]
    Collective { peer: usize, message: String },

    /// Checkpoint save/load failures.
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Data loading failures.
    #[error("Data loading error: {0}")]
    DataLoading(String),

    /// I/O errors with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },
}

/// Result type alias for training operations.
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Whether this error belongs to the setup phase: raised before any
    /// accelerator resources are allocated for the fold.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            TrainError::Config(_)
                | TrainError::InsufficientValidationSet { .. }
                | TrainError::GroupJoin { .. }
        )
    }

    /// Get the path associated with this error (if any).
    pub fn path(&self) -> Option<&str> {
        match self {
            TrainError::Checkpoint { path, .. } => Some(path),
            TrainError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<voxtrain_core::CoreError> for TrainError {
    fn from(err: voxtrain_core::CoreError) -> Self {
        TrainError::Config(err.to_string())
    }
}

/// Helper trait for adding path context to IO operations.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating configuration errors.
pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}

/// Helper for creating checkpoint errors.
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_classification() {
        assert!(config_error("boundary loss without distance maps").is_setup_error());
        assert!(TrainError::InsufficientValidationSet {
            val_size: 1,
            world_size: 2,
        }
        .is_setup_error());
        assert!(TrainError::GroupJoin {
            rank: 1,
            world_size: 4,
            message: "timed out".into(),
        }
        .is_setup_error());
        assert!(!TrainError::DataLoading("stream exhausted".into()).is_setup_error());
    }

    #[test]
    fn test_insufficient_validation_set_message() {
        let err = TrainError::InsufficientValidationSet {
            val_size: 3,
            world_size: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains('3') && msg.contains('4'), "message was: {}", msg);
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let train_result: TrainResult<()> = result.with_path("/tmp/missing.json");

        match train_result {
            Err(TrainError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.json"),
            _ => panic!("Expected IO error with path"),
        }
    }

    #[test]
    fn test_path_extraction() {
        let err = checkpoint_error("failed", "/tmp/fold_0");
        assert_eq!(err.path(), Some("/tmp/fold_0"));
        assert_eq!(config_error("bad").path(), None);
    }
}
