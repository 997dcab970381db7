//! Structured logging for training with tracing.
//!
//! Console status text and epoch metrics are emitted only by the designated
//! writer (rank 0); the other workers run the same compute but stay quiet.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured JSON logging for production monitoring.
///
/// Reads the log level from RUST_LOG (defaults to "info").
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voxtrain=info,voxtrain_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Initialize pretty console logging (for local runs and debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,voxtrain=debug".into()))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Log the start of training.
pub fn log_training_start(world_size: usize, folds: &[usize]) {
    info!(world_size, ?folds, "Starting training");
}

/// Log the start of one fold.
pub fn log_fold_start(fold: usize, n_train: usize, n_val: usize) {
    info!(fold, n_train, n_val, "Starting fold");
}

/// Log a validation improvement and the checkpoint write that follows.
pub fn log_validation_improved(fold: usize, epoch: usize, previous_best: f64, new_best: f64) {
    info!(
        fold,
        epoch,
        previous_best,
        new_best,
        "Validation loss IMPROVED from {:.4} to {:.4}",
        previous_best,
        new_best
    );
}

/// Log a validation epoch that did not improve on the best.
pub fn log_validation_not_improved(fold: usize, epoch: usize, best: f64) {
    info!(
        fold,
        epoch,
        best,
        "Validation loss did NOT improve from {:.4}",
        best
    );
}

/// Log an epoch summary.
pub fn log_epoch_summary(fold: usize, epoch: usize, train_loss: f64, val_loss: f64) {
    info!(
        fold,
        epoch,
        train_loss,
        val_loss,
        event = "epoch_summary",
        "Epoch completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_helpers_do_not_panic() {
        // No subscriber installed: events are dropped, never panic.
        log_training_start(2, &[0, 1]);
        log_fold_start(0, 18, 2);
        log_validation_improved(0, 1, f64::INFINITY, 0.5);
        log_validation_not_improved(0, 2, 0.5);
        log_epoch_summary(0, 2, 1.1, 0.6);
    }
}
