//! Streaming metric accumulators, best-checkpoint tracking, and the epoch
//! metric sink.
//!
//! The sink feeds an external dashboard; its failures are logged and
//! swallowed so a full disk or unwritable log directory never aborts a
//! multi-day training run.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

/// Streaming mean accumulator, reset at the start of each epoch.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    count: usize,
    sum: f64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one value in and return the current mean.
    pub fn update(&mut self, value: f64) -> f64 {
        self.count += 1;
        self.sum += value;
        self.mean()
    }

    /// Current mean; zero before any value was observed.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Clear state so the next value starts a fresh mean.
    pub fn reset(&mut self) {
        self.count = 0;
        self.sum = 0.0;
    }
}

/// Best-validation-loss record for one fold, owned by the designated writer.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    best_loss: f64,
    path: PathBuf,
}

impl BestCheckpoint {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            best_loss: f64::INFINITY,
            path: path.into(),
        }
    }

    /// Record a validation loss. Returns true iff it is strictly lower than
    /// the best so far, in which case the record is updated and the caller
    /// must write a checkpoint.
    pub fn observe(&mut self, val_loss: f64) -> bool {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            true
        } else {
            false
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Named-scalar sink for external visualization.
pub trait MetricSink {
    /// Record per-epoch scalars. Implementations must not propagate failures.
    fn log_epoch(&mut self, epoch: usize, scalars: &[(&str, f64)]);
}

/// Sink that discards everything; used on non-designated workers.
pub struct NullSink;

impl MetricSink for NullSink {
    fn log_epoch(&mut self, _epoch: usize, _scalars: &[(&str, f64)]) {}
}

/// JSON-lines sink, one record per epoch.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    /// Open (or create) the sink file, creating parent directories.
    /// A sink that fails to open logs the problem and discards records.
    pub fn create<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let writer = (|| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok::<_, std::io::Error>(BufWriter::new(File::create(&path)?))
        })();
        let writer = match writer {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "metric sink unavailable");
                None
            }
        };
        Self { path, writer }
    }
}

impl MetricSink for JsonlSink {
    fn log_epoch(&mut self, epoch: usize, scalars: &[(&str, f64)]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let mut record = serde_json::Map::new();
        record.insert("epoch".into(), serde_json::json!(epoch));
        for &(name, value) in scalars {
            record.insert(name.into(), serde_json::json!(value));
        }
        let line = serde_json::Value::Object(record).to_string();
        let result = writeln!(writer, "{}", line).and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "metric sink write failed; disabling sink");
            self.writer = None;
        }
    }
}
