//! Per-fold checkpoint save/load.
//!
//! A checkpoint directory holds the full parameter state plus the metadata
//! needed to rebuild and score the model:
//!   - `<dir>/model.safetensors`: model weights
//!   - `<dir>/meta.json`: fold, epoch, validation loss, model descriptor
//!
//! Only the designated writer (rank 0) ever writes checkpoints.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use voxtrain_core::ModelSpec;

use crate::error::{checkpoint_error, TrainResult};

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub fold: usize,
    pub epoch: usize,
    pub val_loss: f64,
    pub model: ModelSpec,
}

/// Directory that holds the best checkpoint for one fold.
pub fn fold_checkpoint_dir(results_dir: &Path, fold: usize) -> PathBuf {
    results_dir.join("models").join(format!("fold_{}", fold))
}

/// Save the full model state and metadata.
pub fn save_checkpoint(varmap: &VarMap, meta: &CheckpointMeta, dir: &Path) -> TrainResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| checkpoint_error(e.to_string(), dir))?;

    let weights_path = dir.join("model.safetensors");
    varmap
        .save(&weights_path)
        .map_err(|e| checkpoint_error(e.to_string(), &weights_path))?;

    let meta_path = dir.join("meta.json");
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;
    std::fs::write(&meta_path, json).map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;
    Ok(())
}

/// Load checkpoint weights into an existing VarMap (the model must already
/// be built so its variables are registered) and return the metadata.
pub fn load_checkpoint(varmap: &mut VarMap, dir: &Path) -> TrainResult<CheckpointMeta> {
    let meta_path = dir.join("meta.json");
    let raw = std::fs::read_to_string(&meta_path)
        .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;
    let meta: CheckpointMeta = serde_json::from_str(&raw)
        .map_err(|e| checkpoint_error(e.to_string(), &meta_path))?;

    let weights_path = dir.join("model.safetensors");
    varmap
        .load(&weights_path)
        .map_err(|e| checkpoint_error(e.to_string(), &weights_path))?;
    Ok(meta)
}
