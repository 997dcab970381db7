//! Run configuration for distributed multi-fold training.
//!
//! The configuration is read once at startup, validated before any compute
//! step, and never mutated during training. Validation rejects combinations
//! that would otherwise fail mid-epoch, like boundary-based losses without
//! distance-transform maps.

use serde::{Deserialize, Serialize};
use voxtrain_core::{DatasetDescription, ModelSpec};

use crate::error::{config_error, TrainResult};

fn default_epochs() -> usize {
    1000
}

fn default_batch_size() -> usize {
    2
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_val_fraction() -> f64 {
    0.1
}

fn default_oversampling() -> f64 {
    0.4
}

fn default_folds() -> Vec<usize> {
    vec![0, 1, 2, 3, 4]
}

fn default_seed() -> u64 {
    42
}

fn default_val_overlap() -> f64 {
    0.5
}

fn default_schedule_constant() -> f64 {
    0.5
}

fn default_step_length() -> usize {
    5
}

fn default_master_addr() -> String {
    "127.0.0.1".into()
}

fn default_master_port() -> u16 {
    29500
}

fn default_model_name() -> String {
    "pointwise".into()
}

fn default_patch_size() -> [usize; 3] {
    [64, 64, 64]
}

fn default_target_spacing() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn default_deep_supervision_heads() -> usize {
    2
}

/// Loss function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Soft Dice loss.
    #[serde(rename = "dice")]
    Dice,
    /// Soft Dice combined with cross entropy.
    #[serde(rename = "dice_ce")]
    DiceCe,
    /// Boundary loss blended against Dice + cross entropy by alpha.
    #[serde(rename = "bl")]
    Boundary,
    /// One-sided Hausdorff loss blended against Dice + cross entropy.
    #[serde(rename = "hdl")]
    Hausdorff,
    /// Generalized surface loss blended against Dice + cross entropy.
    #[serde(rename = "gsl")]
    GenSurf,
}

impl LossKind {
    /// Boundary-family losses need per-voxel distance-transform maps.
    pub fn requires_distance_maps(self) -> bool {
        matches!(self, LossKind::Boundary | LossKind::Hausdorff | LossKind::GenSurf)
    }

    /// Whether the loss consumes the schedule-controlled alpha weight.
    pub fn uses_alpha(self) -> bool {
        self.requires_distance_maps()
    }
}

/// Optimizer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Learning-rate schedule selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleKind {
    Constant,
    Polynomial,
    Cosine,
}

/// Boundary-loss weighting schedule selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryScheduleKind {
    Constant,
    Linear,
    Step,
}

/// Immutable training parameters for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of training epochs per fold.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Global batch size, divided evenly across workers.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Training steps per epoch; derived from the train-set size when absent.
    #[serde(default)]
    pub steps_per_epoch: Option<usize>,
    /// Loss function for the primary training term.
    pub loss: LossKind,
    /// Optimizer kind.
    pub optimizer: OptimizerKind,
    /// Learning-rate schedule kind.
    pub lr_schedule: LrScheduleKind,
    /// Base learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Enable mixed-precision training with dynamic loss scaling.
    #[serde(default)]
    pub amp: bool,
    /// Maximum gradient norm; no clipping when absent.
    #[serde(default)]
    pub clip_norm: Option<f64>,
    /// Whether distance-transform maps are available in the dataset.
    #[serde(default)]
    pub use_dtms: bool,
    /// Boundary-loss weighting schedule.
    #[serde(default = "BoundaryScheduleKind::default")]
    pub boundary_schedule: BoundaryScheduleKind,
    /// Target alpha value the schedule ramps toward.
    #[serde(default = "default_schedule_constant")]
    pub schedule_constant: f64,
    /// Epochs to hold alpha at zero before the linear ramp starts.
    #[serde(default)]
    pub linear_pause: usize,
    /// Epoch interval between jumps of the step schedule.
    #[serde(default = "default_step_length")]
    pub step_length: usize,
    /// Enable VAE regularization.
    #[serde(default)]
    pub vae_reg: bool,
    /// Scaling factor for the VAE regularization term.
    #[serde(default)]
    pub vae_penalty: f64,
    /// Enable L2 parameter-norm regularization.
    #[serde(default)]
    pub l2_reg: bool,
    /// Scaling factor for the L2 term.
    #[serde(default)]
    pub l2_penalty: f64,
    /// Enable L1 parameter-norm regularization.
    #[serde(default)]
    pub l1_reg: bool,
    /// Scaling factor for the L1 term.
    #[serde(default)]
    pub l1_penalty: f64,
    /// Foreground patch oversampling ratio for the training loader.
    #[serde(default = "default_oversampling")]
    pub oversampling: f64,
    /// Fraction of each fold's training ids held out for validation.
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,
    /// Folds to train.
    #[serde(default = "default_folds")]
    pub folds: Vec<usize>,
    /// Random seed for splits and data sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Sliding-window overlap fraction for validation inference.
    #[serde(default = "default_val_overlap")]
    pub val_overlap: f64,
    /// Address the process group rendezvous binds to.
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    /// Port the process group rendezvous binds to.
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    /// Architecture name resolved by the model factory.
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Training patch size (depth, height, width).
    #[serde(default = "default_patch_size")]
    pub patch_size: [usize; 3],
    /// Target voxel spacing in millimeters.
    #[serde(default = "default_target_spacing")]
    pub target_spacing: [f64; 3],
    /// Attach auxiliary deep-supervision heads.
    #[serde(default)]
    pub deep_supervision: bool,
    /// Number of deep-supervision heads.
    #[serde(default = "default_deep_supervision_heads")]
    pub deep_supervision_heads: usize,
    /// Use the reduced-width ("pocket") architecture variant.
    #[serde(default)]
    pub pocket: bool,
    /// Use residual blocks.
    #[serde(default)]
    pub use_res_block: bool,
}

impl Default for BoundaryScheduleKind {
    fn default() -> Self {
        BoundaryScheduleKind::Constant
    }
}

impl RunConfig {
    /// Validate the configuration. Every rejected combination here would
    /// otherwise surface mid-training, after accelerator resources were
    /// already allocated.
    pub fn validate(&self) -> TrainResult<()> {
        if self.epochs == 0 {
            return Err(config_error("epochs must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(config_error("batch_size must be > 0"));
        }
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return Err(config_error(format!(
                "val_fraction must be in (0, 1), got {}",
                self.val_fraction
            )));
        }
        if self.folds.is_empty() {
            return Err(config_error("at least one fold must be selected"));
        }
        if self.loss.requires_distance_maps() && !self.use_dtms {
            return Err(config_error(format!(
                "loss {:?} requires distance-transform maps; enable use_dtms \
                 and provide a dtm path for every training example",
                self.loss
            )));
        }
        if !(0.0..=1.0).contains(&self.schedule_constant) {
            return Err(config_error(format!(
                "schedule_constant must be in [0, 1], got {}",
                self.schedule_constant
            )));
        }
        if self.step_length == 0 {
            return Err(config_error("step_length must be > 0"));
        }
        if let Some(max_norm) = self.clip_norm {
            if max_norm <= 0.0 {
                return Err(config_error(format!(
                    "clip_norm must be > 0, got {}",
                    max_norm
                )));
            }
        }
        if !(0.0..1.0).contains(&self.val_overlap) {
            return Err(config_error(format!(
                "val_overlap must be in [0, 1), got {}",
                self.val_overlap
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(config_error("learning_rate must be > 0"));
        }
        if self.vae_penalty < 0.0 || self.l1_penalty < 0.0 || self.l2_penalty < 0.0 {
            return Err(config_error("regularization penalties must be >= 0"));
        }
        if self.deep_supervision && self.deep_supervision_heads == 0 {
            return Err(config_error(
                "deep_supervision enabled with zero supervision heads",
            ));
        }
        Ok(())
    }

    /// Build the model architecture descriptor for this run, pulling channel
    /// and class counts from the dataset description.
    pub fn model_spec(&self, dataset: &DatasetDescription) -> ModelSpec {
        ModelSpec {
            model_name: self.model.clone(),
            n_channels: dataset.n_channels(),
            n_classes: dataset.n_classes(),
            deep_supervision: self.deep_supervision,
            deep_supervision_heads: self.deep_supervision_heads,
            pocket: self.pocket,
            patch_size: self.patch_size,
            target_spacing: self.target_spacing,
            vae_reg: self.vae_reg,
            use_res_block: self.use_res_block,
        }
    }

    /// Load a run configuration from a JSON file and validate it.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> TrainResult<Self> {
        use crate::error::IoResultExt;
        let raw = std::fs::read_to_string(&path).with_path(&path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            config_error(format!(
                "failed to parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Small configuration used by tests and smoke runs.
    pub fn smoke_test() -> Self {
        Self {
            epochs: 1,
            batch_size: 2,
            steps_per_epoch: Some(2),
            loss: LossKind::DiceCe,
            optimizer: OptimizerKind::Adam,
            lr_schedule: LrScheduleKind::Constant,
            learning_rate: 1e-3,
            amp: false,
            clip_norm: None,
            use_dtms: false,
            boundary_schedule: BoundaryScheduleKind::Constant,
            schedule_constant: 0.5,
            linear_pause: 0,
            step_length: default_step_length(),
            vae_reg: false,
            vae_penalty: 0.0,
            l2_reg: false,
            l2_penalty: 0.0,
            l1_reg: false,
            l1_penalty: 0.0,
            oversampling: default_oversampling(),
            val_fraction: 0.2,
            folds: vec![0],
            seed: default_seed(),
            val_overlap: 0.25,
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            model: default_model_name(),
            patch_size: [8, 8, 8],
            target_spacing: default_target_spacing(),
            deep_supervision: false,
            deep_supervision_heads: 0,
            pocket: false,
            use_res_block: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke_config_validates() {
        RunConfig::smoke_test().validate().unwrap();
    }

    #[test]
    fn test_boundary_loss_requires_dtms() {
        let mut cfg = RunConfig::smoke_test();
        cfg.loss = LossKind::Boundary;
        cfg.use_dtms = false;
        let err = cfg.validate().unwrap_err();
        assert!(err.is_setup_error());
        assert!(err.to_string().contains("distance-transform"));

        cfg.use_dtms = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_loss_kind_serde_names() {
        let kind: LossKind = serde_json::from_str("\"bl\"").unwrap();
        assert_eq!(kind, LossKind::Boundary);
        assert!(kind.requires_distance_maps());

        let kind: LossKind = serde_json::from_str("\"dice_ce\"").unwrap();
        assert_eq!(kind, LossKind::DiceCe);
        assert!(!kind.requires_distance_maps());
    }

    #[test]
    fn test_val_fraction_bounds() {
        let mut cfg = RunConfig::smoke_test();
        cfg.val_fraction = 0.0;
        assert!(cfg.validate().is_err());
        cfg.val_fraction = 1.0;
        assert!(cfg.validate().is_err());
        cfg.val_fraction = 0.2;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_schedule_constant_bounds() {
        let mut cfg = RunConfig::smoke_test();
        cfg.schedule_constant = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_model_spec_from_config() {
        let cfg = RunConfig::smoke_test();
        let dataset = DatasetDescription {
            name: "demo".into(),
            images: vec!["ct".into()],
            labels: vec![0, 1],
        };
        let spec = cfg.model_spec(&dataset);
        assert_eq!(spec.n_channels, 1);
        assert_eq!(spec.n_classes, 2);
        assert_eq!(spec.patch_size, cfg.patch_size);
    }
}
