//! Dataset descriptions and model architecture descriptors.
//!
//! Both structures are read once at startup, validated, and never mutated
//! during training. The model descriptor is also persisted alongside
//! checkpoints so inference can rebuild the same architecture.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_error, json_error, CoreError, Result};

/// Description of a segmentation dataset: one entry per input channel and
/// one entry per output class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescription {
    /// Dataset name, used for logging only.
    pub name: String,
    /// Input channel names (e.g. imaging modalities).
    pub images: Vec<String>,
    /// Output class labels, background included.
    pub labels: Vec<i64>,
}

impl DatasetDescription {
    /// Number of input channels.
    pub fn n_channels(&self) -> usize {
        self.images.len()
    }

    /// Number of output classes.
    pub fn n_classes(&self) -> usize {
        self.labels.len()
    }

    /// Validate the description.
    pub fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(CoreError::InvalidConfig(
                "dataset must declare at least one input channel".into(),
            ));
        }
        if self.labels.len() < 2 {
            return Err(CoreError::InvalidConfig(
                "dataset must declare at least two classes (background + foreground)".into(),
            ));
        }
        Ok(())
    }

    /// Load a dataset description from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(&path).map_err(|e| io_error(e, &path))?;
        let desc: Self = serde_json::from_str(&raw).map_err(|e| json_error(e, &path))?;
        desc.validate()?;
        Ok(desc)
    }
}

/// Model architecture descriptor.
///
/// Captures everything needed to rebuild the network: architecture name,
/// channel/class counts, supervision-head layout, and the patch geometry the
/// model was trained at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Architecture name resolved by the model factory.
    pub model_name: String,
    /// Number of input channels.
    pub n_channels: usize,
    /// Number of output classes.
    pub n_classes: usize,
    /// Whether auxiliary deep-supervision heads are attached.
    pub deep_supervision: bool,
    /// Number of auxiliary deep-supervision heads.
    pub deep_supervision_heads: usize,
    /// Use the reduced-width ("pocket") variant.
    pub pocket: bool,
    /// Training patch size (depth, height, width).
    pub patch_size: [usize; 3],
    /// Target voxel spacing in millimeters.
    pub target_spacing: [f64; 3],
    /// Whether the network carries a VAE regularization branch.
    pub vae_reg: bool,
    /// Use residual blocks instead of plain convolutions.
    pub use_res_block: bool,
}

impl ModelSpec {
    /// Validate descriptor values.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.is_empty() {
            return Err(CoreError::InvalidConfig("model_name must be set".into()));
        }
        if self.n_channels == 0 {
            return Err(CoreError::InvalidConfig("n_channels must be > 0".into()));
        }
        if self.n_classes < 2 {
            return Err(CoreError::InvalidConfig("n_classes must be >= 2".into()));
        }
        if self.patch_size.iter().any(|&d| d == 0) {
            return Err(CoreError::InvalidConfig(format!(
                "patch_size dimensions must be > 0, got {:?}",
                self.patch_size
            )));
        }
        if self.deep_supervision && self.deep_supervision_heads == 0 {
            return Err(CoreError::InvalidConfig(
                "deep_supervision enabled with zero supervision heads".into(),
            ));
        }
        Ok(())
    }

    /// Load a model descriptor from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(&path).map_err(|e| io_error(e, &path))?;
        let spec: Self = serde_json::from_str(&raw).map_err(|e| json_error(e, &path))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Save the descriptor to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| json_error(e, &path))?;
        std::fs::write(&path, json).map_err(|e| io_error(e, &path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            model_name: "pointwise".into(),
            n_channels: 2,
            n_classes: 3,
            deep_supervision: true,
            deep_supervision_heads: 2,
            pocket: false,
            patch_size: [32, 32, 32],
            target_spacing: [1.0, 1.0, 1.0],
            vae_reg: false,
            use_res_block: true,
        }
    }

    #[test]
    fn test_model_spec_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_spec.json");

        let original = spec();
        original.save(&path).unwrap();
        let loaded = ModelSpec::load(&path).unwrap();

        assert_eq!(loaded.model_name, original.model_name);
        assert_eq!(loaded.n_classes, original.n_classes);
        assert_eq!(loaded.patch_size, original.patch_size);
        assert_eq!(loaded.deep_supervision_heads, original.deep_supervision_heads);
    }

    #[test]
    fn test_model_spec_rejects_zero_patch() {
        let mut bad = spec();
        bad.patch_size = [32, 0, 32];
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_model_spec_rejects_headless_deep_supervision() {
        let mut bad = spec();
        bad.deep_supervision_heads = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_dataset_description_counts() {
        let desc = DatasetDescription {
            name: "demo".into(),
            images: vec!["ct".into(), "pet".into()],
            labels: vec![0, 1, 2],
        };
        desc.validate().unwrap();
        assert_eq!(desc.n_channels(), 2);
        assert_eq!(desc.n_classes(), 3);
    }

    #[test]
    fn test_dataset_description_rejects_single_class() {
        let desc = DatasetDescription {
            name: "demo".into(),
            images: vec!["ct".into()],
            labels: vec![0],
        };
        assert!(desc.validate().is_err());
    }
}
