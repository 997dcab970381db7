//! Model-side interface for the training loop.
//!
//! Architecture construction is an external collaborator: the loop only
//! depends on `SegModel::forward` producing a prediction plus the optional
//! deep-supervision and VAE outputs, and on a factory that resolves an
//! architecture name to a model. A per-voxel linear classifier is included
//! for pipeline validation, the same way a synthetic dataset stands in for
//! the real loader.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use voxtrain_core::ModelSpec;

use crate::error::{config_error, TrainResult};

/// Output of the VAE regularization branch.
pub struct VaeOutput {
    /// Reconstruction of the input image.
    pub reconstruction: Tensor,
    /// Latent mean.
    pub mu: Tensor,
    /// Latent log-variance.
    pub log_var: Tensor,
}

/// Everything a forward pass produces.
pub struct ModelOutput {
    /// Primary prediction logits `[batch, classes, d, h, w]`.
    pub prediction: Tensor,
    /// Auxiliary predictions, ordered from closest to farthest from the
    /// output. Present only while training with deep supervision.
    pub deep_supervision: Option<Vec<Tensor>>,
    /// VAE regularization output, when the branch is attached.
    pub vae_reg: Option<VaeOutput>,
}

/// Narrow interface the training loop holds on a segmentation network.
pub trait SegModel: Send {
    /// Forward pass on `[batch, channels, d, h, w]` input.
    fn forward(&self, image: &Tensor) -> Result<ModelOutput>;

    /// Whether the forward pass tolerates reduced-precision inputs.
    fn reduced_precision_ok(&self) -> bool {
        false
    }

    /// Convert normalization layers to cross-process-synchronized variants.
    /// Invoked once before the model is wrapped for distributed training;
    /// architectures without batch statistics ignore it.
    fn convert_norms_for_group(&mut self, _world_size: usize) {}
}

impl std::fmt::Debug for dyn SegModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegModel").finish_non_exhaustive()
    }
}

/// Per-voxel linear classifier: a 1×1×1 convolution over channels, with
/// optional auxiliary heads and a VAE branch. Exercises every output path
/// of the trait at negligible cost.
pub struct PointwiseSegModel {
    weight: Tensor,
    bias: Tensor,
    ds_heads: Vec<(Tensor, Tensor)>,
    vae: Option<VaeParams>,
    n_classes: usize,
}

struct VaeParams {
    recon_weight: Tensor,
    mu_weight: Tensor,
    log_var_weight: Tensor,
}

impl PointwiseSegModel {
    pub fn new(spec: &ModelSpec, vb: VarBuilder) -> Result<Self> {
        let c = spec.n_channels;
        let k = spec.n_classes;

        let weight = vb.get_with_hints(
            (c, k),
            "head.weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(k, "head.bias", candle_nn::Init::Const(0.0))?;

        let mut ds_heads = Vec::new();
        if spec.deep_supervision {
            for i in 0..spec.deep_supervision_heads {
                let w = vb.get_with_hints(
                    (c, k),
                    &format!("ds.{}.weight", i),
                    candle_nn::init::DEFAULT_KAIMING_NORMAL,
                )?;
                let b = vb.get_with_hints(k, &format!("ds.{}.bias", i), candle_nn::Init::Const(0.0))?;
                ds_heads.push((w, b));
            }
        }

        let vae = if spec.vae_reg {
            Some(VaeParams {
                recon_weight: vb.get_with_hints(
                    (c, c),
                    "vae.recon.weight",
                    candle_nn::init::DEFAULT_KAIMING_NORMAL,
                )?,
                mu_weight: vb.get_with_hints(
                    (c, c),
                    "vae.mu.weight",
                    candle_nn::init::DEFAULT_KAIMING_NORMAL,
                )?,
                log_var_weight: vb.get_with_hints(
                    (c, c),
                    "vae.log_var.weight",
                    candle_nn::Init::Const(0.0),
                )?,
            })
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            ds_heads,
            vae,
            n_classes: k,
        })
    }

    /// Apply one `[channels, classes]` head to `[b, c, d, h, w]` input,
    /// producing `[b, classes, d, h, w]` logits.
    fn apply_head(image: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, c, d, h, w) = image.dims5()?;
        let k = weight.dim(1)?;
        let flat = image.reshape((b, c, d * h * w))?.transpose(1, 2)?; // [b, n, c]
        let logits = flat.broadcast_matmul(weight)?; // [b, n, k]
        let logits = logits.broadcast_add(bias)?;
        logits.transpose(1, 2)?.reshape((b, k, d, h, w))
    }
}

impl SegModel for PointwiseSegModel {
    fn forward(&self, image: &Tensor) -> Result<ModelOutput> {
        let image = image.to_dtype(candle_core::DType::F32)?;
        let prediction = Self::apply_head(&image, &self.weight, &self.bias)?;
        debug_assert_eq!(prediction.dim(1)?, self.n_classes);

        let deep_supervision = if self.ds_heads.is_empty() {
            None
        } else {
            let mut heads = Vec::with_capacity(self.ds_heads.len());
            for (w, b) in &self.ds_heads {
                heads.push(Self::apply_head(&image, w, b)?);
            }
            Some(heads)
        };

        let vae_reg = match &self.vae {
            None => None,
            Some(params) => {
                let (b, c, d, h, w) = image.dims5()?;
                let flat = image.reshape((b, c, d * h * w))?.transpose(1, 2)?;
                let recon = flat
                    .broadcast_matmul(&params.recon_weight)?
                    .transpose(1, 2)?
                    .reshape((b, c, d, h, w))?;
                // Latent statistics from the spatial mean of each channel.
                let pooled = image.reshape((b, c, d * h * w))?.mean(2)?; // [b, c]
                let mu = pooled.broadcast_matmul(&params.mu_weight)?;
                let log_var = pooled.broadcast_matmul(&params.log_var_weight)?;
                Some(VaeOutput {
                    reconstruction: recon,
                    mu,
                    log_var,
                })
            }
        };

        Ok(ModelOutput {
            prediction,
            deep_supervision,
            vae_reg,
        })
    }

    fn reduced_precision_ok(&self) -> bool {
        false
    }
}

/// Resolve an architecture name to a model.
pub trait ModelFactory: Send + Sync {
    fn build(&self, spec: &ModelSpec, vb: VarBuilder) -> TrainResult<Box<dyn SegModel>>;
}

/// Factory over the architectures registered in this build.
#[derive(Debug, Clone, Default)]
pub struct DefaultModelFactory;

impl ModelFactory for DefaultModelFactory {
    fn build(&self, spec: &ModelSpec, vb: VarBuilder) -> TrainResult<Box<dyn SegModel>> {
        match spec.model_name.as_str() {
            "pointwise" => Ok(Box::new(PointwiseSegModel::new(spec, vb)?)),
            other => Err(config_error(format!(
                "unknown model architecture '{}'",
                other
            ))),
        }
    }
}
