//! Loss functions for segmentation training.
//!
//! Every loss goes through one call shape, `evaluate(label, prediction,
//! ctx)`, where the context carries the optional distance-transform map and
//! alpha weight. Region losses ignore the context; the boundary family
//! requires both fields and blends against the region term by alpha. The
//! composite engine stacks deep supervision, VAE regularization, and
//! parameter-norm penalties on top of the primary term without ever
//! mutating the label or the model output.

use candle_core::{Result, Tensor, Var};
use candle_nn::ops::softmax;

use crate::config::{LossKind, RunConfig};
use crate::error::TrainResult;
use crate::model::{ModelOutput, VaeOutput};

const SMOOTH: f64 = 1e-6;

/// Optional inputs a loss may require.
#[derive(Default)]
pub struct LossContext<'a> {
    /// Per-voxel distance-transform map `[b, classes, d, h, w]`.
    pub dtm: Option<&'a Tensor>,
    /// Schedule-controlled blend weight in [0, 1].
    pub alpha: Option<f64>,
}

impl<'a> LossContext<'a> {
    pub fn none() -> Self {
        Self::default()
    }
}

/// A segmentation loss: scalar dissimilarity between label and prediction.
pub trait SegLoss: Send + Sync {
    /// Compute the loss. `label` is `[b, d, h, w]` u32 class indices,
    /// `prediction` is `[b, classes, d, h, w]` logits.
    fn evaluate(&self, label: &Tensor, prediction: &Tensor, ctx: &LossContext) -> Result<Tensor>;
}

/// One-hot encode the label to `[b, classes, n]` f32.
fn one_hot_flat(label: &Tensor, n_classes: usize) -> Result<Tensor> {
    let (b, d, h, w) = label.dims4()?;
    let n = d * h * w;
    let rows = label.reshape((b, n))?.to_vec2::<u32>()?;
    let mut data = vec![0f32; b * n_classes * n];
    for (bi, row) in rows.iter().enumerate() {
        for (i, &class) in row.iter().enumerate() {
            let class = (class as usize).min(n_classes - 1);
            data[bi * n_classes * n + class * n + i] = 1.0;
        }
    }
    Tensor::from_vec(data, (b, n_classes, n), label.device())
}

/// Softmax probabilities flattened to `[b, classes, n]`.
fn probabilities_flat(prediction: &Tensor) -> Result<Tensor> {
    let flat = prediction.flatten_from(2)?;
    softmax(&flat, 1)
}

fn ctx_requires<'a>(ctx: &'a LossContext, what: &str) -> Result<(&'a Tensor, f64)> {
    let dtm = ctx.dtm.ok_or_else(|| {
        candle_core::Error::Msg(format!("{} requires a distance-transform map", what))
    })?;
    let alpha = ctx.alpha.ok_or_else(|| {
        candle_core::Error::Msg(format!("{} requires an alpha weight", what))
    })?;
    Ok((dtm, alpha))
}

/// Soft Dice loss over all classes.
#[derive(Debug, Clone, Default)]
pub struct SoftDiceLoss;

impl SoftDiceLoss {
    fn dice(&self, label: &Tensor, prediction: &Tensor) -> Result<Tensor> {
        let n_classes = prediction.dim(1)?;
        let p = probabilities_flat(prediction)?;
        let g = one_hot_flat(label, n_classes)?;
        let intersection = (&p * &g)?.sum(2)?; // [b, k]
        let denom = (p.sum(2)? + g.sum(2)?)?;
        let score = ((intersection * 2.0)?.affine(1.0, SMOOTH))?
            .div(&denom.affine(1.0, SMOOTH)?)?;
        let mean = score.mean_all()?;
        (mean * -1.0)?.affine(1.0, 1.0)
    }
}

impl SegLoss for SoftDiceLoss {
    fn evaluate(&self, label: &Tensor, prediction: &Tensor, _ctx: &LossContext) -> Result<Tensor> {
        self.dice(label, prediction)
    }
}

/// Soft Dice plus voxel-wise cross entropy.
#[derive(Debug, Clone, Default)]
pub struct DiceCeLoss {
    dice: SoftDiceLoss,
}

impl DiceCeLoss {
    pub fn new() -> Self {
        Self::default()
    }

    fn cross_entropy(&self, label: &Tensor, prediction: &Tensor) -> Result<Tensor> {
        let (b, k, d, h, w) = prediction.dims5()?;
        let n = d * h * w;
        let logits = prediction
            .reshape((b, k, n))?
            .transpose(1, 2)?
            .reshape((b * n, k))?;
        let targets = label.reshape(b * n)?;
        candle_nn::loss::cross_entropy(&logits, &targets)
    }
}

impl SegLoss for DiceCeLoss {
    fn evaluate(&self, label: &Tensor, prediction: &Tensor, ctx: &LossContext) -> Result<Tensor> {
        let dice = self.dice.evaluate(label, prediction, ctx)?;
        let ce = self.cross_entropy(label, prediction)?;
        dice + ce
    }
}

/// Boundary loss: distance-weighted probability mass, blended against the
/// region term by alpha: `alpha * region + (1 - alpha) * boundary`.
#[derive(Debug, Clone, Default)]
pub struct BoundaryLoss {
    region: DiceCeLoss,
}

impl SegLoss for BoundaryLoss {
    fn evaluate(&self, label: &Tensor, prediction: &Tensor, ctx: &LossContext) -> Result<Tensor> {
        let (dtm, alpha) = ctx_requires(ctx, "boundary loss")?;
        let region = self.region.evaluate(label, prediction, ctx)?;
        let p = probabilities_flat(prediction)?;
        let boundary = (dtm.flatten_from(2)? * p)?.mean_all()?;
        (region * alpha)? + (boundary * (1.0 - alpha))?
    }
}

/// One-sided Hausdorff loss: squared error weighted by squared distances.
#[derive(Debug, Clone, Default)]
pub struct HausdorffLoss {
    region: DiceCeLoss,
}

impl SegLoss for HausdorffLoss {
    fn evaluate(&self, label: &Tensor, prediction: &Tensor, ctx: &LossContext) -> Result<Tensor> {
        let (dtm, alpha) = ctx_requires(ctx, "Hausdorff loss")?;
        let region = self.region.evaluate(label, prediction, ctx)?;
        let n_classes = prediction.dim(1)?;
        let p = probabilities_flat(prediction)?;
        let g = one_hot_flat(label, n_classes)?;
        let err = (p - g)?.sqr()?;
        let hd = (err * dtm.flatten_from(2)?.sqr()?)?.mean_all()?;
        (region * alpha)? + (hd * (1.0 - alpha))?
    }
}

/// Generalized surface loss: residual surface mass normalized by the total
/// distance mass.
#[derive(Debug, Clone, Default)]
pub struct GenSurfLoss {
    region: DiceCeLoss,
}

impl SegLoss for GenSurfLoss {
    fn evaluate(&self, label: &Tensor, prediction: &Tensor, ctx: &LossContext) -> Result<Tensor> {
        let (dtm, alpha) = ctx_requires(ctx, "generalized surface loss")?;
        let region = self.region.evaluate(label, prediction, ctx)?;
        let n_classes = prediction.dim(1)?;
        let p = probabilities_flat(prediction)?;
        let g = one_hot_flat(label, n_classes)?;
        let dtm_flat = dtm.flatten_from(2)?;
        let residual = ((p + g)? * -1.0)?.affine(1.0, 1.0)?; // 1 - (g + p)
        let num = (&dtm_flat * residual)?.sqr()?.sum_all()?;
        let den = dtm_flat.sqr()?.sum_all()?.affine(1.0, SMOOTH)?;
        let surf = (num.div(&den)? * -1.0)?.affine(1.0, 1.0)?;
        (region * alpha)? + (surf * (1.0 - alpha))?
    }
}

/// VAE regularization: latent KL divergence plus image reconstruction.
#[derive(Debug, Clone, Default)]
pub struct VaeLoss;

impl VaeLoss {
    pub fn evaluate(&self, image: &Tensor, output: &VaeOutput) -> Result<Tensor> {
        // KL(q || N(0, I)) = -0.5 * mean(1 + log_var - mu^2 - exp(log_var))
        let inner = ((output.log_var.affine(1.0, 1.0)? - output.mu.sqr()?)?
            - output.log_var.exp()?)?;
        let kl = (inner.mean_all()? * -0.5)?;
        let recon = (output.reconstruction.clone() - image.clone())?
            .sqr()?
            .mean_all()?;
        kl + recon
    }
}

/// Build the primary loss for the run.
pub fn primary_loss(kind: LossKind) -> Box<dyn SegLoss> {
    match kind {
        LossKind::Dice => Box::new(SoftDiceLoss),
        LossKind::DiceCe => Box::new(DiceCeLoss::new()),
        LossKind::Boundary => Box::new(BoundaryLoss::default()),
        LossKind::Hausdorff => Box::new(HausdorffLoss::default()),
        LossKind::GenSurf => Box::new(GenSurfLoss::default()),
    }
}

/// The active loss handle plus the optional terms that apply this run.
/// Fixed for the run's duration.
pub struct CompositeLoss {
    primary: Box<dyn SegLoss>,
    deep_supervision: bool,
    vae_penalty: Option<f64>,
    vae_loss: VaeLoss,
    l1_penalty: Option<f64>,
    l2_penalty: Option<f64>,
}

impl CompositeLoss {
    /// Assemble the descriptor from a validated run configuration.
    pub fn from_config(config: &RunConfig) -> TrainResult<Self> {
        config.validate()?;
        Ok(Self {
            primary: primary_loss(config.loss),
            deep_supervision: config.deep_supervision,
            vae_penalty: (config.vae_reg && config.vae_penalty > 0.0)
                .then_some(config.vae_penalty),
            vae_loss: VaeLoss,
            l1_penalty: (config.l1_reg && config.l1_penalty > 0.0).then_some(config.l1_penalty),
            l2_penalty: (config.l2_reg && config.l2_penalty > 0.0).then_some(config.l2_penalty),
        })
    }

    /// Descriptor for tests and callers that bypass the config layer.
    pub fn with_primary(primary: Box<dyn SegLoss>, deep_supervision: bool) -> Self {
        Self {
            primary,
            deep_supervision,
            vae_penalty: None,
            vae_loss: VaeLoss,
            l1_penalty: None,
            l2_penalty: None,
        }
    }

    /// Compute the total scalar loss for one batch.
    ///
    /// Term order: primary, deep supervision (head k weighted by
    /// 0.5^(k+1), then the whole sum rescaled by 1/(2 - 2^-(H+1)) so the
    /// effective weight stays 1 for any head count), VAE penalty, parameter
    /// norms. Pure in `label` and `output`.
    pub fn compute(
        &self,
        image: &Tensor,
        label: &Tensor,
        output: &ModelOutput,
        ctx: &LossContext,
        params: &[Var],
    ) -> Result<Tensor> {
        let mut loss = self.primary.evaluate(label, &output.prediction, ctx)?;

        if self.deep_supervision {
            let heads: &[Tensor] = output.deep_supervision.as_deref().unwrap_or(&[]);
            for (k, head) in heads.iter().enumerate() {
                let weight = 0.5f64.powi(k as i32 + 1);
                loss = (loss + (self.primary.evaluate(label, head, ctx)? * weight)?)?;
            }
            let c_norm = 1.0 / (2.0 - 2.0f64.powi(-(heads.len() as i32 + 1)));
            loss = (loss * c_norm)?;
        }

        if let Some(penalty) = self.vae_penalty {
            if let Some(vae) = &output.vae_reg {
                loss = (loss + (self.vae_loss.evaluate(image, vae)? * penalty)?)?;
            }
        }

        if let Some(penalty) = self.l2_penalty {
            let mut total: Option<Tensor> = None;
            for var in params {
                let norm = var.as_tensor().sqr()?.sum_all()?.sqrt()?;
                total = Some(match total {
                    Some(t) => (t + norm)?,
                    None => norm,
                });
            }
            if let Some(total) = total {
                loss = (loss + (total * penalty)?)?;
            }
        }

        if let Some(penalty) = self.l1_penalty {
            let mut total: Option<Tensor> = None;
            for var in params {
                let norm = var.as_tensor().abs()?.sum_all()?;
                total = Some(match total {
                    Some(t) => (t + norm)?,
                    None => norm,
                });
            }
            if let Some(total) = total {
                loss = (loss + (total * penalty)?)?;
            }
        }

        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Logits strongly favoring the given constant class everywhere.
    fn confident_prediction(b: usize, k: usize, spatial: usize, class: usize) -> Tensor {
        let device = Device::Cpu;
        let n = spatial * spatial * spatial;
        let mut data = vec![-10.0f32; b * k * n];
        for bi in 0..b {
            for i in 0..n {
                data[bi * k * n + class * n + i] = 10.0;
            }
        }
        Tensor::from_vec(data, (b, k, spatial, spatial, spatial), &device).unwrap()
    }

    fn constant_label(b: usize, spatial: usize, class: u32) -> Tensor {
        let device = Device::Cpu;
        let n = spatial * spatial * spatial;
        Tensor::from_vec(
            vec![class; b * n],
            (b, spatial, spatial, spatial),
            &device,
        )
        .unwrap()
    }

    /// Loss that always returns a fixed value; used to check the composite
    /// weighting rules independently of any real loss.
    struct ConstLoss(f64);

    impl SegLoss for ConstLoss {
        fn evaluate(&self, _l: &Tensor, p: &Tensor, _ctx: &LossContext) -> Result<Tensor> {
            Tensor::new(self.0 as f32, p.device())
        }
    }

    fn dummy_output(heads: usize) -> ModelOutput {
        let pred = confident_prediction(1, 2, 2, 0);
        let ds = (heads > 0).then(|| (0..heads).map(|_| pred.clone()).collect());
        ModelOutput {
            prediction: pred,
            deep_supervision: ds,
            vae_reg: None,
        }
    }

    #[test]
    fn test_dice_near_zero_for_perfect_prediction() -> Result<()> {
        let label = constant_label(1, 4, 1);
        let pred = confident_prediction(1, 3, 4, 1);
        let loss = SoftDiceLoss
            .evaluate(&label, &pred, &LossContext::none())?
            .to_scalar::<f32>()?;
        // One of three classes matches everywhere; the two absent classes
        // each contribute a vacuous-dice term, so the floor is 2/3 of the
        // per-class mean away from zero only when their denominators are
        // empty. With the smooth term they score ~1, so the loss is small.
        assert!(loss < 0.05, "dice loss too high: {}", loss);
        Ok(())
    }

    #[test]
    fn test_dice_high_for_wrong_prediction() -> Result<()> {
        let label = constant_label(1, 4, 1);
        let pred = confident_prediction(1, 3, 4, 2);
        let loss = SoftDiceLoss
            .evaluate(&label, &pred, &LossContext::none())?
            .to_scalar::<f32>()?;
        assert!(loss > 0.5, "dice loss too low for a miss: {}", loss);
        Ok(())
    }

    #[test]
    fn test_dice_ce_decreases_with_confidence() -> Result<()> {
        let label = constant_label(1, 4, 1);
        let good = confident_prediction(1, 3, 4, 1);
        let bad = confident_prediction(1, 3, 4, 0);
        let loss = DiceCeLoss::new();
        let good_loss = loss
            .evaluate(&label, &good, &LossContext::none())?
            .to_scalar::<f32>()?;
        let bad_loss = loss
            .evaluate(&label, &bad, &LossContext::none())?
            .to_scalar::<f32>()?;
        assert!(good_loss < bad_loss);
        Ok(())
    }

    #[test]
    fn test_boundary_loss_requires_context() {
        let label = constant_label(1, 2, 0);
        let pred = confident_prediction(1, 2, 2, 0);
        let err = BoundaryLoss::default().evaluate(&label, &pred, &LossContext::none());
        assert!(err.is_err());
    }

    #[test]
    fn test_boundary_alpha_blend_endpoints() -> Result<()> {
        let label = constant_label(1, 2, 0);
        let pred = confident_prediction(1, 2, 2, 0);
        let dtm = Tensor::ones((1, 2, 2, 2, 2), DType::F32, &Device::Cpu)?;

        let region = DiceCeLoss::new()
            .evaluate(&label, &pred, &LossContext::none())?
            .to_scalar::<f32>()?;

        // alpha = 1 reduces to the region loss alone.
        let ctx = LossContext {
            dtm: Some(&dtm),
            alpha: Some(1.0),
        };
        let at_one = BoundaryLoss::default()
            .evaluate(&label, &pred, &ctx)?
            .to_scalar::<f32>()?;
        assert!((at_one - region).abs() < 1e-5);

        // alpha = 0 is the boundary term alone: mean(dtm * p) = mean(p) = 0.5
        // for a uniform unit dtm over two classes.
        let ctx = LossContext {
            dtm: Some(&dtm),
            alpha: Some(0.0),
        };
        let at_zero = BoundaryLoss::default()
            .evaluate(&label, &pred, &ctx)?
            .to_scalar::<f32>()?;
        assert!((at_zero - 0.5).abs() < 1e-5, "boundary term was {}", at_zero);
        Ok(())
    }

    #[test]
    fn test_hausdorff_zero_when_prediction_matches() -> Result<()> {
        let label = constant_label(1, 2, 1);
        let pred = confident_prediction(1, 2, 2, 1);
        let dtm = Tensor::ones((1, 2, 2, 2, 2), DType::F32, &Device::Cpu)?;
        let ctx = LossContext {
            dtm: Some(&dtm),
            alpha: Some(0.0),
        };
        let loss = HausdorffLoss::default()
            .evaluate(&label, &pred, &ctx)?
            .to_scalar::<f32>()?;
        assert!(loss < 1e-4, "expected ~0 for exact match, got {}", loss);
        Ok(())
    }

    #[test]
    fn test_deep_supervision_normalization() -> Result<()> {
        // Primary and every head contribute the same constant L, so the
        // total must equal (L + sum 0.5^(k+1) L) / (2 - 2^-(H+1)).
        let label = constant_label(1, 2, 0);
        let l = 1.0f64;
        for heads in [0usize, 1, 3] {
            let composite = CompositeLoss::with_primary(Box::new(ConstLoss(l)), true);
            let output = dummy_output(heads);
            let total = composite
                .compute(
                    &output.prediction,
                    &label,
                    &output,
                    &LossContext::none(),
                    &[],
                )?
                .to_scalar::<f32>()? as f64;

            let weighted: f64 =
                l + (0..heads).map(|k| 0.5f64.powi(k as i32 + 1) * l).sum::<f64>();
            let expected = weighted / (2.0 - 2.0f64.powi(-(heads as i32 + 1)));
            assert!(
                (total - expected).abs() < 1e-6,
                "H={}: total={} expected={}",
                heads,
                total,
                expected
            );
        }
        Ok(())
    }

    #[test]
    fn test_composite_without_deep_supervision_is_primary() -> Result<()> {
        let label = constant_label(1, 2, 0);
        let composite = CompositeLoss::with_primary(Box::new(ConstLoss(0.75)), false);
        let output = dummy_output(0);
        let total = composite
            .compute(
                &output.prediction,
                &label,
                &output,
                &LossContext::none(),
                &[],
            )?
            .to_scalar::<f32>()?;
        assert!((total - 0.75).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_parameter_norm_penalties() -> Result<()> {
        let device = Device::Cpu;
        let label = constant_label(1, 2, 0);
        let output = dummy_output(0);

        // Single parameter [3, 4] filled with 2 => L2 norm = sqrt(12*4) and
        // L1 norm = 24.
        let var = Var::from_tensor(&Tensor::full(2.0f32, (3, 4), &device)?)?;
        let params = vec![var];

        let mut composite = CompositeLoss::with_primary(Box::new(ConstLoss(0.0)), false);
        composite.l2_penalty = Some(0.1);
        composite.l1_penalty = Some(0.01);
        let total = composite
            .compute(
                &output.prediction,
                &label,
                &output,
                &LossContext::none(),
                &params,
            )?
            .to_scalar::<f32>()? as f64;

        let expected = 0.1 * (48.0f64).sqrt() + 0.01 * 24.0;
        assert!((total - expected).abs() < 1e-4, "got {}", total);
        Ok(())
    }

    #[test]
    fn test_vae_loss_zero_mean_unit_recon() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::zeros((1, 1, 2, 2, 2), DType::F32, &device)?;
        let output = VaeOutput {
            reconstruction: image.clone(),
            mu: Tensor::zeros((1, 4), DType::F32, &device)?,
            log_var: Tensor::zeros((1, 4), DType::F32, &device)?,
        };
        // Perfect reconstruction with a standard-normal latent: both terms 0.
        let loss = VaeLoss.evaluate(&image, &output)?.to_scalar::<f32>()?;
        assert!(loss.abs() < 1e-6, "got {}", loss);
        Ok(())
    }

    #[test]
    fn test_vae_loss_penalizes_divergence() -> Result<()> {
        let device = Device::Cpu;
        let image = Tensor::zeros((1, 1, 2, 2, 2), DType::F32, &device)?;
        let output = VaeOutput {
            reconstruction: Tensor::ones((1, 1, 2, 2, 2), DType::F32, &device)?,
            mu: Tensor::full(2.0f32, (1, 4), &device)?,
            log_var: Tensor::zeros((1, 4), DType::F32, &device)?,
        };
        let loss = VaeLoss.evaluate(&image, &output)?.to_scalar::<f32>()?;
        // KL = -0.5 * (1 - 4 - 1) = 2, recon = 1.
        assert!((loss - 3.0).abs() < 1e-5, "got {}", loss);
        Ok(())
    }

    #[test]
    fn test_composite_never_mutates_inputs() -> Result<()> {
        let label = constant_label(1, 2, 1);
        let pred = confident_prediction(1, 2, 2, 1);
        let before = pred.flatten_all()?.to_vec1::<f32>()?;
        let output = ModelOutput {
            prediction: pred.clone(),
            deep_supervision: None,
            vae_reg: None,
        };
        let composite = CompositeLoss::with_primary(Box::new(DiceCeLoss::new()), false);
        composite.compute(&pred, &label, &output, &LossContext::none(), &[])?;
        let after = pred.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(before, after);
        Ok(())
    }
}
