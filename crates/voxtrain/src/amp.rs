//! Dynamic loss scaling for mixed-precision training.
//!
//! Reduced-precision backward passes can underflow small gradient values to
//! zero. The scaler multiplies the loss by a large factor before backward,
//! then the gradients are divided by the same factor before the optimizer
//! reads them. The factor adapts: any non-finite gradient skips the step and
//! shrinks the scale; a run of finite steps grows it again to probe for
//! headroom.
//!
//! Each worker owns its scaler. Gradients are averaged across the group
//! before the finite-check, so every worker observes the same values and
//! takes the same skip/grow decision, keeping the per-worker scales in
//! lockstep without extra synchronization.

use candle_core::{Result, Tensor};

/// Scaler tuning knobs.
#[derive(Debug, Clone)]
pub struct ScalerOptions {
    /// Initial loss scale.
    pub init_scale: f64,
    /// Multiply the scale by this after `growth_interval` finite steps.
    pub growth_factor: f64,
    /// Multiply the scale by this when a non-finite gradient appears.
    pub backoff_factor: f64,
    /// Consecutive finite steps required before the scale grows.
    pub growth_interval: u64,
}

impl Default for ScalerOptions {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// Adaptive loss-scale state, owned exclusively by the local worker.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    opts: ScalerOptions,
    good_steps: u64,
    skipped_steps: u64,
}

impl GradScaler {
    pub fn new(opts: ScalerOptions) -> Self {
        let scale = opts.init_scale;
        Self {
            scale,
            opts,
            good_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Current loss scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Reciprocal of the current scale, for unscaling gradients.
    pub fn inv_scale(&self) -> f64 {
        1.0 / self.scale
    }

    /// Total steps skipped because of non-finite gradients.
    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    /// Multiply the loss by the current scale before backward.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        loss.affine(self.scale, 0.0)
    }

    /// Advance the state machine after a step attempt.
    ///
    /// `found_non_finite` means the parameter update was skipped; the scale
    /// shrinks (never below 1.0) and the growth counter resets. Otherwise the
    /// counter advances and the scale doubles once per growth interval.
    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.scale = (self.scale * self.opts.backoff_factor).max(1.0);
            self.good_steps = 0;
            self.skipped_steps += 1;
        } else {
            self.good_steps += 1;
            if self.good_steps >= self.opts.growth_interval {
                self.scale *= self.opts.growth_factor;
                self.good_steps = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_scale_loss_multiplies() -> Result<()> {
        let device = Device::Cpu;
        let scaler = GradScaler::new(ScalerOptions {
            init_scale: 4.0,
            ..Default::default()
        });
        let loss = Tensor::new(2.5f32, &device)?;
        let scaled = scaler.scale_loss(&loss)?;
        assert_eq!(scaled.to_scalar::<f32>()?, 10.0);
        Ok(())
    }

    #[test]
    fn test_non_finite_shrinks_scale_and_counts_skip() {
        let mut scaler = GradScaler::new(ScalerOptions::default());
        let before = scaler.scale();
        scaler.update(true);
        assert_eq!(scaler.scale(), before * 0.5);
        assert_eq!(scaler.skipped_steps(), 1);
    }

    #[test]
    fn test_scale_never_drops_below_one() {
        let mut scaler = GradScaler::new(ScalerOptions {
            init_scale: 1.0,
            ..Default::default()
        });
        scaler.update(true);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_growth_after_exactly_the_interval() {
        let mut scaler = GradScaler::new(ScalerOptions {
            init_scale: 1024.0,
            growth_interval: 5,
            ..Default::default()
        });
        for _ in 0..4 {
            scaler.update(false);
            assert_eq!(scaler.scale(), 1024.0, "scale grew early");
        }
        scaler.update(false);
        assert_eq!(scaler.scale(), 2048.0);
        // The counter reset; no immediate second growth.
        scaler.update(false);
        assert_eq!(scaler.scale(), 2048.0);
    }

    #[test]
    fn test_injected_non_finite_gradient_skips_step_and_shrinks_scale() -> Result<()> {
        use crate::optim::Sgd;
        use crate::replica::ParamGrads;
        use candle_core::Var;

        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], &device)?)?;
        let mut sgd = Sgd::new(vec![var.clone()], 0.1)?;
        let mut scaler = GradScaler::new(ScalerOptions::default());
        let initial_scale = scaler.scale();

        // A backward pass that overflowed in reduced precision.
        let store = Tensor::new(&[f32::INFINITY, 1.0], &device)?
            .broadcast_mul(var.as_tensor())?
            .sum_all()?
            .backward()?;
        let mut grads = ParamGrads::collect(&[var.clone()], &store);
        grads.scale(scaler.inv_scale())?;

        // Same decision sequence as the training step.
        if grads.has_non_finite()? {
            scaler.update(true);
        } else {
            sgd.step(&grads, 1.0)?;
            scaler.update(false);
        }

        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert_eq!(scaler.scale(), initial_scale * 0.5);
        assert_eq!(scaler.skipped_steps(), 1);
        Ok(())
    }

    #[test]
    fn test_non_finite_resets_growth_counter() {
        let mut scaler = GradScaler::new(ScalerOptions {
            init_scale: 1024.0,
            growth_interval: 3,
            ..Default::default()
        });
        scaler.update(false);
        scaler.update(false);
        scaler.update(true); // resets counter, halves scale
        assert_eq!(scaler.scale(), 512.0);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 512.0, "counter should have restarted");
        scaler.update(false);
        assert_eq!(scaler.scale(), 1024.0);
    }
}
