//! Boundary-loss weighting and learning-rate schedules.
//!
//! Both are pure functions of the epoch/step index: the same index always
//! yields the same value, so they can be consulted once per training step
//! without side effects.

use crate::config::{BoundaryScheduleKind, LrScheduleKind};

/// Schedule for the alpha weight that blends a boundary loss against a
/// region-based loss. Always returns a value in [0, 1].
#[derive(Debug, Clone)]
pub struct AlphaSchedule {
    n_epochs: usize,
    kind: BoundaryScheduleKind,
    constant: f64,
    init_pause: usize,
    step_length: usize,
}

impl AlphaSchedule {
    pub fn new(
        n_epochs: usize,
        kind: BoundaryScheduleKind,
        constant: f64,
        init_pause: usize,
        step_length: usize,
    ) -> Self {
        Self {
            n_epochs,
            kind,
            constant: constant.clamp(0.0, 1.0),
            init_pause,
            step_length: step_length.max(1),
        }
    }

    /// Alpha value for the given epoch.
    pub fn alpha(&self, epoch: usize) -> f64 {
        match self.kind {
            BoundaryScheduleKind::Constant => self.constant,
            BoundaryScheduleKind::Linear => {
                if epoch < self.init_pause {
                    return 0.0;
                }
                let ramp_len = self.n_epochs.saturating_sub(self.init_pause);
                if ramp_len == 0 {
                    return self.constant;
                }
                let progress = (epoch - self.init_pause) as f64 / ramp_len as f64;
                (self.constant * progress).min(self.constant)
            }
            BoundaryScheduleKind::Step => {
                let held = (epoch / self.step_length) * self.step_length;
                if self.n_epochs == 0 {
                    return self.constant;
                }
                (self.constant * held as f64 / self.n_epochs as f64).min(self.constant)
            }
        }
    }
}

/// Learning-rate multiplier in [0, 1] for the given step.
///
/// - `constant`: 1.0 throughout
/// - `polynomial`: (1 - step/total)^0.9, the decay used for segmentation runs
/// - `cosine`: half-cosine anneal from 1.0 to 0.0
pub fn lr_multiplier(step: usize, total_steps: usize, kind: LrScheduleKind) -> f64 {
    let total = total_steps.max(1);
    let progress = (step as f64 / total as f64).min(1.0);
    match kind {
        LrScheduleKind::Constant => 1.0,
        LrScheduleKind::Polynomial => (1.0 - progress).powf(0.9),
        LrScheduleKind::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
    }
}
