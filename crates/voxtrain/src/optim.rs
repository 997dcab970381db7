//! Per-worker optimizers.
//!
//! Optimizer state (momentum and adaptive buffers) is owned exclusively by
//! the local worker; only the averaged gradients flowing in through
//! `ParamGrads` are shared. `step` applies an optional clip factor computed
//! from the global gradient norm so clipping composes with gradient
//! unscaling in the mixed-precision path.

use candle_core::{Result, Tensor, Var};

use crate::config::OptimizerKind;
use crate::replica::ParamGrads;

/// Adam with decoupled weight decay.
pub struct Adam {
    vars: Vec<Var>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step_count: i32,
}

impl Adam {
    pub fn new(vars: Vec<Var>, lr: f64) -> Result<Self> {
        let exp_avg = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<Result<Vec<_>>>()?;
        let exp_avg_sq = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            exp_avg,
            exp_avg_sq,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            step_count: 0,
        })
    }

    pub fn step(&mut self, grads: &ParamGrads, clip_scale: f64) -> Result<()> {
        self.step_count += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_count);
        let bias2 = 1.0 - self.beta2.powi(self.step_count);

        for (i, var) in self.vars.iter().enumerate() {
            let grad = match grads.get(i) {
                Some(g) => g,
                None => continue,
            };
            let grad = (grad * clip_scale)?;

            if self.weight_decay > 0.0 {
                let decayed = (var.as_tensor() * (1.0 - self.lr * self.weight_decay))?;
                var.set(&decayed)?;
            }

            let m = ((&self.exp_avg[i] * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m / bias1)?;
            let v_hat = (&v / bias2)?;
            let denom = v_hat.sqrt()?.affine(1.0, self.eps)?;
            let update = (m_hat.div(&denom)? * self.lr)?;
            var.set(&var.as_tensor().sub(&update)?)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// SGD with Nesterov-free momentum.
pub struct Sgd {
    vars: Vec<Var>,
    velocity: Vec<Tensor>,
    lr: f64,
    momentum: f64,
}

impl Sgd {
    pub fn new(vars: Vec<Var>, lr: f64) -> Result<Self> {
        let velocity = vars
            .iter()
            .map(|v| Tensor::zeros_like(v.as_tensor()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            velocity,
            lr,
            momentum: 0.99,
        })
    }

    pub fn step(&mut self, grads: &ParamGrads, clip_scale: f64) -> Result<()> {
        for (i, var) in self.vars.iter().enumerate() {
            let grad = match grads.get(i) {
                Some(g) => g,
                None => continue,
            };
            let grad = (grad * clip_scale)?;
            let v = ((&self.velocity[i] * self.momentum)? + &grad)?;
            var.set(&var.as_tensor().sub(&(&v * self.lr)?)?)?;
            self.velocity[i] = v;
        }
        Ok(())
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Optimizer selected by the run configuration.
pub enum Optimizer {
    Adam(Adam),
    Sgd(Sgd),
}

impl Optimizer {
    pub fn from_config(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> Result<Self> {
        Ok(match kind {
            OptimizerKind::Adam => Optimizer::Adam(Adam::new(vars, lr)?),
            OptimizerKind::Sgd => Optimizer::Sgd(Sgd::new(vars, lr)?),
        })
    }

    pub fn step(&mut self, grads: &ParamGrads, clip_scale: f64) -> Result<()> {
        match self {
            Optimizer::Adam(o) => o.step(grads, clip_scale),
            Optimizer::Sgd(o) => o.step(grads, clip_scale),
        }
    }

    pub fn set_lr(&mut self, lr: f64) {
        match self {
            Optimizer::Adam(o) => o.set_lr(lr),
            Optimizer::Sgd(o) => o.set_lr(lr),
        }
    }
}
