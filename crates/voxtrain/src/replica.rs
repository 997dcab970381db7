//! Replicated model state with gradient all-reduce.
//!
//! Every worker holds a full copy of the parameters; replicas stay in sync
//! because each backward pass is followed by one all-reduce that averages
//! the parameter gradients across the group before any optimizer reads
//! them. No other code path mutates parameters, otherwise the replicas
//! silently diverge.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

use crate::dist::ProcessGroup;
use crate::error::TrainResult;
use crate::model::{ModelOutput, SegModel};

/// Per-parameter gradients, index-aligned with the replica's variable list.
pub struct ParamGrads {
    grads: Vec<Option<Tensor>>,
}

impl ParamGrads {
    /// Collect gradients for `vars` out of a backward pass.
    pub fn collect(vars: &[Var], grads: &GradStore) -> Self {
        let grads = vars
            .iter()
            .map(|var| grads.get(var.as_tensor()).cloned())
            .collect();
        Self { grads }
    }

    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.grads.get(index).and_then(|g| g.as_ref())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Multiply every gradient by a constant (used to unscale after a
    /// scaled backward pass).
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for grad in self.grads.iter_mut() {
            if let Some(g) = grad {
                *grad = Some(g.affine(factor, 0.0)?);
            }
        }
        Ok(())
    }

    /// Total L2 norm across all gradients.
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for grad in self.grads.iter().flatten() {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Whether any gradient contains a NaN or infinite value.
    pub fn has_non_finite(&self) -> Result<bool> {
        for grad in self.grads.iter().flatten() {
            let sum = grad.sum_all()?.to_scalar::<f32>()?;
            if !sum.is_finite() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// A model replica owned by one worker.
pub struct Replica {
    model: Box<dyn SegModel>,
    varmap: VarMap,
    vars: Vec<Var>,
    world_size: usize,
}

impl Replica {
    pub fn new(mut model: Box<dyn SegModel>, varmap: VarMap, world_size: usize) -> Self {
        model.convert_norms_for_group(world_size);
        let vars = varmap.all_vars();
        Self {
            model,
            varmap,
            vars,
            world_size,
        }
    }

    pub fn forward(&self, image: &Tensor) -> Result<ModelOutput> {
        self.model.forward(image)
    }

    pub fn model(&self) -> &dyn SegModel {
        self.model.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// The replica's learnable parameters. Optimizers must be built over
    /// this list so gradient indices line up.
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Collect this worker's gradients out of a backward pass.
    pub fn collect_gradients(&self, grads: &GradStore) -> ParamGrads {
        ParamGrads::collect(&self.vars, grads)
    }

    /// Average gradients across the group. All parameter gradients are
    /// packed into one flat buffer so the group sees a single collective
    /// per step; every worker ends up with identical averaged values.
    pub fn sync_gradients(
        &self,
        grads: &mut ParamGrads,
        group: &mut ProcessGroup,
    ) -> TrainResult<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        let mut flat: Vec<f64> = Vec::new();
        let mut layout: Vec<Option<(usize, Vec<usize>)>> = Vec::with_capacity(grads.len());
        for grad in grads.grads.iter() {
            match grad {
                Some(g) => {
                    let values = g.flatten_all()?.to_vec1::<f32>()?;
                    layout.push(Some((values.len(), g.dims().to_vec())));
                    flat.extend(values.iter().map(|&v| v as f64));
                }
                None => layout.push(None),
            }
        }

        group.all_reduce(&mut flat)?;

        let inv_world = 1.0 / self.world_size as f64;
        let mut offset = 0;
        for (slot, entry) in grads.grads.iter_mut().zip(layout.into_iter()) {
            if let Some((len, dims)) = entry {
                let values: Vec<f32> = flat[offset..offset + len]
                    .iter()
                    .map(|&v| (v * inv_world) as f32)
                    .collect();
                offset += len;
                let device = slot.as_ref().expect("layout matches slots").device().clone();
                *slot = Some(Tensor::from_vec(values, dims.as_slice(), &device)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::GroupOptions;
    use candle_core::Device;

    fn var(values: &[f32], device: &Device) -> Var {
        Var::from_tensor(&Tensor::new(values, device).unwrap()).unwrap()
    }

    #[test]
    fn test_collect_and_norm() -> Result<()> {
        let device = Device::Cpu;
        let w = var(&[3.0, 4.0], &device);
        let x = Tensor::new(&[1.0f32, 1.0], &device)?;
        let loss = (w.as_tensor() * &x)?.sum_all()?;
        let store = loss.backward()?;

        let grads = ParamGrads::collect(&[w], &store);
        assert_eq!(grads.len(), 1);
        // d(sum(w*x))/dw = x = [1, 1] => norm = sqrt(2)
        assert!((grads.global_norm()? - 2f64.sqrt()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_scale_divides_gradients() -> Result<()> {
        let device = Device::Cpu;
        let w = var(&[1.0, 1.0], &device);
        let x = Tensor::new(&[2.0f32, 2.0], &device)?;
        let loss = (w.as_tensor() * &x)?.sum_all()?;
        let store = loss.backward()?;
        let mut grads = ParamGrads::collect(&[w], &store);
        grads.scale(0.5)?;
        let values = grads.get(0).unwrap().to_vec1::<f32>()?;
        assert_eq!(values, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_non_finite_detection() -> Result<()> {
        let device = Device::Cpu;
        let grads = ParamGrads {
            grads: vec![Some(Tensor::new(&[1.0f32, f32::NAN], &device)?)],
        };
        assert!(grads.has_non_finite()?);

        let finite = ParamGrads {
            grads: vec![Some(Tensor::new(&[1.0f32, 2.0], &device)?), None],
        };
        assert!(!finite.has_non_finite()?);
        Ok(())
    }

    #[test]
    fn test_sync_gradients_averages_across_workers() {
        let device = Device::Cpu;
        let world_size = 2;
        let port = 29620;

        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let device = device.clone();
                std::thread::spawn(move || -> TrainResult<Vec<f32>> {
                    let mut opts = GroupOptions::new("127.0.0.1", port);
                    opts.join_timeout = std::time::Duration::from_secs(10);
                    let mut group = ProcessGroup::join(rank, world_size, &opts)?;

                    // Rank 0 holds gradient [2, 4]; rank 1 holds [4, 8].
                    let base = 2.0 * (rank + 1) as f32;
                    let grad = Tensor::new(&[base, base * 2.0], &device)?;
                    let mut grads = ParamGrads {
                        grads: vec![Some(grad)],
                    };

                    // Minimal replica shell: only world_size matters here.
                    let varmap = VarMap::new();
                    let replica = Replica::new(
                        Box::new(NoopModel),
                        varmap,
                        world_size,
                    );
                    replica.sync_gradients(&mut grads, &mut group)?;
                    group.leave();
                    Ok(grads.get(0).unwrap().to_vec1::<f32>()?)
                })
            })
            .collect();

        for handle in handles {
            let averaged = handle.join().unwrap().unwrap();
            // Average of [2,4] and [4,8] is [3,6] on every rank.
            assert_eq!(averaged, vec![3.0, 6.0]);
        }
    }

    struct NoopModel;

    impl SegModel for NoopModel {
        fn forward(&self, image: &Tensor) -> Result<ModelOutput> {
            Ok(ModelOutput {
                prediction: image.clone(),
                deep_supervision: None,
                vae_reg: None,
            })
        }
    }

    #[test]
    fn test_sync_gradients_single_worker_is_noop() -> TrainResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let replica = Replica::new(Box::new(NoopModel), varmap, 1);
        let grad = Tensor::new(&[1.0f32, 2.0], &device)?;
        let mut grads = ParamGrads {
            grads: vec![Some(grad)],
        };
        let mut opts = GroupOptions::new("127.0.0.1", 29621);
        opts.join_timeout = std::time::Duration::from_secs(2);
        let mut group = ProcessGroup::join(0, 1, &opts)?;
        replica.sync_gradients(&mut grads, &mut group)?;
        assert_eq!(grads.get(0).unwrap().to_vec1::<f32>()?, vec![1.0, 2.0]);
        Ok(())
    }
}
