//! Distributed multi-fold training orchestration.
//!
//! Every worker runs the identical path: join the group, then for each
//! fold split the data, build loaders, model replica, loss, optimizer and
//! scaler, and drive the epoch loop. Epochs are strictly ordered
//! TRAIN -> barrier -> VALIDATE -> reduce -> rank-0 log/checkpoint ->
//! barrier, so designated-writer I/O never races with compute on the other
//! ranks. Checkpoints and metric logs are written by rank 0 only; all
//! ranks still perform the compute and reductions that produce the values
//! being logged.

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::debug;
use voxtrain_core::{DatasetDescription, ModelSpec};

use crate::amp::{GradScaler, ScalerOptions};
use crate::checkpoint::{fold_checkpoint_dir, save_checkpoint, CheckpointMeta};
use crate::config::RunConfig;
use crate::data::{split_fold, Batch, DataProvider, PathsTable, StreamContext};
use crate::dist::{GroupOptions, ProcessGroup};
use crate::error::TrainResult;
use crate::infer::sliding_window_inference;
use crate::logging;
use crate::loss::{CompositeLoss, DiceCeLoss, LossContext, SegLoss};
use crate::metrics::{BestCheckpoint, JsonlSink, MetricSink, NullSink, RunningMean};
use crate::model::ModelFactory;
use crate::optim::Optimizer;
use crate::replica::{ParamGrads, Replica};
use crate::schedule::{lr_multiplier, AlphaSchedule};

/// Pick the compute device for a worker rank.
#[cfg(feature = "cuda")]
pub fn worker_device(rank: usize) -> TrainResult<Device> {
    Ok(Device::new_cuda(rank).map_err(crate::error::TrainError::from)?)
}

/// Pick the compute device for a worker rank.
#[cfg(not(feature = "cuda"))]
pub fn worker_device(_rank: usize) -> TrainResult<Device> {
    Ok(Device::Cpu)
}

/// Training orchestrator: owns the immutable run state and drives workers.
pub struct Trainer<'a> {
    config: RunConfig,
    model_spec: ModelSpec,
    paths: PathsTable,
    results_dir: PathBuf,
    factory: &'a dyn ModelFactory,
    provider: &'a dyn DataProvider,
    alpha: AlphaSchedule,
    /// Fixed validation loss, independent of the training loss selection.
    validation_loss: DiceCeLoss,
}

impl std::fmt::Debug for Trainer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer").finish_non_exhaustive()
    }
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: RunConfig,
        dataset: &DatasetDescription,
        paths: PathsTable,
        results_dir: PathBuf,
        factory: &'a dyn ModelFactory,
        provider: &'a dyn DataProvider,
    ) -> TrainResult<Self> {
        config.validate()?;
        dataset.validate()?;
        let model_spec = config.model_spec(dataset);
        model_spec.validate()?;
        let alpha = AlphaSchedule::new(
            config.epochs,
            config.boundary_schedule,
            config.schedule_constant,
            config.linear_pause,
            config.step_length,
        );
        Ok(Self {
            config,
            model_spec,
            paths,
            results_dir,
            factory,
            provider,
            alpha,
            validation_loss: DiceCeLoss::new(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn model_spec(&self) -> &ModelSpec {
        &self.model_spec
    }

    /// Entry point for one worker process. Joins the communication group,
    /// trains every configured fold, and leaves the group exactly once,
    /// including on the failure path.
    pub fn run_worker(&self, rank: usize, world_size: usize) -> TrainResult<()> {
        let opts = GroupOptions::new(self.config.master_addr.clone(), self.config.master_port);
        let mut group = ProcessGroup::join(rank, world_size, &opts)?;

        let result = self.run_folds(&mut group, rank, world_size);
        group.leave();
        result
    }

    fn run_folds(
        &self,
        group: &mut ProcessGroup,
        rank: usize,
        world_size: usize,
    ) -> TrainResult<()> {
        // Rank 0 is the only worker allowed to touch the results directory.
        let is_designated_writer = rank == 0;
        let device = worker_device(rank)?;

        if is_designated_writer {
            std::fs::create_dir_all(self.results_dir.join("models"))?;
            std::fs::create_dir_all(self.results_dir.join("logs"))?;
            self.model_spec
                .save(self.results_dir.join("models").join("model_spec.json"))?;
            logging::log_training_start(world_size, &self.config.folds);
        }

        for &fold in &self.config.folds {
            self.train_fold(group, fold, rank, world_size, is_designated_writer, &device)?;
            // Serialize the fold boundary so no worker races ahead.
            group.barrier()?;
        }
        Ok(())
    }

    fn train_fold(
        &self,
        group: &mut ProcessGroup,
        fold: usize,
        rank: usize,
        world_size: usize,
        is_designated_writer: bool,
        device: &Device,
    ) -> TrainResult<()> {
        let config = &self.config;

        let split = split_fold(
            &self.paths,
            fold,
            config.val_fraction,
            config.seed,
            config.use_dtms,
            world_size,
        )?;
        // Each worker processes a disjoint shard of the validation set.
        let val_steps = split.val.len() / world_size;
        let steps_per_epoch = config
            .steps_per_epoch
            .unwrap_or_else(|| (split.train.len() / config.batch_size).max(1));

        let ctx = StreamContext::for_fold(
            config,
            self.model_spec.n_classes,
            rank,
            world_size,
            device,
        );
        let mut train_stream = self.provider.training_stream(&split.train, &ctx)?;
        let mut val_stream = self.provider.validation_stream(&split.val, &ctx)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = self.factory.build(&self.model_spec, vb)?;
        let replica = Replica::new(model, varmap, world_size);

        let composite = CompositeLoss::from_config(config)?;
        let mut optimizer =
            Optimizer::from_config(config.optimizer, replica.vars().to_vec(), config.learning_rate)?;
        let mut scaler = config.amp.then(|| GradScaler::new(ScalerOptions::default()));
        let total_steps = config.epochs * steps_per_epoch;

        let mut train_mean = RunningMean::new();
        let mut val_mean = RunningMean::new();
        let mut best = BestCheckpoint::new(fold_checkpoint_dir(&self.results_dir, fold));
        let mut sink: Box<dyn MetricSink> = if is_designated_writer {
            logging::log_fold_start(fold, split.train.len(), split.val.len());
            Box::new(JsonlSink::create(
                self.results_dir
                    .join("logs")
                    .join(format!("fold_{}.jsonl", fold)),
            ))
        } else {
            Box::new(NullSink)
        };

        let mut global_step = 0usize;
        for epoch in 0..config.epochs {
            train_mean.reset();
            val_mean.reset();

            for _ in 0..steps_per_epoch {
                let batch = train_stream.next_batch()?;
                let alpha = self.alpha.alpha(epoch);
                let raw_loss =
                    self.train_step(&replica, &composite, &mut optimizer, scaler.as_mut(), group, &batch, alpha)?;

                global_step += 1;
                let mult = lr_multiplier(global_step, total_steps, config.lr_schedule);
                optimizer.set_lr(config.learning_rate * mult);

                // The summed loss is defined only on rank 0; the mean it
                // feeds is observational and never reaches the gradients.
                let total = group.reduce(raw_loss, 0)?;
                if is_designated_writer {
                    let running = train_mean.update(total / world_size as f64);
                    debug!(fold, epoch, step = global_step, loss = running, "training step");
                }
            }

            // No worker may enter validation before all finished training.
            group.barrier()?;

            for _ in 0..val_steps {
                let batch = val_stream.next_batch()?;
                let val_loss = self.val_step(&replica, &batch)?;
                let total = group.reduce(val_loss, 0)?;
                if is_designated_writer {
                    val_mean.update(total / world_size as f64);
                }
            }

            if is_designated_writer {
                let running_val = val_mean.mean();
                let previous_best = best.best_loss();
                if best.observe(running_val) {
                    logging::log_validation_improved(fold, epoch, previous_best, running_val);
                    let meta = CheckpointMeta {
                        fold,
                        epoch,
                        val_loss: running_val,
                        model: self.model_spec.clone(),
                    };
                    save_checkpoint(replica.varmap(), &meta, best.path())?;
                } else {
                    logging::log_validation_not_improved(fold, epoch, best.best_loss());
                }
                logging::log_epoch_summary(fold, epoch, train_mean.mean(), running_val);
                sink.log_epoch(
                    epoch,
                    &[("training", train_mean.mean()), ("validation", running_val)],
                );
            }

            train_stream.reset()?;
            val_stream.reset()?;

            // Logging and checkpointing complete before the next epoch.
            group.barrier()?;
        }
        Ok(())
    }

    /// One training step: forward, composite loss, backward (through the
    /// scaled path when mixed precision is active), gradient sync, optional
    /// clip, optimizer step. Returns the raw (unscaled) loss value.
    fn train_step(
        &self,
        replica: &Replica,
        composite: &CompositeLoss,
        optimizer: &mut Optimizer,
        scaler: Option<&mut GradScaler>,
        group: &mut ProcessGroup,
        batch: &Batch,
        alpha: f64,
    ) -> TrainResult<f64> {
        let ctx = LossContext {
            dtm: batch.dtm.as_ref(),
            alpha: Some(alpha),
        };

        match scaler {
            Some(scaler) => {
                // Reduced-precision forward where the model supports it;
                // loss scaling applies either way.
                let image = if replica.model().reduced_precision_ok() {
                    batch.image.to_dtype(DType::F16)?
                } else {
                    batch.image.clone()
                };
                let output = replica.forward(&image)?;
                let loss = composite.compute(&batch.image, &batch.label, &output, &ctx, replica.vars())?;
                let raw = loss.to_scalar::<f32>()? as f64;

                let scaled = scaler.scale_loss(&loss)?;
                let grads = scaled.backward()?;
                let mut grads = replica.collect_gradients(&grads);
                replica.sync_gradients(&mut grads, group)?;
                // Unscale before the clip so the norm is measured in real units.
                grads.scale(scaler.inv_scale())?;

                if grads.has_non_finite()? {
                    // Skip the parameter update and shrink the scale.
                    scaler.update(true);
                    return Ok(raw);
                }
                let clip_scale = self.clip_scale(&grads)?;
                optimizer.step(&grads, clip_scale)?;
                scaler.update(false);
                Ok(raw)
            }
            None => {
                let output = replica.forward(&batch.image)?;
                let loss = composite.compute(&batch.image, &batch.label, &output, &ctx, replica.vars())?;
                let raw = loss.to_scalar::<f32>()? as f64;

                let grads = loss.backward()?;
                let mut grads = replica.collect_gradients(&grads);
                replica.sync_gradients(&mut grads, group)?;
                let clip_scale = self.clip_scale(&grads)?;
                optimizer.step(&grads, clip_scale)?;
                Ok(raw)
            }
        }
    }

    fn clip_scale(&self, grads: &ParamGrads) -> TrainResult<f64> {
        let Some(max_norm) = self.config.clip_norm else {
            return Ok(1.0);
        };
        let norm = grads.global_norm()?;
        Ok(if norm > max_norm { max_norm / norm } else { 1.0 })
    }

    /// One validation step: sliding-window inference at the training patch
    /// size, scored with the fixed validation loss only.
    fn val_step(&self, replica: &Replica, batch: &Batch) -> TrainResult<f64> {
        let prediction = sliding_window_inference(
            replica.model(),
            &batch.image,
            self.model_spec.patch_size,
            self.config.val_overlap,
            self.model_spec.n_classes,
        )?;
        let loss = self
            .validation_loss
            .evaluate(&batch.label, &prediction, &LossContext::none())?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }
}
