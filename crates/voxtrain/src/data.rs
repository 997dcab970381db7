//! Fold partitioning, deterministic train/validation splits, and the
//! batch-stream interface the training loop consumes.
//!
//! The actual on-disk loading, resampling, and augmentation pipeline lives
//! outside this crate; the loop only sees `BatchStream::next_batch` and
//! `reset`. A synthetic provider generates seeded random volumes for
//! pipeline validation and tests.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{config_error, IoResultExt, TrainError, TrainResult};

/// One patient entry in the training paths table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsEntry {
    /// Patient identifier.
    pub id: String,
    /// Cross-validation fold this patient is held out in.
    pub fold: usize,
    /// One image path per input channel.
    pub images: Vec<PathBuf>,
    /// Ground-truth label path.
    pub label: PathBuf,
    /// Distance-transform map path, when precomputed.
    #[serde(default)]
    pub dtm: Option<PathBuf>,
}

/// The full training paths table, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsTable {
    pub entries: Vec<PathsEntry>,
}

impl PathsTable {
    /// Load the table from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(&path).with_path(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            config_error(format!(
                "failed to parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }
}

/// One training or validation example: image paths, label path, and the
/// optional distance-transform map.
#[derive(Debug, Clone)]
pub struct Example {
    pub id: String,
    pub images: Vec<PathBuf>,
    pub label: PathBuf,
    pub dtm: Option<PathBuf>,
}

/// Train/validation partition for one fold.
#[derive(Debug, Clone)]
pub struct FoldSplit {
    pub train: Vec<Example>,
    pub val: Vec<Example>,
}

/// Compute the train/validation partition for one fold.
///
/// Training candidates are every entry whose fold differs from the held-out
/// fold. A single seeded shuffle then carves off `round(val_fraction * N)`
/// (at least one) validation examples; the split is deterministic for a
/// fixed seed and input ordering. Fails before any loader is built when the
/// validation subset is smaller than the worker count, or when distance maps
/// are required but not aligned 1:1 with images and labels.
pub fn split_fold(
    table: &PathsTable,
    fold: usize,
    val_fraction: f64,
    seed: u64,
    require_dtms: bool,
    world_size: usize,
) -> TrainResult<FoldSplit> {
    let candidates: Vec<Example> = table
        .entries
        .iter()
        .filter(|e| e.fold != fold)
        .map(|e| Example {
            id: e.id.clone(),
            images: e.images.clone(),
            label: e.label.clone(),
            dtm: e.dtm.clone(),
        })
        .collect();

    if candidates.is_empty() {
        return Err(config_error(format!(
            "fold {} leaves no training examples",
            fold
        )));
    }

    if require_dtms {
        let n_dtms = candidates.iter().filter(|e| e.dtm.is_some()).count();
        if n_dtms != candidates.len() {
            return Err(config_error(format!(
                "mismatch in the number of training images, labels, and \
                 distance transforms: found {} training examples but only {} \
                 distance-transform maps",
                candidates.len(),
                n_dtms
            )));
        }
    }

    let n = candidates.len();
    let n_val = ((val_fraction * n as f64).round() as usize).clamp(1, n.saturating_sub(1).max(1));

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let val_idx = &indices[..n_val];
    if val_idx.len() < world_size {
        return Err(TrainError::InsufficientValidationSet {
            val_size: val_idx.len(),
            world_size,
        });
    }

    let mut val = Vec::with_capacity(n_val);
    for &i in val_idx {
        val.push(candidates[i].clone());
    }
    let mut train = Vec::with_capacity(n - n_val);
    for &i in &indices[n_val..] {
        train.push(candidates[i].clone());
    }
    Ok(FoldSplit { train, val })
}

/// One batch pulled from a stream.
///
/// `image` is `[batch, channels, depth, height, width]` f32, `label` is
/// `[batch, depth, height, width]` u32 class indices, and `dtm` (when
/// present) matches the prediction shape `[batch, classes, d, h, w]`.
#[derive(Debug)]
pub struct Batch {
    pub image: Tensor,
    pub label: Tensor,
    pub dtm: Option<Tensor>,
}

/// Stream of batches, sharded by rank so workers see disjoint data.
pub trait BatchStream {
    /// Pull the next batch, blocking until one is available.
    fn next_batch(&mut self) -> TrainResult<Batch>;
    /// Rewind to the start of the stream (called once per epoch).
    fn reset(&mut self) -> TrainResult<()>;
}

/// Everything a provider needs to build a stream for one fold.
pub struct StreamContext {
    pub batch_size: usize,
    pub patch_size: [usize; 3],
    pub oversampling: f64,
    pub with_dtm: bool,
    pub n_classes: usize,
    pub seed: u64,
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
}

impl StreamContext {
    pub fn for_fold(
        config: &RunConfig,
        n_classes: usize,
        rank: usize,
        world_size: usize,
        device: &Device,
    ) -> Self {
        Self {
            // Global batch size is divided across workers.
            batch_size: (config.batch_size / world_size).max(1),
            patch_size: config.patch_size,
            oversampling: config.oversampling,
            with_dtm: config.use_dtms,
            n_classes,
            seed: config.seed,
            rank,
            world_size,
            device: device.clone(),
        }
    }
}

/// Factory for training and validation streams; the seam to the external
/// data-loading pipeline.
pub trait DataProvider {
    fn training_stream(
        &self,
        examples: &[Example],
        ctx: &StreamContext,
    ) -> TrainResult<Box<dyn BatchStream>>;

    fn validation_stream(
        &self,
        examples: &[Example],
        ctx: &StreamContext,
    ) -> TrainResult<Box<dyn BatchStream>>;
}

/// Generates seeded random volumes shaped like the real pipeline's output.
/// Used for smoke runs and the distributed end-to-end tests.
#[derive(Debug, Clone)]
pub struct SyntheticProvider {
    pub n_channels: usize,
    /// Full-volume size used for validation examples.
    pub image_size: [usize; 3],
}

impl SyntheticProvider {
    pub fn new(n_channels: usize, image_size: [usize; 3]) -> Self {
        Self {
            n_channels,
            image_size,
        }
    }
}

struct SyntheticStream {
    n_channels: usize,
    n_classes: usize,
    batch_size: usize,
    shape: [usize; 3],
    with_dtm: bool,
    device: Device,
    seed: u64,
    rng: rand::rngs::StdRng,
}

impl SyntheticStream {
    fn new(
        n_channels: usize,
        shape: [usize; 3],
        batch_size: usize,
        with_dtm: bool,
        ctx: &StreamContext,
    ) -> Self {
        // Offset the seed by rank so workers draw disjoint data.
        let seed = ctx.seed.wrapping_add(ctx.rank as u64).wrapping_mul(0x9e37_79b9);
        Self {
            n_channels,
            n_classes: ctx.n_classes,
            batch_size,
            shape,
            with_dtm,
            device: ctx.device.clone(),
            seed,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }
}

impl BatchStream for SyntheticStream {
    fn next_batch(&mut self) -> TrainResult<Batch> {
        let [d, h, w] = self.shape;
        let voxels = d * h * w;
        let b = self.batch_size;

        let image_data: Vec<f32> = (0..b * self.n_channels * voxels)
            .map(|_| self.rng.gen_range(-1.0..1.0))
            .collect();
        let image = Tensor::from_vec(image_data, (b, self.n_channels, d, h, w), &self.device)?;

        let label_data: Vec<u32> = (0..b * voxels)
            .map(|_| self.rng.gen_range(0..self.n_classes as u32))
            .collect();
        let label = Tensor::from_vec(label_data, (b, d, h, w), &self.device)?;

        let dtm = if self.with_dtm {
            let dtm_data: Vec<f32> = (0..b * self.n_classes * voxels)
                .map(|_| self.rng.gen_range(0.0..1.0))
                .collect();
            Some(Tensor::from_vec(
                dtm_data,
                (b, self.n_classes, d, h, w),
                &self.device,
            )?)
        } else {
            None
        };

        Ok(Batch { image, label, dtm })
    }

    fn reset(&mut self) -> TrainResult<()> {
        self.rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        Ok(())
    }
}

impl DataProvider for SyntheticProvider {
    fn training_stream(
        &self,
        _examples: &[Example],
        ctx: &StreamContext,
    ) -> TrainResult<Box<dyn BatchStream>> {
        Ok(Box::new(SyntheticStream::new(
            self.n_channels,
            ctx.patch_size,
            ctx.batch_size,
            ctx.with_dtm,
            ctx,
        )))
    }

    fn validation_stream(
        &self,
        _examples: &[Example],
        ctx: &StreamContext,
    ) -> TrainResult<Box<dyn BatchStream>> {
        // Validation runs on whole volumes, one per step.
        Ok(Box::new(SyntheticStream::new(
            self.n_channels,
            self.image_size,
            1,
            false,
            ctx,
        )))
    }
}

/// Streams volumes stored as flat little-endian binary files: one f32 file
/// per image channel, one u32 file for the label, and optionally one f32
/// file per example for the distance-transform maps. Shapes come from the
/// provider; resampling and normalization happen upstream.
#[derive(Debug, Clone)]
pub struct RawVolumeProvider {
    /// Full-volume shape (depth, height, width) after preprocessing.
    pub volume_shape: [usize; 3],
}

impl RawVolumeProvider {
    pub fn new(volume_shape: [usize; 3]) -> Self {
        Self { volume_shape }
    }
}

fn read_f32_volume(path: &Path, expected_len: usize) -> TrainResult<Vec<f32>> {
    let data = std::fs::read(path).with_path(path)?;
    if data.len() != expected_len * 4 {
        return Err(TrainError::DataLoading(format!(
            "{}: expected {} f32 values ({} bytes), found {} bytes",
            path.display(),
            expected_len,
            expected_len * 4,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_u32_volume(path: &Path, expected_len: usize) -> TrainResult<Vec<u32>> {
    let data = std::fs::read(path).with_path(path)?;
    if data.len() != expected_len * 4 {
        return Err(TrainError::DataLoading(format!(
            "{}: expected {} u32 values ({} bytes), found {} bytes",
            path.display(),
            expected_len,
            expected_len * 4,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Loaded example held in memory by the raw streams.
struct LoadedVolume {
    image: Vec<f32>,   // [channels, voxels]
    label: Vec<u32>,   // [voxels]
    dtm: Option<Vec<f32>>, // [classes, voxels]
    channels: usize,
}

fn load_volume(
    example: &Example,
    shape: [usize; 3],
    n_classes: usize,
    with_dtm: bool,
) -> TrainResult<LoadedVolume> {
    let voxels = shape[0] * shape[1] * shape[2];
    let mut image = Vec::with_capacity(example.images.len() * voxels);
    for path in &example.images {
        image.extend(read_f32_volume(path, voxels)?);
    }
    let label = read_u32_volume(&example.label, voxels)?;
    let dtm = match (&example.dtm, with_dtm) {
        (Some(path), true) => Some(read_f32_volume(path, n_classes * voxels)?),
        _ => None,
    };
    Ok(LoadedVolume {
        channels: example.images.len(),
        image,
        label,
        dtm,
    })
}

/// Shard assigned to one worker: every `world_size`-th example.
fn rank_shard(examples: &[Example], rank: usize, world_size: usize) -> Vec<Example> {
    examples
        .iter()
        .enumerate()
        .filter(|(i, _)| i % world_size == rank)
        .map(|(_, e)| e.clone())
        .collect()
}

/// Random-crop training stream over raw volumes; workers draw disjoint
/// sequences through rank-offset seeds.
struct RawPatchStream {
    examples: Vec<Example>,
    volume_shape: [usize; 3],
    patch_size: [usize; 3],
    batch_size: usize,
    n_classes: usize,
    with_dtm: bool,
    device: Device,
    seed: u64,
    rng: rand::rngs::StdRng,
}

impl RawPatchStream {
    fn crop_origin(&mut self) -> [usize; 3] {
        let mut origin = [0usize; 3];
        for axis in 0..3 {
            let span = self.volume_shape[axis].saturating_sub(self.patch_size[axis]);
            origin[axis] = if span == 0 {
                0
            } else {
                self.rng.gen_range(0..=span)
            };
        }
        origin
    }
}

impl BatchStream for RawPatchStream {
    fn next_batch(&mut self) -> TrainResult<Batch> {
        let [vd, vh, vw] = self.volume_shape;
        let [pd, ph, pw] = self.patch_size;
        let patch_voxels = pd * ph * pw;
        let b = self.batch_size;

        let mut image_data = Vec::new();
        let mut label_data = Vec::with_capacity(b * patch_voxels);
        let mut dtm_data = self.with_dtm.then(Vec::new);
        let mut channels = 0;

        for _ in 0..b {
            let idx = self.rng.gen_range(0..self.examples.len());
            let volume = load_volume(
                &self.examples[idx],
                self.volume_shape,
                self.n_classes,
                self.with_dtm,
            )?;
            channels = volume.channels;
            let [od, oh, ow] = self.crop_origin();

            let mut copy_plane = |src: &[f32], dst: &mut Vec<f32>, planes: usize| {
                for plane in 0..planes {
                    let base = plane * vd * vh * vw;
                    for z in 0..pd {
                        for y in 0..ph {
                            let row = base + ((od + z) * vh + oh + y) * vw + ow;
                            dst.extend_from_slice(&src[row..row + pw]);
                        }
                    }
                }
            };

            copy_plane(&volume.image, &mut image_data, volume.channels);
            for z in 0..pd {
                for y in 0..ph {
                    let row = ((od + z) * vh + oh + y) * vw + ow;
                    label_data.extend_from_slice(&volume.label[row..row + pw]);
                }
            }
            if let (Some(dtm_data), Some(dtm)) = (dtm_data.as_mut(), volume.dtm.as_ref()) {
                copy_plane(dtm, dtm_data, self.n_classes);
            }
        }

        let image = Tensor::from_vec(image_data, (b, channels, pd, ph, pw), &self.device)?;
        let label = Tensor::from_vec(label_data, (b, pd, ph, pw), &self.device)?;
        let dtm = match dtm_data {
            Some(data) => Some(Tensor::from_vec(
                data,
                (b, self.n_classes, pd, ph, pw),
                &self.device,
            )?),
            None => None,
        };
        Ok(Batch { image, label, dtm })
    }

    fn reset(&mut self) -> TrainResult<()> {
        self.rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        Ok(())
    }
}

/// Full-volume validation stream over the worker's shard, in order.
struct RawVolumeStream {
    examples: Vec<Example>,
    volume_shape: [usize; 3],
    n_classes: usize,
    device: Device,
    pos: usize,
}

impl BatchStream for RawVolumeStream {
    fn next_batch(&mut self) -> TrainResult<Batch> {
        if self.examples.is_empty() {
            return Err(TrainError::DataLoading(
                "validation shard is empty".into(),
            ));
        }
        let example = &self.examples[self.pos % self.examples.len()];
        self.pos += 1;

        let [d, h, w] = self.volume_shape;
        let volume = load_volume(example, self.volume_shape, self.n_classes, false)?;
        let image = Tensor::from_vec(
            volume.image,
            (1, volume.channels, d, h, w),
            &self.device,
        )?;
        let label = Tensor::from_vec(volume.label, (1, d, h, w), &self.device)?;
        Ok(Batch {
            image,
            label,
            dtm: None,
        })
    }

    fn reset(&mut self) -> TrainResult<()> {
        self.pos = 0;
        Ok(())
    }
}

impl DataProvider for RawVolumeProvider {
    fn training_stream(
        &self,
        examples: &[Example],
        ctx: &StreamContext,
    ) -> TrainResult<Box<dyn BatchStream>> {
        if examples.is_empty() {
            return Err(TrainError::DataLoading("training set is empty".into()));
        }
        let seed = ctx.seed.wrapping_add(ctx.rank as u64);
        Ok(Box::new(RawPatchStream {
            examples: examples.to_vec(),
            volume_shape: self.volume_shape,
            patch_size: ctx.patch_size,
            batch_size: ctx.batch_size,
            n_classes: ctx.n_classes,
            with_dtm: ctx.with_dtm,
            device: ctx.device.clone(),
            seed,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }))
    }

    fn validation_stream(
        &self,
        examples: &[Example],
        ctx: &StreamContext,
    ) -> TrainResult<Box<dyn BatchStream>> {
        Ok(Box::new(RawVolumeStream {
            examples: rank_shard(examples, ctx.rank, ctx.world_size),
            volume_shape: self.volume_shape,
            n_classes: ctx.n_classes,
            device: ctx.device.clone(),
            pos: 0,
        }))
    }
}

/// Build a synthetic paths table: `n` patients spread round-robin over
/// `n_folds` folds. Used by tests and smoke runs.
pub fn synthetic_paths_table(n: usize, n_folds: usize, with_dtm: bool) -> PathsTable {
    let entries = (0..n)
        .map(|i| PathsEntry {
            id: format!("patient_{:03}", i),
            fold: i % n_folds,
            images: vec![PathBuf::from(format!("images/patient_{:03}.npy", i))],
            label: PathBuf::from(format!("labels/patient_{:03}.npy", i)),
            dtm: with_dtm.then(|| PathBuf::from(format!("dtms/patient_{:03}.npy", i))),
        })
        .collect();
    PathsTable { entries }
}
