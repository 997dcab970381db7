//! # voxtrain
//!
//! Distributed multi-fold training for 3D segmentation models.
//!
//! ## Architecture Overview
//!
//! - **Orchestration**: one symmetric worker process per device; rank 0 is
//!   the designated writer for checkpoints, console status, and metrics
//! - **Collectives**: TCP process group with scalar reduce, gradient
//!   all-reduce, and barriers at every epoch and fold boundary
//! - **Loss**: composite engine stacking deep supervision, boundary-loss
//!   scheduling, VAE regularization, and parameter-norm penalties
//! - **Precision**: optional mixed-precision stepping with adaptive loss
//!   scaling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voxtrain::config::RunConfig;
//! use voxtrain::data::{synthetic_paths_table, SyntheticProvider};
//! use voxtrain::model::DefaultModelFactory;
//! use voxtrain::trainer::Trainer;
//! use voxtrain_core::DatasetDescription;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = RunConfig::smoke_test();
//! let dataset = DatasetDescription {
//!     name: "demo".into(),
//!     images: vec!["ct".into()],
//!     labels: vec![0, 1],
//! };
//! let factory = DefaultModelFactory;
//! let provider = SyntheticProvider::new(1, [32, 32, 32]);
//! let trainer = Trainer::new(
//!     config,
//!     &dataset,
//!     synthetic_paths_table(10, 5, false),
//!     "results".into(),
//!     &factory,
//!     &provider,
//! )?;
//! trainer.run_worker(0, 1)?;
//! # Ok(())
//! # }
//! ```

pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dist;
pub mod error;
pub mod infer;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod replica;
pub mod schedule;
pub mod trainer;

pub use error::{TrainError, TrainResult};
