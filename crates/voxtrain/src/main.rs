//! CLI entry point for voxtrain.
//!
//! The launcher is SPMD: without `--rank` it spawns one child process of
//! itself per worker and waits; each child joins the process group and runs
//! the identical fold loop. A single-worker run executes inline.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context};
use clap::Parser;

use voxtrain::config::RunConfig;
use voxtrain::data::{DataProvider, PathsTable, RawVolumeProvider, SyntheticProvider};
use voxtrain::logging;
use voxtrain::model::DefaultModelFactory;
use voxtrain::trainer::Trainer;
use voxtrain_core::DatasetDescription;

#[derive(Debug, Parser)]
#[command(name = "voxtrain", about = "Distributed multi-fold segmentation training")]
struct Args {
    /// Path to the run configuration JSON.
    #[arg(long)]
    config: PathBuf,

    /// Path to the dataset description JSON.
    #[arg(long)]
    dataset: PathBuf,

    /// Path to the per-patient training paths table JSON.
    #[arg(long)]
    paths: PathBuf,

    /// Results directory for checkpoints and metric logs.
    #[arg(long)]
    results: PathBuf,

    /// Number of worker processes (one per device).
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Worker rank; set by the launcher when spawning children.
    #[arg(long, hide = true)]
    rank: Option<usize>,

    /// Preprocessed volume shape (depth height width) for the raw loader.
    #[arg(long, num_args = 3, default_values_t = [128, 128, 128])]
    volume_shape: Vec<usize>,

    /// Train on seeded synthetic volumes instead of files (smoke runs).
    #[arg(long)]
    synthetic_data: bool,

    /// Emit JSON logs instead of pretty console output.
    #[arg(long)]
    json_logs: bool,
}

fn run_worker(args: &Args, rank: usize) -> anyhow::Result<()> {
    let config = RunConfig::load(&args.config)?;
    let dataset = DatasetDescription::load(&args.dataset)?;
    let paths = PathsTable::load(&args.paths)?;

    let volume_shape = [
        args.volume_shape[0],
        args.volume_shape[1],
        args.volume_shape[2],
    ];
    let factory = DefaultModelFactory;
    let provider: Box<dyn DataProvider> = if args.synthetic_data {
        Box::new(SyntheticProvider::new(dataset.n_channels(), volume_shape))
    } else {
        Box::new(RawVolumeProvider::new(volume_shape))
    };
    let trainer = Trainer::new(
        config,
        &dataset,
        paths,
        args.results.clone(),
        &factory,
        provider.as_ref(),
    )?;
    trainer.run_worker(rank, args.workers)?;
    Ok(())
}

fn spawn_workers(args: &Args) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    let mut children = Vec::with_capacity(args.workers);
    for rank in 0..args.workers {
        let mut cmd = Command::new(&exe);
        cmd.arg("--config")
            .arg(&args.config)
            .arg("--dataset")
            .arg(&args.dataset)
            .arg("--paths")
            .arg(&args.paths)
            .arg("--results")
            .arg(&args.results)
            .arg("--workers")
            .arg(args.workers.to_string())
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--volume-shape");
        for dim in &args.volume_shape {
            cmd.arg(dim.to_string());
        }
        if args.synthetic_data {
            cmd.arg("--synthetic-data");
        }
        if args.json_logs {
            cmd.arg("--json-logs");
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("spawning worker rank {}", rank))?;
        children.push((rank, child));
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("waiting for worker rank {}", rank))?;
        if !status.success() {
            failed.push((rank, status));
        }
    }
    if !failed.is_empty() {
        bail!(
            "{} worker(s) failed: {:?}",
            failed.len(),
            failed
                .iter()
                .map(|(rank, status)| format!("rank {} ({})", rank, status))
                .collect::<Vec<_>>()
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.json_logs {
        logging::init_logging();
    } else {
        logging::init_console_logging();
    }

    if args.workers == 0 {
        bail!("--workers must be > 0");
    }

    match args.rank {
        Some(rank) => run_worker(&args, rank),
        None if args.workers == 1 => run_worker(&args, 0),
        None => spawn_workers(&args),
    }
}
