//! Computes the audio normalization stats for a new corpus.
//!
//! Runs the normal assembly with normalization switched off, takes the mean and standard
//! deviation of every example's grids and averages them. The printed audio values go into the
//! config as `mean` and `std`.

use std::{path::PathBuf, time::Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use mmbake::{sample_rng, Catalog, Dataset, DatasetConfig, FeatureGrid, Vocabulary};
use rayon::{iter::{IntoParallelIterator, ParallelIterator}, ThreadPoolBuilder};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Average per-example mean and std of the unnormalized grids")]
struct Args {
    /// Dataset configuration (TOML). Its normalization settings are ignored.
    #[arg(long)]
    config: PathBuf,

    #[arg(long)]
    catalog: String,

    #[arg(long)]
    labels: PathBuf,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 16)]
    threads: usize,
}

fn mean_std(grid: &FeatureGrid) -> (f64, f64) {
    let values = grid.as_slice();
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let start_time = Instant::now();

    let mut config = DatasetConfig::from_toml_file(&args.config)?;
    // Stats must come from the raw grids, and augmentation would skew them.
    config.skip_norm = true;
    config.noise = false;
    config.freqm = 0;
    config.timem = 0;
    config.mixup = 0.0;

    let dataset = Dataset::new(Catalog::from_glob(&args.catalog)?, Vocabulary::load(&args.labels)?, config)?;
    anyhow::ensure!(!dataset.is_empty(), "catalog '{}' has no records", args.catalog);

    let pb = ProgressBar::new(dataset.len() as u64);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:20.bold.dim} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
        .progress_chars("#>-"));
    pb.set_prefix("Measuring examples");

    let pool = ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()?;

    // (audio mean, audio std, roll mean, roll std) summed over examples.
    let sums = pool.install(|| {
        (0..dataset.len())
            .into_par_iter()
            .progress_with(pb)
            .map(|index| -> Result<[f64; 4]> {
                let example = dataset.get(index, &mut sample_rng(args.seed, index)).with_context(|| format!("cannot assemble example {}", index))?;
                let (audio_mean, audio_std) = mean_std(&example.audio);
                let (roll_mean, roll_std) = mean_std(&example.piano_roll);
                Ok([audio_mean, audio_std, roll_mean, roll_std])
            })
            .try_reduce(|| [0.0; 4], |a, b| Ok([a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]))
    })?;

    let n = dataset.len() as f64;
    println!("\nExamples measured: {} in {:?}", dataset.len(), start_time.elapsed());
    println!("audio:      mean = {:.4}, std = {:.4}", sums[0] / n, sums[1] / n);
    println!("piano roll: mean = {:.4}, std = {:.4}", sums[2] / n, sums[3] / n);

    Ok(())
}
