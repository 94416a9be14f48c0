//! SAE-rs CLI: train a sparse autoencoder on cached activations

use anyhow::Result;
use clap::Parser;
use sae_rs::{
    evaluate_feature_counts, ActivationBuffer, CachedActivations, DataLoadConfig, LayerSelection,
    SaeConfig, SaeTrainer, ShardedDataset, TracingSink,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-rs")]
#[command(about = "Sparse autoencoder training on cached transformer activations")]
#[command(version)]
struct Cli {
    /// Path to a JSON run config (missing fields take defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shard directory written by the activation cache
    #[arg(short, long)]
    shards: PathBuf,

    /// Checkpoint directory (overrides `checkpoint_path`)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stored layer to train on (defaults to the last one)
    #[arg(short, long)]
    layer: Option<usize>,

    /// Count feature firings over the whole dataset after training
    #[arg(long)]
    evaluate: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => SaeConfig::load(path)?,
        None => SaeConfig::default(),
    };
    if cli.cpu {
        config.device = "cpu".to_string();
    }
    if let Some(output) = &cli.output {
        config.checkpoint_path = output.clone();
    }

    println!("=== SAE-rs: sparse autoencoder training ===");
    println!("Shards: {}", cli.shards.display());
    println!("Hook:   {}", config.hook_point);
    println!("Output: {}", config.checkpoint_path.display());
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    let device = config.device()?;
    let selection = DataLoadConfig {
        layer: cli.layer.map_or(LayerSelection::Last, LayerSelection::Layer),
        tokens: config.token_selection,
    };
    let dataset = ShardedDataset::open(&cli.shards, selection, &device)?;
    anyhow::ensure!(
        dataset.metadata().d_model == config.d_in,
        "Shards hold d_model={} but config has d_in={}",
        dataset.metadata().d_model,
        config.d_in
    );

    let provider = CachedActivations::new(dataset, config.store_size)?;
    let mut store = ActivationBuffer::from_config(provider, &config)?;

    std::fs::create_dir_all(&config.checkpoint_path)?;
    config.save(&config.checkpoint_path.join("run_config.json"))?;

    let mut trainer = SaeTrainer::new(config.clone(), TracingSink)?;
    let summary = trainer.train(&mut store)?;

    println!("\n=== Results ===");
    println!("Steps:      {}", summary.state.steps);
    println!("Tokens:     {}", summary.state.tokens);
    println!(
        "Resampled:  {} features in {} events",
        summary.state.n_resampled_neurons, summary.state.n_resample_events
    );
    for paths in &summary.checkpoints {
        println!("Checkpoint: {}", paths.weights.display());
    }
    println!("Final:      {}", summary.final_checkpoint.weights.display());

    if cli.evaluate {
        info!("Evaluating feature firing counts...");
        let mut dataset = ShardedDataset::open(&cli.shards, selection, &device)?;
        let counts = evaluate_feature_counts(trainer.sae(), &mut dataset, config.train_batch_size)?;
        println!(
            "Dead features:  {} / {}",
            counts.dead.len(),
            counts.counts.len()
        );
        println!(
            "Dense features: {} / {}",
            counts.dense.len(),
            counts.counts.len()
        );
        let counts_path = config.checkpoint_path.join("feature_counts.json");
        std::fs::write(&counts_path, serde_json::to_string_pretty(&counts.counts)?)?;
        info!("Feature counts saved to {}", counts_path.display());
    }

    Ok(())
}
