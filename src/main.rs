//! drivedro: group-robust training driver for a motion-planning model.
//!
//! Subcommands:
//!
//! - `train`   -- Run a training loop under the configured DRO scheme
//! - `weights` -- Inspect per-group sampler weights and reward scales

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drivedro::config::{DriveDroConfig, TrainScheme};
use drivedro::driver::TrainingDriver;
use drivedro::sampling::sample_weights;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// drivedro: group-robust training driver for a motion-planning model.
#[derive(Parser)]
#[command(name = "drivedro", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a training loop under the configured scheme.
    Train {
        /// Override the training scheme from the config file.
        #[arg(long, value_enum)]
        scheme: Option<TrainScheme>,

        /// Override the number of training steps.
        #[arg(long)]
        steps: Option<usize>,

        /// Write the final training summary as JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the per-group sampler weights and reward scales.
    Weights,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<DriveDroConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => DriveDroConfig::default(),
    };

    match cli.command {
        Commands::Train {
            scheme,
            steps,
            output,
        } => cmd_train(config, scheme, steps, output.as_deref()),
        Commands::Weights => cmd_weights(&config),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_train(
    mut config: DriveDroConfig,
    scheme: Option<TrainScheme>,
    steps: Option<usize>,
    output: Option<&std::path::Path>,
) -> Result<()> {
    if let Some(scheme) = scheme {
        config.scheme = scheme;
    }
    if let Some(steps) = steps {
        config.train.steps = steps;
    }

    let mut driver = TrainingDriver::new(config)?;
    let summary = driver.run()?;

    if let Some(path) = output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Saved training summary");
    }

    println!("scheme: {}", summary.scheme);
    println!("steps:  {}", summary.steps);
    println!("loss:   {:.6}", summary.final_loss);
    for (key, value) in &summary.final_stats {
        println!("  {key}: {value:.6}");
    }
    Ok(())
}

fn cmd_weights(config: &DriveDroConfig) -> Result<()> {
    config.validate()?;

    // One representative example per group shows the balanced sampler weight
    // each of that group's examples carries.
    let one_of_each: Vec<usize> = (0..config.groups.num_groups()).collect();
    let weights = sample_weights(&one_of_each, &config.groups.counts);

    println!("Groups ({}):", config.groups.num_groups());
    for g in 0..config.groups.num_groups() {
        println!(
            "  {name}: count={count} sampler_weight={weight:.3e} reward_scale={scale}",
            name = config.groups.names[g],
            count = config.groups.counts[g],
            weight = weights[g],
            scale = config.groups.reward_scale[g],
        );
    }
    Ok(())
}
