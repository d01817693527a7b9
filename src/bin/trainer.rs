use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use edmdiffusion::diffusion::{KarrasDiffusion, WeightingKind};
use edmdiffusion::models::ConvDenoiser;
use edmdiffusion::trainers::trainer::resolve_device;
use edmdiffusion::trainers::{load_config, Trainer};

/// Trainer for Karras (EDM) diffusion models.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML training configuration
    config: PathBuf,

    /// Checkpoint directory to resume from
    #[arg(long)]
    resume: Option<PathBuf>,
}

fn main() -> Result<()> {
    edmdiffusion::logging::init_logger();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!("Loaded config from {}", args.config.display());

    let device = resolve_device(config.device_id)?;
    let weighting: WeightingKind = config.sampler.weighting.parse()?;

    // The trained model and its EMA shadow are two independent instances of
    // the same topology; the trainer copies parameters across at startup.
    let model = KarrasDiffusion::new(
        ConvDenoiser::new(&config.model, &device)?,
        config.sampler.sigma_data,
        weighting,
    )?;
    let ema_model = KarrasDiffusion::new(
        ConvDenoiser::new(&config.model, &device)?,
        config.sampler.sigma_data,
        weighting,
    )?;

    let n_params: usize = model
        .named_parameters()
        .values()
        .map(|v| v.as_tensor().elem_count())
        .sum();
    info!("Model parameters: {n_params}");

    let mut trainer = Trainer::new(config, model, ema_model)?;
    if let Some(checkpoint) = &args.resume {
        trainer.resume(checkpoint)?;
    }
    trainer.fit()?;

    info!("Bye.");
    Ok(())
}
