pub mod adamw;
pub mod checkpoint;
pub mod data_loader;
pub mod ema;
pub mod image_utils;
pub mod lr_scheduler;
pub mod trainer;

// Re-export key types
pub use adamw::AdamW;
pub use data_loader::{DataLoader, ImageFolderDataset};
pub use ema::{update_ema_model, EMAWarmup};
pub use lr_scheduler::{ConstantWithWarmup, LRScheduler};
pub use trainer::Trainer;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::fs;

use crate::diffusion::{DiffusionError, WeightingKind};
use crate::models::DenoiserConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub seed: u64,
    /// CUDA device ordinal; negative selects the CPU.
    #[serde(default = "default_device_id")]
    pub device_id: i64,
    pub log_dir: PathBuf,
    pub image_size: usize,
    pub max_steps: usize,
    pub log_every_step: usize,
    pub sample_every_step: usize,
    pub checkpoint_every_step: usize,
    pub n_samples: usize,
    pub model: DenoiserConfig,
    pub dataset: DatasetConfig,
    pub sampler: SamplerConfig,
    pub optimizer: OptimizerConfig,
    pub lr_scheduler: LRSchedulerConfig,
    pub ema: EmaConfig,
}

fn default_device_id() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub extension: String,
    pub batch_size: usize,
    pub num_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub sigma_data: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub noise_d_low: f64,
    pub weighting: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub lr: f64,
    pub betas: [f64; 2],
    pub eps: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LRSchedulerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub warmup: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaConfig {
    pub power: f64,
    pub max_value: f64,
}

/// Closed set of supported optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adamw" => Ok(Self::AdamW),
            other => {
                Err(DiffusionError::Config(format!("unknown optimizer '{other}'")).into())
            }
        }
    }
}

/// Closed set of supported LR schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LRSchedulerKind {
    ConstantWithWarmup,
}

impl FromStr for LRSchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constant" => Ok(Self::ConstantWithWarmup),
            other => {
                Err(DiffusionError::Config(format!("unknown lr scheduler '{other}'")).into())
            }
        }
    }
}

impl Config {
    /// Pre-flight validation; every violation is fatal before any state is
    /// built. Required fields never fall back to silent defaults.
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(DiffusionError::Config("image_size must be > 0".into()).into());
        }
        if self.dataset.batch_size == 0 {
            return Err(DiffusionError::Config("dataset.batch_size must be > 0".into()).into());
        }
        if self.max_steps == 0 {
            return Err(DiffusionError::Config("max_steps must be > 0".into()).into());
        }
        if self.log_every_step == 0
            || self.sample_every_step == 0
            || self.checkpoint_every_step == 0
        {
            return Err(DiffusionError::Config(
                "log/sample/checkpoint intervals must be > 0".into(),
            )
            .into());
        }
        if self.sampler.sigma_data <= 0.0 {
            return Err(DiffusionError::Config("sampler.sigma_data must be > 0".into()).into());
        }
        if self.sampler.sigma_min <= 0.0 || self.sampler.sigma_max <= self.sampler.sigma_min {
            return Err(DiffusionError::Config(format!(
                "invalid sigma range [{}, {}]",
                self.sampler.sigma_min, self.sampler.sigma_max
            ))
            .into());
        }
        if !(0.0..1.0).contains(&self.lr_scheduler.warmup) {
            return Err(
                DiffusionError::Config("lr_scheduler.warmup must be in [0, 1)".into()).into(),
            );
        }

        // Enumerated kinds fail fast at load, not at first use.
        self.sampler.weighting.parse::<WeightingKind>()?;
        self.optimizer.kind.parse::<OptimizerKind>()?;
        self.lr_scheduler.kind.parse::<LRSchedulerKind>()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            seed: 42,
            device_id: -1,
            log_dir: PathBuf::from("runs/test"),
            image_size: 32,
            max_steps: 1000,
            log_every_step: 10,
            sample_every_step: 100,
            checkpoint_every_step: 500,
            n_samples: 4,
            model: DenoiserConfig {
                in_channels: 3,
                channels: 32,
                depth: 2,
                mapping_cond_dim: None,
            },
            dataset: DatasetConfig {
                root: PathBuf::from("data"),
                extension: ".png".to_string(),
                batch_size: 8,
                num_workers: 2,
            },
            sampler: SamplerConfig {
                sigma_data: 0.5,
                sigma_min: 0.02,
                sigma_max: 80.0,
                noise_d_low: 16.0,
                weighting: "karras".to_string(),
            },
            optimizer: OptimizerConfig {
                kind: "adamw".to_string(),
                lr: 1e-4,
                betas: [0.9, 0.999],
                eps: 1e-8,
                weight_decay: 1e-3,
            },
            lr_scheduler: LRSchedulerConfig {
                kind: "constant".to_string(),
                warmup: 0.99,
            },
            ema: EmaConfig {
                power: 0.6667,
                max_value: 0.9999,
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn invalid_enum_tags_are_fatal() {
        let mut c = valid_config();
        c.sampler.weighting = "uniform".to_string();
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.optimizer.kind = "sgd".to_string();
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.lr_scheduler.kind = "cosine".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn invalid_sigma_bounds_are_fatal() {
        let mut c = valid_config();
        c.sampler.sigma_min = 0.0;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.sampler.sigma_max = c.sampler.sigma_min;
        assert!(c.validate().is_err());

        let mut c = valid_config();
        c.sampler.sigma_data = -0.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() -> Result<()> {
        let c = valid_config();
        let yaml = serde_yaml::to_string(&c)?;
        let back: Config = serde_yaml::from_str(&yaml)?;
        back.validate()?;
        assert_eq!(back.max_steps, c.max_steps);
        assert_eq!(back.sampler.weighting, c.sampler.weighting);
        Ok(())
    }

    #[test]
    fn missing_required_field_fails_to_parse() {
        // No silent defaults for required values.
        let yaml = "seed: 1\nimage_size: 32\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
