//! Training loop orchestration.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use super::checkpoint::{load_checkpoint, save_checkpoint};
use super::data_loader::{DataLoader, ImageFolderDataset};
use super::ema::{update_ema_model, EMAWarmup};
use super::image_utils::save_image;
use super::lr_scheduler::{ConstantWithWarmup, LRScheduler};
use super::{AdamW, Config};
use crate::diffusion::{
    get_sigmas_karras, sample_heun, ChurnConfig, ConditioningContext, CosineInterpolatedSampler,
    DenoisingNetwork, KarrasDiffusion,
};

/// Schedule length for periodic preview sampling.
const SAMPLE_STEPS: usize = 50;
const SCHEDULE_RHO: f64 = 7.0;

/// Resolve the compute device from the configured ordinal; negative means
/// CPU.
pub fn resolve_device(device_id: i64) -> Result<Device> {
    if device_id >= 0 {
        Ok(Device::new_cuda(device_id as usize)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Drives the whole training procedure: batch pull, noise-level sampling,
/// loss, gradient step, EMA update, and the periodic logging / sampling /
/// checkpointing side tasks.
///
/// The trained model has a single writer (the optimizer step) and the EMA
/// shadow has a single writer (the EMA update, strictly after the optimizer
/// step), so no locking is involved anywhere.
pub struct Trainer<N: DenoisingNetwork> {
    config: Config,
    device: Device,
    model: KarrasDiffusion<N>,
    ema_model: KarrasDiffusion<N>,

    // Cached name -> Var maps; the Vars share storage with the models.
    params: HashMap<String, Var>,
    buffers: HashMap<String, Var>,
    ema_params: HashMap<String, Var>,
    ema_buffers: HashMap<String, Var>,

    optimizer: AdamW,
    lr_scheduler: ConstantWithWarmup,
    ema_scheduler: EMAWarmup,
    noise_sampler: CosineInterpolatedSampler,
    loader: DataLoader,
    rng: StdRng,
    step: usize,
}

impl<N: DenoisingNetwork> Trainer<N> {
    pub fn new(
        config: Config,
        model: KarrasDiffusion<N>,
        ema_model: KarrasDiffusion<N>,
    ) -> Result<Self> {
        config.validate()?;

        info!("Set log dir to {}", config.log_dir.display());
        fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log dir: {}", config.log_dir.display()))?;

        let device = resolve_device(config.device_id)?;

        let optimizer = AdamW::with_params(
            config.optimizer.lr,
            config.optimizer.betas[0],
            config.optimizer.betas[1],
            config.optimizer.eps,
            config.optimizer.weight_decay,
        );
        let lr_scheduler = ConstantWithWarmup::new(config.optimizer.lr, config.lr_scheduler.warmup);
        let ema_scheduler = EMAWarmup::new(1.0, config.ema.power, 0.0, config.ema.max_value);

        let noise_sampler = CosineInterpolatedSampler::new(
            config.image_size,
            config.sampler.noise_d_low,
            config.sampler.sigma_data,
            config.sampler.sigma_min,
            config.sampler.sigma_max,
        )?;

        let dataset = ImageFolderDataset::new(
            &config.dataset.root,
            config.image_size,
            &config.dataset.extension,
        )?;
        let loader = DataLoader::new(
            dataset,
            config.dataset.batch_size,
            config.dataset.num_workers,
            config.seed,
        )?;

        let params = model.named_parameters();
        let buffers = model.named_buffers();
        let ema_params = ema_model.named_parameters();
        let ema_buffers = ema_model.named_buffers();

        // The shadow starts as an exact copy of the trained model; this also
        // verifies the two topologies agree before any training happens.
        update_ema_model(&params, &ema_params, &buffers, &ema_buffers, 0.0)?;

        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            device,
            model,
            ema_model,
            params,
            buffers,
            ema_params,
            ema_buffers,
            optimizer,
            lr_scheduler,
            ema_scheduler,
            noise_sampler,
            loader,
            rng,
            step: 0,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Continue from a checkpoint directory written by a previous run.
    ///
    /// Restores parameters, EMA shadow, optimizer moments, the step counter
    /// and the EMA warmup state; a topology mismatch aborts without touching
    /// anything.
    pub fn resume(&mut self, dir: &Path) -> Result<()> {
        let (step, ema_warmup) = load_checkpoint(
            dir,
            &self.params,
            &self.buffers,
            &self.ema_params,
            &self.ema_buffers,
            &mut self.optimizer,
            &self.device,
        )?;
        self.step = step;
        self.ema_scheduler = ema_warmup;
        Ok(())
    }

    pub fn fit(&mut self) -> Result<()> {
        info!("Start training ...");
        let start_time = Instant::now();
        let ctx = ConditioningContext::none();

        while self.step < self.config.max_steps {
            // The loader re-iterates epochs internally; this blocks until a
            // prefetched batch is ready.
            let batch = self.loader.next_batch()?.to_device(&self.device)?;
            let noise = batch.randn_like(0.0, 1.0)?;
            let sigma =
                self.noise_sampler
                    .sample(batch.dims()[0], &mut self.rng, &self.device)?;

            let loss = self.model.loss(&batch, &noise, &sigma, &ctx)?.mean_all()?;

            let grads = loss.backward()?;
            self.optimizer.set_lr(self.lr_scheduler.get_lr(self.step));
            self.optimizer.step();
            self.optimizer.update_all(&self.params, &grads)?;
            // Gradients are freed here; nothing accumulates across steps.
            drop(grads);

            self.step += 1;

            // EMA update, strictly after the optimizer step. All arithmetic
            // is on detached tensors.
            let ema_decay = self.ema_scheduler.value();
            update_ema_model(
                &self.params,
                &self.ema_params,
                &self.buffers,
                &self.ema_buffers,
                ema_decay,
            )?;
            self.ema_scheduler.step();

            if self.step % self.config.log_every_step == 0 {
                info!(
                    "Step {} / {} , Loss : {:.6} , Elapsed time : {:.3} [sec]",
                    self.step,
                    self.config.max_steps,
                    loss.to_scalar::<f32>()?,
                    start_time.elapsed().as_secs_f64()
                );
            }

            if self.step % self.config.sample_every_step == 0 {
                self.generate_samples()?;
            }

            if self.step % self.config.checkpoint_every_step == 0 {
                self.save_checkpoint()?;
            }
        }

        info!("Training complete");
        Ok(())
    }

    /// Draw previews from the EMA model over a fixed Karras schedule and
    /// write them under the log directory.
    fn generate_samples(&self) -> Result<()> {
        info!("Sampling ...");

        let c = self.config.model.in_channels;
        let size = self.config.image_size;
        let x = (Tensor::randn(
            0f32,
            1f32,
            (self.config.n_samples, c, size, size),
            &self.device,
        )? * self.config.sampler.sigma_max)?;

        let sigmas = get_sigmas_karras(
            SAMPLE_STEPS,
            self.config.sampler.sigma_min,
            self.config.sampler.sigma_max,
            SCHEDULE_RHO,
        )?;
        let sampled = sample_heun(
            &self.ema_model,
            x,
            &sigmas,
            &ChurnConfig::default(),
            &ConditioningContext::none(),
        )?;

        let sample_dir = self
            .config
            .log_dir
            .join("samples")
            .join(format!("step_{:06}", self.step));
        fs::create_dir_all(&sample_dir)?;
        for i in 0..self.config.n_samples {
            save_image(&sampled.get(i)?, sample_dir.join(format!("sample_{i}.png")))?;
        }

        info!("Done.");
        Ok(())
    }

    fn save_checkpoint(&self) -> Result<()> {
        let dir = self
            .config
            .log_dir
            .join("checkpoints")
            .join(format!("checkpoint-{}", self.step));
        save_checkpoint(
            &dir,
            &self.params,
            &self.buffers,
            &self.ema_params,
            &self.ema_buffers,
            &self.optimizer,
            &self.ema_scheduler,
            self.step,
        )
    }
}
