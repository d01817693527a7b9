//! Training-time noise-level distribution.
//!
//! Noise levels are drawn through a cosine log-SNR schedule interpolated
//! between two resolution-shifted variants, following the interpolated
//! schedule of Hoogeboom et al. ("Simple diffusion").

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::Rng;

use super::DiffusionError;

/// Cosine log-SNR schedule over t in [0, 1]; t = 0 maps to `logsnr_max`,
/// t = 1 to `logsnr_min`.
pub fn log_snr_schedule_cosine(t: f64, logsnr_min: f64, logsnr_max: f64) -> f64 {
    let t_min = (-0.5 * logsnr_max).exp().atan();
    let t_max = (-0.5 * logsnr_min).exp().atan();
    -2.0 * (t_min + t * (t_max - t_min)).tan().ln()
}

/// Cosine schedule shifted for a noise resolution `noise_d` relative to the
/// image resolution `image_d`.
pub fn log_snr_schedule_cosine_shifted(
    t: f64,
    image_d: f64,
    noise_d: f64,
    logsnr_min: f64,
    logsnr_max: f64,
) -> f64 {
    let shift = 2.0 * (noise_d / image_d).ln();
    log_snr_schedule_cosine(t, logsnr_min - shift, logsnr_max - shift) + shift
}

/// Linear interpolation between the low- and high-resolution shifted
/// schedules. Equal `noise_d_low`/`noise_d_high` degenerate to a single
/// shifted schedule.
pub fn log_snr_schedule_cosine_interpolated(
    t: f64,
    image_d: f64,
    noise_d_low: f64,
    noise_d_high: f64,
    logsnr_min: f64,
    logsnr_max: f64,
) -> f64 {
    let low = log_snr_schedule_cosine_shifted(t, image_d, noise_d_low, logsnr_min, logsnr_max);
    let high = log_snr_schedule_cosine_shifted(t, image_d, noise_d_high, logsnr_min, logsnr_max);
    low + (high - low) * t
}

/// Draws per-example training noise levels without gradient tracking.
pub struct CosineInterpolatedSampler {
    image_d: f64,
    noise_d_low: f64,
    noise_d_high: f64,
    sigma_data: f64,
    min_value: f64,
    max_value: f64,
}

impl CosineInterpolatedSampler {
    /// `min_value`/`max_value` bound the sampled sigmas; the training range
    /// is widened beyond the sampling-schedule range so the model also sees
    /// extreme noise levels.
    pub fn new(
        image_size: usize,
        noise_d_low: f64,
        sigma_data: f64,
        sigma_min: f64,
        sigma_max: f64,
    ) -> Result<Self> {
        if image_size == 0 || noise_d_low <= 0.0 {
            return Err(DiffusionError::Config(format!(
                "invalid noise sampler dimensions: image_size={image_size}, noise_d_low={noise_d_low}"
            ))
            .into());
        }
        if sigma_min <= 0.0 || sigma_max <= sigma_min || sigma_data <= 0.0 {
            return Err(DiffusionError::Config(format!(
                "invalid sigma configuration [{sigma_min}, {sigma_max}], sigma_data={sigma_data}"
            ))
            .into());
        }
        Ok(Self {
            image_d: image_size as f64,
            noise_d_low,
            noise_d_high: image_size as f64,
            sigma_data,
            min_value: sigma_min.min(1e-3),
            max_value: sigma_max.max(1e3),
        })
    }

    /// One sigma for a uniform draw `u` in [0, 1).
    pub fn sigma_for(&self, u: f64) -> f64 {
        let logsnr_min = -2.0 * (self.min_value / self.sigma_data).ln();
        let logsnr_max = -2.0 * (self.max_value / self.sigma_data).ln();
        let logsnr = log_snr_schedule_cosine_interpolated(
            u,
            self.image_d,
            self.noise_d_low,
            self.noise_d_high,
            logsnr_min,
            logsnr_max,
        );
        (-logsnr / 2.0).exp() * self.sigma_data
    }

    /// A `[batch]` tensor of noise levels.
    pub fn sample(&self, batch: usize, rng: &mut impl Rng, device: &Device) -> Result<Tensor> {
        let sigmas: Vec<f32> = (0..batch)
            .map(|_| self.sigma_for(rng.gen::<f64>()) as f32)
            .collect();
        Ok(Tensor::from_vec(sigmas, &[batch], device)?)
    }
}
