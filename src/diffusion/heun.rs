//! Heun (2nd order) ODE sampler with optional stochastic churn.

use anyhow::Result;
use candle_core::Tensor;

use super::{ensure_finite, ConditioningContext, DenoisingNetwork, DiffusionError, KarrasDiffusion};

/// Stochastic churn settings. The defaults give the fully deterministic
/// second-order method.
#[derive(Debug, Clone)]
pub struct ChurnConfig {
    pub s_churn: f64,
    pub s_tmin: f64,
    pub s_tmax: f64,
    pub s_noise: f64,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: f64::INFINITY,
            s_noise: 1.0,
        }
    }
}

/// Integrates the probability-flow ODE from `x` at `sigmas[0]` down to the
/// terminal zero, returning the generated sample.
///
/// One transition per schedule step: optional noise injection (churn), a
/// first derivative evaluation, and either a plain Euler step into the
/// terminal sigma = 0 (a second evaluation there would divide by zero in
/// `to_d`) or a second-order correction. The loop either completes all steps
/// or fails on the first non-finite intermediate; nothing is clamped and no
/// partial sample is returned.
pub fn sample_heun<N: DenoisingNetwork>(
    model: &KarrasDiffusion<N>,
    x: Tensor,
    sigmas: &[f64],
    churn: &ChurnConfig,
    ctx: &ConditioningContext,
) -> Result<Tensor> {
    if sigmas.len() < 2 {
        return Err(DiffusionError::Config(
            "sampling schedule needs at least two noise levels".to_string(),
        )
        .into());
    }

    let b = x.dims()[0];
    let n = sigmas.len() - 1;
    let mut x = x.detach();

    for i in 0..n {
        let sigma_i = sigmas[i];
        let sigma_next = sigmas[i + 1];

        let gamma = if churn.s_tmin <= sigma_i && sigma_i <= churn.s_tmax {
            (churn.s_churn / n as f64).min(std::f64::consts::SQRT_2 - 1.0)
        } else {
            0.0
        };

        let sigma_hat = sigma_i * (1.0 + gamma);
        if gamma > 0.0 {
            let eps = (x.randn_like(0.0, 1.0)? * churn.s_noise)?;
            let extra = (sigma_hat * sigma_hat - sigma_i * sigma_i).sqrt();
            x = (x + (eps * extra)?)?;
        }

        let sigma_hat_t = Tensor::full(sigma_hat as f32, (b,), x.device())?;
        let denoised = model.forward(&x, &sigma_hat_t, ctx)?;
        let d = KarrasDiffusion::<N>::to_d(&x, &sigma_hat_t, &denoised)?;

        let dt = sigma_next - sigma_hat;

        if sigma_next == 0.0 {
            // Terminal Euler step; no second evaluation at sigma = 0.
            x = (x + (d * dt)?)?;
        } else {
            let x_2 = (&x + (&d * dt)?)?;
            let sigma_next_t = Tensor::full(sigma_next as f32, (b,), x.device())?;
            let denoised_2 = model.forward(&x_2, &sigma_next_t, ctx)?;
            let d_2 = KarrasDiffusion::<N>::to_d(&x_2, &sigma_next_t, &denoised_2)?;
            let d_prime = ((&d + &d_2)? / 2.0)?;
            x = (x + (d_prime * dt)?)?;
        }

        ensure_finite(&x, &format!("heun sampler at step {i}"))?;
        x = x.detach();
    }

    Ok(x)
}
