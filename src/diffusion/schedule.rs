//! Noise-level schedules for sampling.

use anyhow::Result;

use super::DiffusionError;

/// Karras rho-schedule: `n` strictly decreasing noise levels from
/// `sigma_max` down to `sigma_min`, followed by a terminal zero.
///
/// The returned sequence has length `n + 1` and is created fresh per
/// sampling call.
pub fn get_sigmas_karras(n: usize, sigma_min: f64, sigma_max: f64, rho: f64) -> Result<Vec<f64>> {
    if n < 1 {
        return Err(DiffusionError::Config("schedule needs at least one step".to_string()).into());
    }
    if sigma_min <= 0.0 || sigma_max <= sigma_min {
        return Err(DiffusionError::Config(format!(
            "invalid sigma range [{sigma_min}, {sigma_max}]"
        ))
        .into());
    }

    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);

    let mut sigmas = Vec::with_capacity(n + 1);
    for k in 0..n {
        let ramp = if n == 1 { 0.0 } else { k as f64 / (n - 1) as f64 };
        sigmas.push((max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho));
    }
    sigmas.push(0.0);
    Ok(sigmas)
}
