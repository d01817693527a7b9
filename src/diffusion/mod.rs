//! Karras (EDM) diffusion engine: preconditioning, schedules, samplers.

pub mod heun;
pub mod karras;
pub mod noise_sampler;
pub mod schedule;
pub mod weighting;

pub use heun::{sample_heun, ChurnConfig};
pub use karras::{ConditioningContext, DenoisingNetwork, KarrasDiffusion, NetworkOutput};
pub use noise_sampler::CosineInterpolatedSampler;
pub use schedule::get_sigmas_karras;
pub use weighting::WeightingKind;

use anyhow::Result;
use candle_core::Tensor;

/// Fatal error classes of the diffusion engine.
///
/// Configuration and numerical failures are never recovered from at this
/// layer; the process halts so an operator can inspect and restart from the
/// last checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("non-finite value in {0}")]
    NonFinite(String),

    #[error("checkpoint does not match model topology: {0}")]
    CheckpointMismatch(String),
}

/// Errors out if `t` contains a NaN or infinity.
///
/// The abs-sum probe propagates any non-finite element; clamping here would
/// mask preconditioning or schedule bugs, so the error is fatal.
pub fn ensure_finite(t: &Tensor, what: &str) -> Result<()> {
    let probe = t.abs()?.sum_all()?.to_scalar::<f32>()?;
    if !probe.is_finite() {
        return Err(DiffusionError::NonFinite(what.to_string()).into());
    }
    Ok(())
}
