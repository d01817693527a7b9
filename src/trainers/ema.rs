//! EMA decay scheduling and parameter averaging.

use anyhow::Result;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::diffusion::DiffusionError;

/// Warmup curve for the EMA decay rate.
///
/// `value()` follows `1 - (1 + epoch/inv_gamma)^(-power)` clamped to
/// `[min_value, max_value]`; `step()` advances `last_epoch` and is called
/// exactly once per optimizer step. Only `last_epoch` mutates during
/// training; the whole state serializes verbatim into checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EMAWarmup {
    inv_gamma: f64,
    power: f64,
    min_value: f64,
    max_value: f64,
    start_at: i64,
    last_epoch: i64,
}

impl EMAWarmup {
    pub fn new(inv_gamma: f64, power: f64, min_value: f64, max_value: f64) -> Self {
        Self {
            inv_gamma,
            power,
            min_value,
            max_value,
            start_at: 0,
            last_epoch: 0,
        }
    }

    pub fn value(&self) -> f64 {
        let epoch = (self.last_epoch - self.start_at).max(0);
        let value = 1.0 - (1.0 + epoch as f64 / self.inv_gamma).powf(-self.power);
        value.clamp(self.min_value, self.max_value)
    }

    pub fn step(&mut self) {
        self.last_epoch += 1;
    }

    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }
}

/// Folds the trained parameters into the EMA shadow.
///
/// Parameters are matched by name and lerped:
/// `ema = ema * decay + param * (1 - decay)`. Buffers are copied exactly,
/// never averaged. A mismatch between the two name sets means the shadow is
/// not the same topology, which is fatal.
///
/// All arithmetic happens on detached tensors so no gradient graph is
/// retained.
pub fn update_ema_model(
    params: &HashMap<String, Var>,
    ema_params: &HashMap<String, Var>,
    buffers: &HashMap<String, Var>,
    ema_buffers: &HashMap<String, Var>,
    decay: f64,
) -> Result<()> {
    if params.len() != ema_params.len() {
        return Err(DiffusionError::CheckpointMismatch(format!(
            "parameter count mismatch: {} vs {}",
            params.len(),
            ema_params.len()
        ))
        .into());
    }

    for (name, param) in params {
        let ema = ema_params.get(name).ok_or_else(|| {
            DiffusionError::CheckpointMismatch(format!("ema model is missing parameter '{name}'"))
        })?;
        let averaged = ((ema.as_tensor().detach() * decay)?
            + (param.as_tensor().detach() * (1.0 - decay))?)?;
        ema.set(&averaged)?;
    }

    if buffers.len() != ema_buffers.len() {
        return Err(DiffusionError::CheckpointMismatch(format!(
            "buffer count mismatch: {} vs {}",
            buffers.len(),
            ema_buffers.len()
        ))
        .into());
    }

    for (name, buffer) in buffers {
        let ema = ema_buffers.get(name).ok_or_else(|| {
            DiffusionError::CheckpointMismatch(format!("ema model is missing buffer '{name}'"))
        })?;
        ema.set(&buffer.as_tensor().detach())?;
    }

    Ok(())
}
