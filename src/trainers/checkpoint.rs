//! Training-state persistence.
//!
//! A checkpoint is a directory holding the model, the EMA shadow and the
//! optimizer moments as safetensors files, plus a JSON sidecar with the
//! scalar state (step counter, EMA warmup). Restoring reproduces the step
//! and warmup counters bit-identically so the LR and EMA curves continue
//! exactly where they left off.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor, Var};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::adamw::AdamW;
use super::ema::EMAWarmup;
use crate::diffusion::DiffusionError;

const MODEL_FILE: &str = "model.safetensors";
const EMA_MODEL_FILE: &str = "ema_model.safetensors";
const OPTIM_M_FILE: &str = "optim_m.safetensors";
const OPTIM_V_FILE: &str = "optim_v.safetensors";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Serialize, Deserialize)]
struct ScalarState {
    step: usize,
    optimizer_step: usize,
    ema_warmup: EMAWarmup,
}

fn tensors_of(vars: &HashMap<String, Var>) -> HashMap<String, Tensor> {
    vars.iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect()
}

/// Overwrites every `Var` with its checkpointed tensor. The name sets must
/// match exactly in both directions; a partial load is never performed.
fn apply_named(vars: &HashMap<String, Var>, loaded: &HashMap<String, Tensor>) -> Result<()> {
    let mut missing: Vec<&str> = vars
        .keys()
        .filter(|k| !loaded.contains_key(*k))
        .map(|k| k.as_str())
        .collect();
    let mut unexpected: Vec<&str> = loaded
        .keys()
        .filter(|k| !vars.contains_key(*k))
        .map(|k| k.as_str())
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        missing.sort();
        unexpected.sort();
        return Err(DiffusionError::CheckpointMismatch(format!(
            "missing {missing:?}, unexpected {unexpected:?}"
        ))
        .into());
    }

    for (name, var) in vars {
        var.set(&loaded[name])?;
    }
    Ok(())
}

/// Persist the full training state under `dir`.
#[allow(clippy::too_many_arguments)]
pub fn save_checkpoint(
    dir: &Path,
    params: &HashMap<String, Var>,
    buffers: &HashMap<String, Var>,
    ema_params: &HashMap<String, Var>,
    ema_buffers: &HashMap<String, Var>,
    optimizer: &AdamW,
    ema_warmup: &EMAWarmup,
    step: usize,
) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint dir: {}", dir.display()))?;

    // Buffers ride along in the same file as the parameters.
    let mut model = tensors_of(params);
    model.extend(tensors_of(buffers));
    candle_core::safetensors::save(&model, dir.join(MODEL_FILE))?;

    let mut ema_model = tensors_of(ema_params);
    ema_model.extend(tensors_of(ema_buffers));
    candle_core::safetensors::save(&ema_model, dir.join(EMA_MODEL_FILE))?;

    let (m, v) = optimizer.get_state_tensors();
    candle_core::safetensors::save(&m, dir.join(OPTIM_M_FILE))?;
    candle_core::safetensors::save(&v, dir.join(OPTIM_V_FILE))?;

    let state = ScalarState {
        step,
        optimizer_step: optimizer.get_step(),
        ema_warmup: ema_warmup.clone(),
    };
    fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&state)?)?;

    info!("Saved checkpoint to {}", dir.display());
    Ok(())
}

/// Restore a checkpoint saved by [`save_checkpoint`] into the given model,
/// EMA shadow and optimizer. Returns the restored step counter and EMA
/// warmup state.
#[allow(clippy::too_many_arguments)]
pub fn load_checkpoint(
    dir: &Path,
    params: &HashMap<String, Var>,
    buffers: &HashMap<String, Var>,
    ema_params: &HashMap<String, Var>,
    ema_buffers: &HashMap<String, Var>,
    optimizer: &mut AdamW,
    device: &Device,
) -> Result<(usize, EMAWarmup)> {
    let state: ScalarState = serde_json::from_str(
        &fs::read_to_string(dir.join(STATE_FILE))
            .with_context(|| format!("Failed to read checkpoint state: {}", dir.display()))?,
    )?;

    let mut expected: HashMap<String, Var> = params.clone();
    expected.extend(buffers.clone());
    let model = candle_core::safetensors::load(dir.join(MODEL_FILE), device)?;
    apply_named(&expected, &model)?;

    let mut ema_expected: HashMap<String, Var> = ema_params.clone();
    ema_expected.extend(ema_buffers.clone());
    let ema_model = candle_core::safetensors::load(dir.join(EMA_MODEL_FILE), device)?;
    apply_named(&ema_expected, &ema_model)?;

    let m = candle_core::safetensors::load(dir.join(OPTIM_M_FILE), device)?;
    let v = candle_core::safetensors::load(dir.join(OPTIM_V_FILE), device)?;
    optimizer.load_state_tensors(m, v);
    optimizer.set_step(state.optimizer_step);

    info!("Restored checkpoint from {} at step {}", dir.display(), state.step);
    Ok((state.step, state.ema_warmup))
}
