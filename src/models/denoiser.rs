//! Reference denoising network.
//!
//! A compact residual conv net with a Fourier-feature noise embedding. The
//! diffusion engine only sees it through the `DenoisingNetwork` trait; any
//! architecture honoring that contract can replace it.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{
    conv2d, group_norm, linear, linear_no_bias, Conv2d, Conv2dConfig, GroupNorm, Linear, Module,
    VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::diffusion::{ConditioningContext, DenoisingNetwork, NetworkOutput};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiserConfig {
    pub in_channels: usize,
    pub channels: usize,
    pub depth: usize,
    /// Width of the optional mapping-conditioning vector; absent means the
    /// network is unconditional.
    #[serde(default)]
    pub mapping_cond_dim: Option<usize>,
}

const EMB_FEATURES: usize = 128;
const NORM_GROUPS: usize = 8;

struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    emb_proj: Linear,
}

impl ResBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            norm1: group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm1"))?,
            conv1: conv2d(channels, channels, 3, conv_cfg, vb.pp("conv1"))?,
            norm2: group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm2"))?,
            conv2: conv2d(channels, channels, 3, conv_cfg, vb.pp("conv2"))?,
            emb_proj: linear(EMB_FEATURES, channels * 2, vb.pp("emb_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let b = x.dims()[0];
        let c = x.dims()[1];

        let h = self.conv1.forward(&self.norm1.forward(x)?.silu()?)?;

        // Per-channel scale/shift conditioning on the noise embedding.
        let scale_shift = self.emb_proj.forward(emb)?;
        let scale = scale_shift.narrow(1, 0, c)?.reshape((b, c, 1, 1))?;
        let shift = scale_shift.narrow(1, c, c)?.reshape((b, c, 1, 1))?;
        let h = self
            .norm2
            .forward(&h)?
            .broadcast_mul(&(scale + 1.0)?)?
            .broadcast_add(&shift)?;

        let h = self.conv2.forward(&h.silu()?)?;
        Ok((x + h)?)
    }
}

pub struct ConvDenoiser {
    var_map: VarMap,
    fourier_freqs: Var,
    time_in: Linear,
    time_out: Linear,
    mapping: Option<Linear>,
    conv_in: Conv2d,
    blocks: Vec<ResBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl ConvDenoiser {
    pub fn new(config: &DenoiserConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        // Frozen Fourier frequencies; a buffer, not a trainable parameter.
        // Kept outside the VarMap so the optimizer never sees it.
        let fourier_freqs =
            Var::from_tensor(&Tensor::randn(0f32, 1f32, (EMB_FEATURES / 2,), device)?)?;

        let time_in = linear(EMB_FEATURES, EMB_FEATURES, vb.pp("time_in"))?;
        let time_out = linear(EMB_FEATURES, EMB_FEATURES, vb.pp("time_out"))?;

        // No bias: an absent conditioning vector is exactly the zero vector.
        let mapping = match config.mapping_cond_dim {
            Some(dim) => Some(linear_no_bias(dim, EMB_FEATURES, vb.pp("mapping"))?),
            None => None,
        };

        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(config.in_channels, config.channels, 3, conv_cfg, vb.pp("conv_in"))?;

        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(ResBlock::new(config.channels, vb.pp(format!("block{i}")))?);
        }

        let norm_out = group_norm(NORM_GROUPS, config.channels, 1e-5, vb.pp("norm_out"))?;
        let conv_out = conv2d(config.channels, config.in_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            var_map,
            fourier_freqs,
            time_in,
            time_out,
            mapping,
            conv_in,
            blocks,
            norm_out,
            conv_out,
        })
    }

    /// Fourier-feature embedding of `c_noise = ln(sigma) / 4`.
    fn noise_embedding(&self, sigma: &Tensor) -> Result<Tensor> {
        let b = sigma.dims()[0];
        let c_noise = (sigma.log()? / 4.0)?.reshape((b, 1))?;
        let freqs = (self.fourier_freqs.as_tensor().reshape((1, EMB_FEATURES / 2))?
            * (2.0 * std::f64::consts::PI))?;
        let theta = c_noise.broadcast_mul(&freqs)?;
        Ok(Tensor::cat(&[theta.cos()?, theta.sin()?], 1)?)
    }
}

impl DenoisingNetwork for ConvDenoiser {
    fn forward(
        &self,
        input: &Tensor,
        sigma: &Tensor,
        ctx: &ConditioningContext,
    ) -> Result<NetworkOutput> {
        let features = self.noise_embedding(sigma)?;
        let mut emb = self.time_out.forward(&self.time_in.forward(&features)?.silu()?)?;

        if let (Some(mapping), Some(cond)) = (&self.mapping, &ctx.mapping_cond) {
            emb = (emb + mapping.forward(cond)?)?;
        }
        let emb = emb.silu()?;

        let mut h = self.conv_in.forward(input)?;
        for block in &self.blocks {
            h = block.forward(&h, &emb)?;
        }
        let output = self.conv_out.forward(&self.norm_out.forward(&h)?.silu()?)?;

        Ok(NetworkOutput {
            output,
            logvar: None,
        })
    }

    fn named_parameters(&self) -> HashMap<String, Var> {
        self.var_map.data().lock().unwrap().clone()
    }

    fn named_buffers(&self) -> HashMap<String, Var> {
        HashMap::from([("fourier_freqs".to_string(), self.fourier_freqs.clone())])
    }
}
