//! Karras preconditioning wrapper around a raw denoising network.
//!
//! The wrapper rescales the network input, output and a skip connection so
//! the effective training target has near-unit variance at every noise level
//! (Karras et al., "Elucidating the Design Space of Diffusion-Based
//! Generative Models").

use anyhow::Result;
use candle_core::{Tensor, Var};
use std::collections::HashMap;

use super::{ensure_finite, DiffusionError, WeightingKind};

/// Auxiliary conditioning passed through to the denoising network.
///
/// The diffusion engine never inspects these tensors; absent conditioning is
/// treated as zero conditioning by the network.
#[derive(Debug, Clone, Default)]
pub struct ConditioningContext {
    pub mapping_cond: Option<Tensor>,
    pub cross_cond: Option<Tensor>,
    pub cross_cond_padding: Option<Tensor>,
}

impl ConditioningContext {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Raw output of a denoising network.
pub struct NetworkOutput {
    pub output: Tensor,
    /// Optional per-example log-variance head; unused by the engine itself.
    pub logvar: Option<Tensor>,
}

/// The seam between the diffusion engine and the network architecture.
///
/// `forward` receives the pre-scaled input and the raw (unscaled) noise
/// levels as a `[batch]` tensor. Parameters and buffers are exposed by name
/// for the optimizer and the EMA averager.
pub trait DenoisingNetwork {
    fn forward(
        &self,
        input: &Tensor,
        sigma: &Tensor,
        ctx: &ConditioningContext,
    ) -> Result<NetworkOutput>;

    /// Trainable parameters keyed by a stable name.
    fn named_parameters(&self) -> HashMap<String, Var>;

    /// Non-trainable state keyed by a stable name, held in `Var` cells so
    /// the EMA averager and checkpoint restore can overwrite it in place.
    /// Never handed to the optimizer; copied, not averaged, into the EMA
    /// shadow.
    fn named_buffers(&self) -> HashMap<String, Var> {
        HashMap::new()
    }
}

/// A denoising network wrapped with EDM preconditioning.
///
/// Owns the inner network exclusively; the only sanctioned copy of its
/// parameters is the EMA shadow, which is a second `KarrasDiffusion` over an
/// independently constructed network of the same topology.
pub struct KarrasDiffusion<N> {
    inner: N,
    sigma_data: f64,
    weighting: WeightingKind,
}

impl<N: DenoisingNetwork> KarrasDiffusion<N> {
    pub fn new(inner: N, sigma_data: f64, weighting: WeightingKind) -> Result<Self> {
        if sigma_data <= 0.0 {
            return Err(
                DiffusionError::Config(format!("sigma_data must be > 0, got {sigma_data}")).into(),
            );
        }
        Ok(Self {
            inner,
            sigma_data,
            weighting,
        })
    }

    pub fn sigma_data(&self) -> f64 {
        self.sigma_data
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }

    pub fn named_parameters(&self) -> HashMap<String, Var> {
        self.inner.named_parameters()
    }

    pub fn named_buffers(&self) -> HashMap<String, Var> {
        self.inner.named_buffers()
    }

    /// Preconditioning factors for a batch of noise levels.
    ///
    /// Returns `(c_skip, c_out, c_in)`, each shaped like `sigma`. For all
    /// sigma >= 0: c_skip in (0, 1], c_out >= 0, c_in > 0, and
    /// c_skip(sigma_data) == 1/2 exactly.
    pub fn scaling(&self, sigma: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let sigma_data_squared = self.sigma_data * self.sigma_data;
        let denom = (sigma.sqr()? + sigma_data_squared)?;
        let denom_sqrt = denom.sqrt()?;

        let c_skip = (denom.recip()? * sigma_data_squared)?;
        let c_out = ((sigma * self.sigma_data)? / &denom_sqrt)?;
        let c_in = denom_sqrt.recip()?;
        Ok((c_skip, c_out, c_in))
    }

    /// Denoised prediction for `input` at noise levels `sigma` (`[batch]`).
    pub fn forward(
        &self,
        input: &Tensor,
        sigma: &Tensor,
        ctx: &ConditioningContext,
    ) -> Result<Tensor> {
        let b = input.dims()[0];
        let (c_skip, c_out, c_in) = self.scaling(sigma)?;

        let c_skip = c_skip.reshape((b, 1, 1, 1))?;
        let c_out = c_out.reshape((b, 1, 1, 1))?;
        let c_in = c_in.reshape((b, 1, 1, 1))?;

        let scaled = input.broadcast_mul(&c_in)?;
        let net_out = self.inner.forward(&scaled, sigma, ctx)?;

        let denoised =
            (net_out.output.broadcast_mul(&c_out)? + input.broadcast_mul(&c_skip)?)?;
        Ok(denoised)
    }

    /// Converts a denoised prediction into the instantaneous ODE drift
    /// `d = (x - denoised) / sigma`.
    ///
    /// Undefined at sigma = 0 (the clean-data limit); calling it there is a
    /// numerics error, not a value to clamp.
    pub fn to_d(x: &Tensor, sigma: &Tensor, denoised: &Tensor) -> Result<Tensor> {
        let sigmas = sigma.to_vec1::<f32>()?;
        if sigmas.iter().any(|&s| s == 0.0) {
            return Err(DiffusionError::NonFinite("to_d at sigma = 0".to_string()).into());
        }
        let b = x.dims()[0];
        let sigma = sigma.reshape((b, 1, 1, 1))?;
        Ok((x - denoised)?.broadcast_div(&sigma)?)
    }

    /// Per-example training loss.
    ///
    /// Noises the input at the given levels, denoises it, converts the
    /// prediction back to eps-space and returns the weighted mean squared
    /// residual over all non-batch dimensions, one scalar per example. The
    /// caller reduces over the batch for the optimizer step.
    pub fn loss(
        &self,
        input: &Tensor,
        noise: &Tensor,
        sigma: &Tensor,
        ctx: &ConditioningContext,
    ) -> Result<Tensor> {
        let b = input.dims()[0];
        let sigma_col = sigma.reshape((b, 1, 1, 1))?;

        let noised = (input + noise.broadcast_mul(&sigma_col)?)?;
        let denoised = self.forward(&noised, sigma, ctx)?;
        let eps = Self::to_d(&noised, sigma, &denoised)?;

        let per_example = (eps - noise)?.sqr()?.flatten_from(1)?.mean(1)?;
        let weights = self.weighting.weights(sigma, self.sigma_data)?;
        let weighted = (per_example * weights)?;
        ensure_finite(&weighted, "training loss")?;
        Ok(weighted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Network that predicts zero everywhere; under preconditioning the
    /// denoised output reduces to `x * c_skip`.
    struct ZeroNetwork;

    impl DenoisingNetwork for ZeroNetwork {
        fn forward(
            &self,
            input: &Tensor,
            _sigma: &Tensor,
            _ctx: &ConditioningContext,
        ) -> Result<NetworkOutput> {
            Ok(NetworkOutput {
                output: input.zeros_like()?,
                logvar: None,
            })
        }

        fn named_parameters(&self) -> HashMap<String, Var> {
            HashMap::new()
        }
    }

    fn sigma(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), &[values.len()], &Device::Cpu).unwrap()
    }

    #[test]
    fn rejects_non_positive_sigma_data() {
        assert!(KarrasDiffusion::new(ZeroNetwork, 0.0, WeightingKind::Karras).is_err());
        assert!(KarrasDiffusion::new(ZeroNetwork, -1.0, WeightingKind::Karras).is_err());
    }

    #[test]
    fn scaling_invariants() -> Result<()> {
        let model = KarrasDiffusion::new(ZeroNetwork, 0.5, WeightingKind::Karras)?;
        let (skip, out, c_in) = model.scaling(&sigma(&[0.0, 0.01, 0.5, 10.0, 1000.0]))?;
        let skip = skip.to_vec1::<f32>()?;
        let out = out.to_vec1::<f32>()?;
        let c_in = c_in.to_vec1::<f32>()?;

        for (&s, (&o, &i)) in skip.iter().zip(out.iter().zip(c_in.iter())) {
            assert!(s > 0.0 && s <= 1.0, "skip out of (0, 1]: {s}");
            assert!(o >= 0.0);
            assert!(i > 0.0);
        }
        // skip -> 1 in the clean-data limit, -> 0 at extreme noise.
        assert_eq!(skip[0], 1.0);
        assert!(skip[4] < 1e-5);
        Ok(())
    }

    #[test]
    fn skip_is_half_at_sigma_data() -> Result<()> {
        let model = KarrasDiffusion::new(ZeroNetwork, 0.5, WeightingKind::Karras)?;
        let (skip, _, _) = model.scaling(&sigma(&[0.5]))?;
        assert_eq!(skip.to_vec1::<f32>()?[0], 0.5);
        Ok(())
    }

    #[test]
    fn forward_of_zero_network_is_skip_scaled_input() -> Result<()> {
        let device = Device::Cpu;
        let model = KarrasDiffusion::new(ZeroNetwork, 1.0, WeightingKind::Karras)?;
        let x = Tensor::from_vec(vec![2.0f32; 2 * 3 * 4 * 4], &[2, 3, 4, 4], &device)?;
        // At sigma == sigma_data the skip factor is exactly one half.
        let denoised = model.forward(&x, &sigma(&[1.0, 1.0]), &ConditioningContext::none())?;
        let got = denoised.flatten_all()?.to_vec1::<f32>()?;
        assert!(got.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn to_d_matches_definition() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![3.0f32; 1 * 1 * 2 * 2], &[1, 1, 2, 2], &device)?;
        let denoised = Tensor::from_vec(vec![1.0f32; 4], &[1, 1, 2, 2], &device)?;
        let d = KarrasDiffusion::<ZeroNetwork>::to_d(&x, &sigma(&[2.0]), &denoised)?;
        let got = d.flatten_all()?.to_vec1::<f32>()?;
        assert!(got.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn to_d_rejects_zero_sigma() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros(&[1, 1, 2, 2], candle_core::DType::F32, &device)?;
        let err = KarrasDiffusion::<ZeroNetwork>::to_d(&x, &sigma(&[0.0]), &x).unwrap_err();
        assert!(err.is::<DiffusionError>());
        Ok(())
    }

    #[test]
    fn loss_applies_weighting_before_batch_reduction() -> Result<()> {
        // The weighting vector scales the per-example squared error; with
        // the karras weighting it is the identity.
        let device = Device::Cpu;
        let sigma_data = 0.5f64;
        let x = Tensor::from_vec(vec![0.25f32; 1 * 1 * 2 * 2], &[1, 1, 2, 2], &device)?;
        let noise = Tensor::from_vec(vec![1.0f32; 4], &[1, 1, 2, 2], &device)?;
        let s = sigma(&[2.0]);
        let ctx = ConditioningContext::none();

        let unweighted = KarrasDiffusion::new(ZeroNetwork, sigma_data, WeightingKind::Karras)?
            .loss(&x, &noise, &s, &ctx)?
            .to_vec1::<f32>()?[0];
        let weighted = KarrasDiffusion::new(ZeroNetwork, sigma_data, WeightingKind::SoftMinSnr)?
            .loss(&x, &noise, &s, &ctx)?
            .to_vec1::<f32>()?[0];

        let w = WeightingKind::SoftMinSnr
            .weights(&s, sigma_data)?
            .to_vec1::<f32>()?[0];
        assert!(w < 1.0);
        assert!((weighted - unweighted * w).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn loss_is_per_example() -> Result<()> {
        let device = Device::Cpu;
        let model = KarrasDiffusion::new(ZeroNetwork, 0.5, WeightingKind::Karras)?;
        let x = Tensor::zeros(&[3, 1, 4, 4], candle_core::DType::F32, &device)?;
        let noise = Tensor::randn(0f32, 1f32, (3, 1, 4, 4), &device)?;
        let loss = model.loss(&x, &noise, &sigma(&[0.1, 1.0, 10.0]), &ConditioningContext::none())?;
        assert_eq!(loss.dims(), &[3]);
        Ok(())
    }
}
