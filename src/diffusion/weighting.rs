//! Per-noise-level loss weighting strategies.

use anyhow::Result;
use candle_core::Tensor;
use std::str::FromStr;

use super::DiffusionError;

/// Closed set of loss weightings, resolved once at model construction.
///
/// An unknown tag is a configuration error; there is no silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightingKind {
    /// Unit weight for every noise level (the EDM default).
    Karras,
    /// `(sigma * sigma_data)^2 / (sigma^2 + sigma_data^2)^2`
    SoftMinSnr,
    /// `sigma_data^2 / (sigma^2 + sigma_data^2)`
    Snr,
}

impl FromStr for WeightingKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "karras" => Ok(Self::Karras),
            "soft_min_snr" => Ok(Self::SoftMinSnr),
            "snr" => Ok(Self::Snr),
            other => Err(DiffusionError::Config(format!(
                "unknown weighting '{other}', expected karras, soft_min_snr or snr"
            ))
            .into()),
        }
    }
}

impl WeightingKind {
    /// Weight vector for a batch of noise levels, same shape as `sigma`.
    pub fn weights(&self, sigma: &Tensor, sigma_data: f64) -> Result<Tensor> {
        let sigma_data_squared = sigma_data * sigma_data;
        let w = match self {
            Self::Karras => sigma.ones_like()?,
            Self::SoftMinSnr => {
                let num = (sigma * sigma_data)?.sqr()?;
                let denom = (sigma.sqr()? + sigma_data_squared)?.sqr()?;
                (num / denom)?
            }
            Self::Snr => {
                let denom = (sigma.sqr()? + sigma_data_squared)?;
                (denom.recip()? * sigma_data_squared)?
            }
        };
        Ok(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sigma(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), &[values.len()], &Device::Cpu).unwrap()
    }

    #[test]
    fn karras_weight_is_one() -> Result<()> {
        let w = WeightingKind::Karras.weights(&sigma(&[0.0, 0.5, 80.0]), 0.5)?;
        assert_eq!(w.to_vec1::<f32>()?, vec![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn soft_min_snr_matches_formula() -> Result<()> {
        let sigma_data = 0.5f64;
        let s = 0.5f64;
        let expected = ((s * sigma_data).powi(2) / (s * s + sigma_data * sigma_data).powi(2)) as f32;
        let w = WeightingKind::SoftMinSnr.weights(&sigma(&[s as f32]), sigma_data)?;
        let got = w.to_vec1::<f32>()?[0];
        assert!((got - expected).abs() < 1e-6, "{got} vs {expected}");
        Ok(())
    }

    #[test]
    fn snr_matches_formula() -> Result<()> {
        let sigma_data = 0.5f64;
        let s = 2.0f64;
        let expected = (sigma_data * sigma_data / (s * s + sigma_data * sigma_data)) as f32;
        let w = WeightingKind::Snr.weights(&sigma(&[s as f32]), sigma_data)?;
        let got = w.to_vec1::<f32>()?[0];
        assert!((got - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn unknown_tag_fails_fast() {
        let err = "minsnr".parse::<WeightingKind>().unwrap_err();
        assert!(err.is::<DiffusionError>());
    }

    #[test]
    fn known_tags_parse() -> Result<()> {
        assert_eq!("karras".parse::<WeightingKind>()?, WeightingKind::Karras);
        assert_eq!("soft_min_snr".parse::<WeightingKind>()?, WeightingKind::SoftMinSnr);
        assert_eq!("snr".parse::<WeightingKind>()?, WeightingKind::Snr);
        Ok(())
    }
}
