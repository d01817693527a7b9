pub mod denoiser;

pub use denoiser::{ConvDenoiser, DenoiserConfig};
