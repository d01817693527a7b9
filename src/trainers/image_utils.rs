//! Tensor <-> image conversions for dataset loading and preview saving.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use std::path::Path;

/// Load an image file as a `[3, height, width]` f32 tensor in [-1, 1],
/// resized to the requested square resolution.
pub fn load_image_to_tensor<P: AsRef<Path>>(
    path: P,
    size: usize,
    device: &Device,
) -> Result<Tensor> {
    let path = path.as_ref();
    let img = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .resize_exact(size as u32, size as u32, FilterType::CatmullRom)
        .to_rgb8();

    let data: Vec<f32> = img
        .into_raw()
        .into_iter()
        .map(|v| v as f32 / 127.5 - 1.0)
        .collect();

    // HWC -> CHW
    let tensor = Tensor::from_vec(data, &[size, size, 3], device)?.permute((2, 0, 1))?;
    Ok(tensor.contiguous()?)
}

/// Save a `[3, height, width]` tensor in [-1, 1] as an image file.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }

    // CHW -> HWC for the image crate
    let tensor = tensor.permute((1, 2, 0))?;
    let data = tensor.flatten_all()?.to_vec1::<u8>()?;

    let img = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(
        width as u32,
        height as u32,
        data,
    )
    .context("Failed to create image buffer")?;

    img.save(path.as_ref())
        .with_context(|| format!("Failed to save image: {}", path.as_ref().display()))?;
    Ok(())
}
