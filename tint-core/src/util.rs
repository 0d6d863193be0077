use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use tracing::{info, warn};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Half precision on accelerators, full precision on the CPU.
pub fn inference_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Rounds both sides down to a multiple of 8, never below 64.
pub fn latent_aligned_size(width: u32, height: u32) -> (u32, u32) {
    let align = |side: u32| (side - side % 8).max(64);
    (align(width), align(height))
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = latent_aligned_size(img.width(), img.height());
    if (width, height) != (img.width(), img.height()) {
        info!(
            "resizing input image from {}x{} to {width}x{height}",
            img.width(),
            img.height()
        );
    }
    let img = img
        .resize_exact(width, height, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(img, (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_align_to_latent_grid() {
        assert_eq!(latent_aligned_size(512, 512), (512, 512));
        assert_eq!(latent_aligned_size(517, 770), (512, 768));
        assert_eq!(latent_aligned_size(1, 1), (64, 64));
    }

    #[test]
    fn image_tensor_round_trip() -> Result<()> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(64, 64, image::Rgb([255, 0, 0])));
        let tensor = image_to_tensor(&img, &Device::Cpu, DType::F32)?;
        assert_eq!(tensor.dims4()?, (1, 3, 64, 64));

        let back = ((tensor.squeeze(0)? + 1.0)? * 127.5)?.round()?.to_dtype(DType::U8)?;
        let back = tensor_to_image(&back)?;
        assert_eq!(back.to_rgb8().get_pixel(10, 10), &image::Rgb([255, 0, 0]));
        Ok(())
    }
}
