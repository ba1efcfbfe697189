use std::io::Cursor;

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, ImageFormat};

use crate::{Error, Result};

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(Error::Candle(candle_core::Error::Msg(format!(
            "tensor_to_image expects an image with 3 channels, got {channels}"
        ))));
    }
    let img = img
        .to_device(&Device::Cpu)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::Msg("error converting tensor to image buffer".into()))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an RGB image into a (1, 3, height, width) f32 tensor scaled to [-1, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let pixels = img.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(pixels, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_device(device)?;
    Ok(tensor)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
