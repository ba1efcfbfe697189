use std::io::{BufReader, Read, Seek};

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};

use crate::{Folder, Result};

/// Base images are resized so their shorter side has this length, the
/// resolution Stable Diffusion v1 was trained at.
pub const BASE_IMAGE_MIN_SIZE: u32 = 512;

/// Opens `image_path` from `folder` as an RGB image.
pub fn open_base_image(
    folder: &dyn Folder,
    image_path: &str,
    resize: bool,
) -> Result<DynamicImage> {
    let mut bytes = Vec::new();
    folder.reader(image_path)?.read_to_end(&mut bytes)?;
    let image = decode(std::io::Cursor::new(bytes))?;

    let image = match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };

    if resize {
        Ok(resize_image(&image, BASE_IMAGE_MIN_SIZE))
    } else {
        Ok(image)
    }
}

fn decode<R: Read + Seek>(reader: R) -> Result<DynamicImage> {
    Ok(ImageReader::new(BufReader::new(reader))
        .with_guessed_format()?
        .decode()?)
}

/// Resizes `image` so that its shorter side equals `min_size`, keeping the
/// aspect ratio. Returns an unchanged copy when it already has that size.
pub fn resize_image(image: &DynamicImage, min_size: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let (base, larger) = if width < height {
        (width, height)
    } else {
        (height, width)
    };

    if base == min_size {
        return image.clone();
    }

    let resized_larger = (larger as f64 / base as f64 * min_size as f64).round_ties_even() as u32;
    let new_size = if width < height {
        (min_size, resized_larger)
    } else {
        (resized_larger, min_size)
    };

    tracing::info!(
        "Resizing base image from {:?} to {:?}",
        (width, height),
        new_size
    );
    image.resize_exact(new_size.0, new_size.1, FilterType::Lanczos3)
}
