use candle_core::{DType, Device, Tensor};

use crate::{FindDirsError, Result};

/// Loads an image, crops the largest centered square out of it and resizes
/// that to `size` x `size`. Returns a `[1, 3, size, size]` tensor in
/// `[-1, 1]`.
pub fn image_preprocess<T: AsRef<std::path::Path>>(path: T, size: usize) -> Result<Tensor> {
    let img = image::io::Reader::open(path)?.decode()?;
    let img = center_crop(img);
    let img = img.resize_exact(
        size as u32,
        size as u32,
        image::imageops::FilterType::Triangle,
    );
    let img = img.to_rgb8();
    let img = img.into_raw();
    let img = Tensor::from_vec(img, (size, size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(img)
}

pub fn center_crop(img: image::DynamicImage) -> image::DynamicImage {
    let (width, height) = (img.width(), img.height());
    let crop_size = width.min(height);
    let x = crop_offset(width - crop_size);
    let y = crop_offset(height - crop_size);
    img.crop_imm(x, y, crop_size, crop_size)
}

/// Half the margin, with ties rounded to even.
fn crop_offset(margin: u32) -> u32 {
    (margin as f64 / 2.).round_ties_even() as u32
}

/// Converts a `[3, H, W]` tensor in `[-1, 1]` into an 8-bit RGB image.
/// Values outside the range are clamped.
pub fn tensor_to_image(img: &Tensor) -> Result<image::RgbImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(FindDirsError::Msg(format!(
            "expected a 3 channel image, got {channels}"
        )));
    }
    let pixels = img
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .clamp(-1f32, 1f32)?
        .affine(127.5, 127.5)?
        .round()?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?;

    image::RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| FindDirsError::Msg("image buffer has the wrong size".to_string()))
}

pub fn save_image<P: AsRef<std::path::Path>>(img: &Tensor, path: P) -> Result<()> {
    tensor_to_image(img)?.save(path)?;
    Ok(())
}
