use image::{DynamicImage, GrayImage, ImageFormat};
use serde::Deserialize;
use std::io::Cursor;

use crate::core::geometry::BBox;

/// Output encodings offered by the export interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

/// Encode an image synchronously. JPEG has no alpha channel, so RGBA input
/// is flattened to RGB first.
pub fn encode_image(img: &DynamicImage, format: OutputFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    match format {
        OutputFormat::Png => img.write_to(&mut cursor, ImageFormat::Png)?,
        OutputFormat::Jpeg => {
            DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut cursor, ImageFormat::Jpeg)?
        }
    }
    Ok(bytes)
}

/// Crop the pixels under `bbox`, clamped to the image. `None` when the
/// clamped box is empty.
pub fn crop_bbox(img: &DynamicImage, bbox: &BBox) -> Option<DynamicImage> {
    let (x, y, w, h) = bbox.crop_rect(img.width(), img.height())?;
    Some(img.crop_imm(x, y, w, h))
}

/// Mean and standard deviation of a grayscale image.
pub fn luma_stats(gray: &GrayImage) -> (f32, f32) {
    let n = (gray.width() as u64 * gray.height() as u64).max(1) as f64;
    let (sum, sum_sq) = gray.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    (mean as f32, var.sqrt() as f32)
}
