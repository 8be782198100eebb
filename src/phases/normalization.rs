// Normalization: raw bytes -> canonical pixel grid plus the map back to the
// original document

use image::{DynamicImage, GrayImage, ImageError, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::config::NormalizerConfig;
use crate::core::errors::{NormalizeError, NormalizeResult};
use crate::core::geometry::AffineTransform;
use crate::core::types::{Document, NormalizedImage, SourceFormat};
use crate::utils::luma_stats;

/// Longest side of the copy used for orientation and skew estimation
const ANALYSIS_MAX_SIDE: u32 = 1000;
/// Column profile must beat the row profile by this factor before the page
/// is turned
const ORIENTATION_MARGIN: f64 = 1.5;
/// Upper bound on dark pixels fed into the profile search
const MAX_PROFILE_POINTS: usize = 200_000;

pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Decode, orient, deskew and rescale one document. Blocking and
    /// CPU-bound; callers run it on the blocking pool.
    #[instrument(skip_all, fields(document_id = %document.id))]
    pub fn normalize(&self, document: &Document) -> NormalizeResult<NormalizedImage> {
        let decoded = decode(document)?;
        let rgb = flatten(decoded);
        let (original_width, original_height) = rgb.dimensions();
        if original_width == 0 || original_height == 0 {
            return Err(NormalizeError::Decode("image has no pixels".to_string()));
        }

        let estimate = self.estimate_rotation(&rgb);
        let forward = self.forward_transform(original_width, original_height, &estimate);
        let to_original = forward.transform.inverse().ok_or_else(|| {
            NormalizeError::Decode("normalization transform is not invertible".to_string())
        })?;

        let pixels = if forward.transform.is_identity() {
            rgb
        } else if estimate.correction_radians == 0.0 {
            image::imageops::resize(
                &rgb,
                forward.width,
                forward.height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            let projection = Projection::from_matrix(forward.transform.to_projection_matrix())
                .ok_or_else(|| {
                    NormalizeError::Decode("normalization projection is degenerate".to_string())
                })?;
            let mut out = RgbImage::new(forward.width, forward.height);
            warp_into(
                &rgb,
                &projection,
                Interpolation::Bilinear,
                Rgb([255, 255, 255]),
                &mut out,
            );
            out
        };

        debug!(
            "Normalized {}x{} -> {}x{} (quarter turns {}, skew {:.2}°)",
            original_width,
            original_height,
            pixels.width(),
            pixels.height(),
            estimate.quarter_turns,
            estimate.skew_degrees
        );

        Ok(NormalizedImage {
            document_id: document.id.clone(),
            pixels: Arc::new(DynamicImage::ImageRgb8(pixels)),
            to_original,
            from_original: forward.transform,
            original_width,
            original_height,
            quarter_turns: estimate.quarter_turns,
            skew_degrees: estimate.skew_degrees,
        })
    }

    fn estimate_rotation(&self, rgb: &RgbImage) -> RotationEstimate {
        let Some(points) = dark_points(rgb) else {
            return RotationEstimate::default();
        };

        let mut quarter_turns = 0u8;
        if self.config.auto_orient {
            let rows = profile_score(&points, 0.0);
            let columns = profile_score(&points, FRAC_PI_2);
            if columns > rows * ORIENTATION_MARGIN {
                quarter_turns = 1;
            }
        }
        let base = quarter_turns as f64 * FRAC_PI_2;

        let max = self.config.max_skew_degrees as f64;
        let step = self.config.skew_step_degrees as f64;
        let mut best_correction = 0.0f64;
        if max > 0.0 && step > 0.0 {
            let mut best_score = profile_score(&points, base);
            let steps = (max / step).floor() as i64;
            for i in -steps..=steps {
                if i == 0 {
                    continue;
                }
                let degrees = i as f64 * step;
                let score = profile_score(&points, base + degrees.to_radians());
                if score > best_score {
                    best_score = score;
                    best_correction = degrees;
                }
            }
        }

        RotationEstimate {
            quarter_turns,
            correction_radians: base + best_correction.to_radians(),
            skew_degrees: -best_correction as f32,
        }
    }

    /// original -> normalized: rotate about the page centre into an expanded
    /// canvas, then scale the longest side down to `max_dimension`.
    fn forward_transform(&self, width: u32, height: u32, estimate: &RotationEstimate) -> Forward {
        let (w, h) = (width as f64, height as f64);
        let theta = estimate.correction_radians;

        let (canvas_w, canvas_h) = if theta == 0.0 {
            (w, h)
        } else {
            let (sin, cos) = theta.sin_cos();
            (
                snap(w * cos.abs() + h * sin.abs()),
                snap(w * sin.abs() + h * cos.abs()),
            )
        };

        let longest = canvas_w.max(canvas_h);
        let scale = (self.config.max_dimension as f64 / longest).min(1.0);
        let out_w = ((canvas_w * scale).round() as u32).max(1);
        let out_h = ((canvas_h * scale).round() as u32).max(1);

        let transform = if theta == 0.0 {
            AffineTransform::scale(out_w as f64 / w, out_h as f64 / h)
        } else {
            AffineTransform::translate(-w / 2.0, -h / 2.0)
                .then(&AffineTransform::rotate(theta))
                .then(&AffineTransform::translate(canvas_w / 2.0, canvas_h / 2.0))
                .then(&AffineTransform::scale(scale, scale))
        };

        Forward {
            transform,
            width: out_w,
            height: out_h,
        }
    }
}

#[derive(Debug, Default)]
struct RotationEstimate {
    quarter_turns: u8,
    /// Total rotation applied to the page, radians
    correction_radians: f64,
    /// Detected page skew, degrees clockwise
    skew_degrees: f32,
}

struct Forward {
    transform: AffineTransform,
    width: u32,
    height: u32,
}

/// Canvas sides of exact quarter turns come out as `h + 1e-13`; keep them
/// integral.
fn snap(v: f64) -> f64 {
    let rounded = v.round();
    if (v - rounded).abs() < 1e-6 {
        rounded
    } else {
        v.ceil()
    }
}

fn decode(document: &Document) -> NormalizeResult<DynamicImage> {
    match document.metadata.source_format {
        SourceFormat::Pdf => {
            return Err(NormalizeError::UnsupportedFormat(
                "PDF documents must be rasterized before analysis".to_string(),
            ))
        }
        SourceFormat::OtherImage => {
            let name = image::guess_format(&document.bytes)
                .map(|f| format!("{:?}", f))
                .unwrap_or_else(|_| "image".to_string());
            return Err(NormalizeError::UnsupportedFormat(format!(
                "{} encoding is not supported",
                name
            )));
        }
        SourceFormat::Unknown => {
            return Err(NormalizeError::Decode(
                "bytes are not a recognised image encoding".to_string(),
            ))
        }
        _ => {}
    }

    image::load_from_memory(&document.bytes).map_err(|e| match e {
        ImageError::Unsupported(inner) => NormalizeError::UnsupportedFormat(inner.to_string()),
        other => NormalizeError::Decode(other.to_string()),
    })
}

/// RGB with any transparency composited over white paper.
pub(crate) fn flatten(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.into_rgb8();
    }
    let rgba = image.into_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, p) in rgba.enumerate_pixels() {
        let alpha = p.0[3] as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(p.0[0]), blend(p.0[1]), blend(p.0[2])]));
    }
    out
}

/// Dark pixel coordinates of a downsampled copy, centred on the page
/// centre. `None` when the page is blank or mostly ink.
fn dark_points(rgb: &RgbImage) -> Option<Vec<(f64, f64)>> {
    let gray: GrayImage = {
        let longest = rgb.width().max(rgb.height());
        let luma = DynamicImage::ImageRgb8(rgb.clone()).into_luma8();
        if longest <= ANALYSIS_MAX_SIDE {
            luma
        } else {
            let scale = ANALYSIS_MAX_SIDE as f32 / longest as f32;
            let w = ((rgb.width() as f32 * scale).round() as u32).max(1);
            let h = ((rgb.height() as f32 * scale).round() as u32).max(1);
            image::imageops::resize(&luma, w, h, image::imageops::FilterType::Triangle)
        }
    };

    let (_, std) = luma_stats(&gray);
    if std < 8.0 {
        return None;
    }

    let cutoff = otsu_level(&gray).min(160);
    let (cx, cy) = (gray.width() as f64 / 2.0, gray.height() as f64 / 2.0);
    let points: Vec<(f64, f64)> = gray
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] <= cutoff)
        .map(|(x, y, _)| (x as f64 + 0.5 - cx, y as f64 + 0.5 - cy))
        .collect();

    let total = (gray.width() as usize * gray.height() as usize).max(1);
    if points.len() * 1000 < total || points.len() * 2 > total {
        return None;
    }
    if points.len() > MAX_PROFILE_POINTS {
        let stride = points.len().div_ceil(MAX_PROFILE_POINTS);
        return Some(points.into_iter().step_by(stride).collect());
    }
    Some(points)
}

/// Sharpness of the horizontal projection profile after rotating the points
/// by `theta`. Text lines aligned with the x axis give a spiky profile.
fn profile_score(points: &[(f64, f64)], theta: f64) -> f64 {
    let (sin, cos) = theta.sin_cos();
    let extent = points
        .iter()
        .map(|(x, y)| x.abs() + y.abs())
        .fold(0.0f64, f64::max)
        .ceil() as usize
        + 1;

    let mut bins = vec![0u32; extent * 2 + 1];
    for &(x, y) in points {
        let rotated = x * sin + y * cos;
        let bin = (rotated.round() as i64 + extent as i64).clamp(0, bins.len() as i64 - 1);
        bins[bin as usize] += 1;
    }
    let n = points.len().max(1) as f64;
    bins.iter().map(|&c| (c as f64) * (c as f64)).sum::<f64>() / n
}
