// Enhancement: legibility-improved rendition of the normalized page

use image::{DynamicImage, RgbImage};
use imageproc::filter::{gaussian_blur_f32, median_filter};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::config::EnhancementConfig;
use crate::core::types::{EnhancedImage, EnhancementReport, NormalizedImage};
use crate::utils::luma_stats;

const MIN_GAIN: f32 = 0.5;
const MAX_GAIN: f32 = 4.0;
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_AMOUNT: f32 = 0.6;

pub struct Enhancer {
    config: EnhancementConfig,
}

impl Enhancer {
    pub fn new(config: EnhancementConfig) -> Self {
        Self { config }
    }

    /// Denoise, stretch contrast towards the target spread, then sharpen.
    ///
    /// Deterministic for a given configuration and never fails: flat input
    /// only gets the steps that are safe on it and is flagged `degenerate`.
    #[instrument(skip_all, fields(document_id = %image.document_id))]
    pub fn enhance(&self, image: &NormalizedImage) -> EnhancedImage {
        let mut rgb = image.pixels.to_rgb8();

        let denoise_radius = self.config.denoise_strength;
        if denoise_radius > 0 && rgb.width() > 2 && rgb.height() > 2 {
            rgb = median_filter(&rgb, denoise_radius, denoise_radius);
        }

        let (mean, std) = luma_stats(&DynamicImage::ImageRgb8(rgb.clone()).into_luma8());
        let degenerate = std < 1.0;

        let mut contrast_gain = 1.0;
        if !degenerate && self.config.contrast_target > 0.0 {
            contrast_gain = (self.config.contrast_target / std).clamp(MIN_GAIN, MAX_GAIN);
            stretch(&mut rgb, mean, contrast_gain);
        }

        let sharpened = self.config.sharpen && !degenerate;
        if sharpened {
            rgb = unsharp(&rgb, SHARPEN_SIGMA, SHARPEN_AMOUNT);
        }

        debug!(
            "Enhanced: denoise r={}, gain {:.2}, sharpen {}, degenerate {}",
            denoise_radius, contrast_gain, sharpened, degenerate
        );

        EnhancedImage {
            pixels: Arc::new(DynamicImage::ImageRgb8(rgb)),
            to_original: image.to_original,
            report: EnhancementReport {
                denoise_radius,
                contrast_gain,
                sharpened,
                degenerate,
            },
        }
    }
}

/// Scales every channel's distance from the mean luminance by `gain`.
fn stretch(img: &mut RgbImage, mean: f32, gain: f32) {
    let row_len = img.width() as usize * 3;
    if row_len == 0 {
        return;
    }
    img.par_chunks_mut(row_len).for_each(|row| {
        for v in row.iter_mut() {
            *v = (mean + (*v as f32 - mean) * gain).round().clamp(0.0, 255.0) as u8;
        }
    });
}

/// Unsharp mask: `orig + amount * (orig - blur)`.
fn unsharp(img: &RgbImage, sigma: f32, amount: f32) -> RgbImage {
    let blurred = gaussian_blur_f32(img, sigma);
    let mut out = img.clone();
    let row_len = img.width() as usize * 3;
    if row_len == 0 {
        return out;
    }
    out.par_chunks_mut(row_len)
        .zip(blurred.par_chunks(row_len))
        .for_each(|(row, blur_row)| {
            for (v, b) in row.iter_mut().zip(blur_row) {
                let o = *v as f32;
                *v = (o + amount * (o - *b as f32)).round().clamp(0.0, 255.0) as u8;
            }
        });
    out
}
