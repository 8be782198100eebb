//! Detection stages: signature and seal.
//!
//! Both stages share the same shape: one locator pass over the whole
//! normalized image, candidate filtering, then one secondary scoring pass
//! per retained candidate. Only the secondary interpretation differs.

mod seal;
mod signature;

pub use seal::SealDetector;
pub use signature::SignatureDetector;

use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use tracing::trace;

use crate::core::config::{PipelineConfig, StageConfig};
use crate::core::errors::{ModelError, StageResult};
use crate::core::geometry::{Point, Region};
use crate::core::types::{CancelFlag, Category, Detection, NormalizedImage};
use crate::middleware::ModelGate;
use crate::services::model::{Located, RegionLocator, RegionScorer, Scored};
use crate::utils::crop_bbox;

/// `detect(image, config) -> [Detection]`, sorted by descending confidence
/// with no two byte-identical regions.
#[async_trait]
pub trait DetectionStage: Send + Sync {
    fn category(&self) -> Category;

    async fn detect(
        &self,
        image: &NormalizedImage,
        config: &PipelineConfig,
        cancel: &CancelFlag,
    ) -> StageResult<Vec<Detection>>;
}

/// A located candidate already wrapped into a region of the normalized
/// image.
pub(crate) struct Candidate {
    pub region: Region,
    pub confidence: f32,
}

/// Wraps a candidate into a region clipped to the image.
fn to_region(located: Located, image: &NormalizedImage) -> Region {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let bbox = located.bbox.clamp_to(image.width(), image.height());
    located
        .polygon
        .map(|points| {
            points
                .into_iter()
                .map(|p| Point::new(p.x.clamp(0.0, w), p.y.clamp(0.0, h)))
                .collect::<Vec<_>>()
        })
        .and_then(|points| Region::polygon(points, image.to_original))
        .unwrap_or_else(|| image.rect_region(bbox))
}

/// Drop scores outside `[0, 1]` (malformed model output) and below the
/// threshold, order by descending confidence (stable, so model order breaks
/// ties), drop byte-identical regions and regions with no pixels, then cap.
pub(crate) fn finalize(
    located: Vec<Located>,
    image: &NormalizedImage,
    stage: &StageConfig,
) -> Vec<Candidate> {
    let raw = located.len();
    let mut kept: Vec<Located> = located
        .into_iter()
        .filter(|l| (0.0..=1.0).contains(&l.confidence))
        .filter(|l| l.confidence >= stage.confidence_threshold)
        .filter(|l| l.bbox.crop_rect(image.width(), image.height()).is_some())
        .collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut seen: Vec<Vec<u32>> = Vec::with_capacity(kept.len());
    let mut candidates = Vec::with_capacity(kept.len().min(stage.max_regions));
    for located in kept {
        if candidates.len() >= stage.max_regions {
            break;
        }
        let confidence = located.confidence;
        let region = to_region(located, image);
        let key = region.shape_key();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        candidates.push(Candidate { region, confidence });
    }

    trace!(
        "finalize: {} raw -> {} candidates (threshold {}, cap {})",
        raw,
        candidates.len(),
        stage.confidence_threshold,
        stage.max_regions
    );
    candidates
}

/// Whole-image locator pass through the gate.
pub(crate) async fn locate(
    gate: &ModelGate,
    locator: &Arc<dyn RegionLocator>,
    image: &NormalizedImage,
    config: &PipelineConfig,
    cancel: &CancelFlag,
) -> StageResult<Vec<Located>> {
    let locator = Arc::clone(locator);
    let pixels = Arc::clone(&image.pixels);
    let capability = locator.name().to_string();
    gate.invoke(&capability, config.inference_timeout, cancel, move || {
        locator.locate(&pixels)
    })
    .await
}

/// Secondary scoring pass over the pixels under one candidate. Cropping
/// happens on the blocking pool with the call itself.
pub(crate) async fn score_region(
    gate: &ModelGate,
    scorer: &Arc<dyn RegionScorer>,
    pixels: &Arc<DynamicImage>,
    region: &Region,
    config: &PipelineConfig,
    cancel: &CancelFlag,
) -> StageResult<Scored> {
    let scorer = Arc::clone(scorer);
    let pixels = Arc::clone(pixels);
    let bounds = region.bounds();
    let capability = scorer.name().to_string();
    gate.invoke(&capability, config.inference_timeout, cancel, move || {
        let crop = crop_bbox(&pixels, &bounds)
            .ok_or_else(|| ModelError::Inference("candidate region has no pixels".to_string()))?;
        scorer.score(&crop)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{AffineTransform, BBox};
    use image::RgbImage;

    fn image(w: u32, h: u32) -> NormalizedImage {
        NormalizedImage {
            document_id: "doc".into(),
            pixels: Arc::new(DynamicImage::ImageRgb8(RgbImage::new(w, h))),
            to_original: AffineTransform::scale(2.0, 2.0),
            from_original: AffineTransform::scale(0.5, 0.5),
            original_width: w * 2,
            original_height: h * 2,
            quarter_turns: 0,
            skew_degrees: 0.0,
        }
    }

    fn located(x: f32, confidence: f32) -> Located {
        Located::rect(BBox::new(x, 0.0, x + 10.0, 10.0), confidence)
    }

    #[test]
    fn test_finalize_orders_and_caps() {
        let stage = StageConfig {
            confidence_threshold: 0.5,
            max_regions: 2,
        };
        let out = finalize(
            vec![located(0.0, 0.6), located(20.0, 0.4), located(40.0, 0.9), located(60.0, 0.7)],
            &image(100, 100),
            &stage,
        );
        let confidences: Vec<f32> = out.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_finalize_drops_identical_regions() {
        let stage = StageConfig {
            confidence_threshold: 0.0,
            max_regions: 10,
        };
        let out = finalize(
            vec![located(0.0, 0.8), located(0.0, 0.6), located(0.0, 0.8)],
            &image(100, 100),
            &stage,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.8);
    }

    #[test]
    fn test_finalize_drops_offscreen_and_nan() {
        let stage = StageConfig {
            confidence_threshold: 0.0,
            max_regions: 10,
        };
        let out = finalize(
            vec![located(500.0, 0.9), located(10.0, f32::NAN), located(30.0, 0.5)],
            &image(100, 100),
            &stage,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].region.bounds().x_min, 30.0);
    }

    #[test]
    fn test_finalize_drops_scores_outside_unit_range() {
        let stage = StageConfig {
            confidence_threshold: 0.0,
            max_regions: 10,
        };
        let out = finalize(
            vec![located(0.0, 7.5), located(20.0, -0.1), located(40.0, 1.0)],
            &image(100, 100),
            &stage,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 1.0);
        assert_eq!(out[0].region.bounds().x_min, 40.0);
    }

    #[test]
    fn test_finalize_clips_regions_to_image() {
        let stage = StageConfig {
            confidence_threshold: 0.0,
            max_regions: 10,
        };
        let partly_off = Located::rect(BBox::new(-20.0, 90.0, 30.0, 130.0), 0.9);
        let polygon = Located {
            bbox: BBox::new(80.0, -5.0, 120.0, 20.0),
            polygon: Some(vec![
                Point::new(80.0, -5.0),
                Point::new(120.0, 0.0),
                Point::new(100.0, 20.0),
            ]),
            confidence: 0.8,
        };
        let out = finalize(vec![partly_off, polygon], &image(100, 100), &stage);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].region.bounds(), BBox::new(0.0, 90.0, 30.0, 100.0));
        let poly = out[1].region.bounds();
        assert!(poly.x_max <= 100.0 && poly.y_min >= 0.0);
        assert_eq!(out[1].region.project().bbox.x_max, 200.0);
    }

    #[test]
    fn test_regions_carry_transform() {
        let stage = StageConfig {
            confidence_threshold: 0.0,
            max_regions: 10,
        };
        let out = finalize(vec![located(10.0, 0.9)], &image(100, 100), &stage);
        assert_eq!(out[0].region.project().bbox, BBox::new(20.0, 0.0, 40.0, 20.0));
    }
}
