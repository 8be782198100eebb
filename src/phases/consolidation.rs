//! Consolidation: merges the two detection streams and the enhancement
//! outcome into one document-level result.
//!
//! Overlap resolution is a greedy per-category suppression. Candidates are
//! visited in a total order (confidence, then region area, then insertion
//! order) so that identical inputs always give identical output.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::types::{Detection, EnhancedImage, EnhancementStatus, ResolvedDetection};

/// Consolidated detections plus the attached enhancement outcome.
#[derive(Debug, Clone)]
pub struct Consolidated {
    pub detections: Vec<ResolvedDetection>,
    pub enhancement: EnhancementStatus,
    pub enhanced: Option<Arc<EnhancedImage>>,
    /// Detections dropped by overlap resolution
    pub suppressed: usize,
}

/// Two detections compete only when they share a category and do not
/// declare different subtypes.
fn competes(a: &Detection, b: &Detection) -> bool {
    if a.category != b.category {
        return false;
    }
    match (
        a.classification.declared_subtype(),
        b.classification.declared_subtype(),
    ) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn visit_order(a: &(usize, Detection), b: &(usize, Detection)) -> Ordering {
    b.1.confidence
        .total_cmp(&a.1.confidence)
        .then_with(|| b.1.region.area().total_cmp(&a.1.region.area()))
        .then_with(|| a.0.cmp(&b.0))
}

/// Keeps, within each competing group, only detections whose IoU with every
/// higher-ranked kept detection is at most `overlap_threshold`. Output is in
/// visit order.
pub fn resolve_overlaps(detections: Vec<Detection>, overlap_threshold: f32) -> Vec<Detection> {
    let mut ranked: Vec<(usize, Detection)> = detections.into_iter().enumerate().collect();
    ranked.sort_by(visit_order);

    let mut kept: Vec<Detection> = Vec::with_capacity(ranked.len());
    for (_, candidate) in ranked {
        let suppressed = kept
            .iter()
            .any(|k| competes(k, &candidate) && k.region.iou(&candidate.region) > overlap_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[instrument(skip_all, fields(signatures = signatures.len(), seals = seals.len()))]
pub fn consolidate(
    signatures: Vec<Detection>,
    seals: Vec<Detection>,
    enhancement: Result<EnhancedImage, String>,
    overlap_threshold: f32,
) -> Consolidated {
    let raw = signatures.len() + seals.len();

    // Streams are resolved separately and never mixed.
    let mut retained = resolve_overlaps(signatures, overlap_threshold);
    retained.extend(resolve_overlaps(seals, overlap_threshold));
    let suppressed = raw - retained.len();

    let detections: Vec<ResolvedDetection> = retained
        .into_iter()
        .map(|detection| ResolvedDetection {
            original: detection.region.project(),
            detection,
        })
        .collect();

    let (status, enhanced) = match enhancement {
        Ok(image) => (
            EnhancementStatus::Available {
                report: image.report.clone(),
            },
            Some(Arc::new(image)),
        ),
        Err(reason) => (EnhancementStatus::Unavailable { reason }, None),
    };

    debug!(
        "Consolidated {} detection(s), {} suppressed",
        detections.len(),
        suppressed
    );

    Consolidated {
        detections,
        enhancement: status,
        enhanced,
        suppressed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{AffineTransform, BBox, Region};
    use crate::core::types::{AuthenticityVerdict, Category, Classification, SealType};

    fn seal(bbox: BBox, confidence: f32, seal_type: SealType) -> Detection {
        Detection {
            category: Category::Seal,
            region: Region::rect(bbox, AffineTransform::translate(10.0, 0.0)),
            classification: Classification::Seal {
                seal_type,
                type_confidence: 0.9,
            },
            confidence,
        }
    }

    fn signature(bbox: BBox, confidence: f32) -> Detection {
        Detection {
            category: Category::Signature,
            region: Region::rect(bbox, AffineTransform::IDENTITY),
            classification: Classification::Signature {
                verdict: AuthenticityVerdict::Genuine,
                authenticity_confidence: 0.8,
            },
            confidence,
        }
    }

    #[test]
    fn test_keeps_higher_confidence() {
        // IoU of these two boxes is 0.8
        let a = BBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BBox::new(0.0, 0.0, 100.0, 80.0);
        assert!((a.iou(&b) - 0.8).abs() < 1e-6);

        let kept = resolve_overlaps(
            vec![
                seal(a, 0.6, SealType::Notary),
                seal(b, 0.9, SealType::Notary),
            ],
            0.5,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_tie_breaks_area_then_insertion() {
        let small = BBox::new(0.0, 0.0, 100.0, 90.0);
        let large = BBox::new(0.0, 0.0, 100.0, 100.0);
        let kept = resolve_overlaps(
            vec![seal(small, 0.7, SealType::Unknown), seal(large, 0.7, SealType::Unknown)],
            0.5,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].region.bounds(), large);

        let first = seal(large, 0.7, SealType::Unknown);
        let mut second = seal(large, 0.7, SealType::Unknown);
        second.classification = Classification::Seal {
            seal_type: SealType::Unknown,
            type_confidence: 0.1,
        };
        let kept = resolve_overlaps(vec![first.clone(), second], 0.5);
        assert_eq!(kept, vec![first]);
    }

    #[test]
    fn test_different_declared_subtypes_coexist() {
        let a = BBox::new(0.0, 0.0, 100.0, 100.0);
        let kept = resolve_overlaps(
            vec![
                seal(a, 0.9, SealType::Notary),
                seal(a, 0.8, SealType::Corporate),
                seal(a, 0.7, SealType::Unknown),
            ],
            0.5,
        );
        let types: Vec<_> = kept
            .iter()
            .map(|d| d.classification.declared_subtype())
            .collect();
        assert_eq!(types, vec![Some(SealType::Notary), Some(SealType::Corporate)]);
    }

    #[test]
    fn test_categories_never_conflated() {
        let a = BBox::new(0.0, 0.0, 100.0, 100.0);
        let out = consolidate(
            vec![signature(a, 0.9)],
            vec![seal(a, 0.95, SealType::Unknown)],
            Err("enhancement panicked".into()),
            0.5,
        );
        assert_eq!(out.detections.len(), 2);
        assert_eq!(out.detections[0].detection.category, Category::Signature);
        assert!(out.enhanced.is_none());
        assert_eq!(
            out.enhancement,
            EnhancementStatus::Unavailable {
                reason: "enhancement panicked".into()
            }
        );
    }

    #[test]
    fn test_projects_into_original_space() {
        let out = consolidate(
            Vec::new(),
            vec![seal(BBox::new(0.0, 0.0, 10.0, 10.0), 0.9, SealType::Notary)],
            Err("skipped".into()),
            0.5,
        );
        assert_eq!(out.detections[0].original.bbox, BBox::new(10.0, 0.0, 20.0, 10.0));
    }

    #[test]
    fn test_no_overlap_survives_threshold() {
        let mut seals = Vec::new();
        for i in 0..12 {
            let x = (i * 7) as f32;
            seals.push(seal(
                BBox::new(x, 0.0, x + 40.0, 40.0),
                0.5 + (i % 5) as f32 * 0.1,
                SealType::Unknown,
            ));
        }
        let kept = resolve_overlaps(seals, 0.3);
        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                assert!(a.region.iou(&b.region) <= 0.3);
            }
        }
    }
}
