use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{finalize, locate, score_region, DetectionStage};
use crate::core::config::PipelineConfig;
use crate::core::errors::{StageError, StageResult};
use crate::core::types::{
    AuthenticityVerdict, CancelFlag, Category, Classification, Detection, NormalizedImage,
};
use crate::middleware::ModelGate;
use crate::services::model::{ModelSet, RegionLocator, RegionScorer};

/// Locates signatures, then runs the authenticity scorer over each crop.
#[derive(Clone)]
pub struct SignatureDetector {
    locator: Arc<dyn RegionLocator>,
    scorer: Arc<dyn RegionScorer>,
    gate: ModelGate,
}

impl SignatureDetector {
    pub fn new(locator: Arc<dyn RegionLocator>, scorer: Arc<dyn RegionScorer>, gate: ModelGate) -> Self {
        Self {
            locator,
            scorer,
            gate,
        }
    }

    pub fn from_models(models: &ModelSet) -> Self {
        Self::new(
            models.signature_locator.clone(),
            models.authenticity_scorer.clone(),
            models.gate.clone(),
        )
    }
}

/// Scorer label to verdict, downgraded when the scorer is unsure.
pub(crate) fn verdict_for(label: &str, confidence: f32, min_confidence: f32) -> AuthenticityVerdict {
    if !(confidence >= min_confidence) {
        return AuthenticityVerdict::Indeterminate;
    }
    AuthenticityVerdict::from_label(label)
}

#[async_trait]
impl DetectionStage for SignatureDetector {
    fn category(&self) -> Category {
        Category::Signature
    }

    #[instrument(skip_all, fields(document_id = %image.document_id))]
    async fn detect(
        &self,
        image: &NormalizedImage,
        config: &PipelineConfig,
        cancel: &CancelFlag,
    ) -> StageResult<Vec<Detection>> {
        let located = locate(&self.gate, &self.locator, image, config, cancel).await?;
        let candidates = finalize(located, image, &config.signature);

        let mut detections = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let scored = score_region(
                &self.gate,
                &self.scorer,
                &image.pixels,
                &candidate.region,
                config,
                cancel,
            )
            .await?;

            let authenticity_confidence = scored.confidence.clamp(0.0, 1.0);
            detections.push(Detection {
                category: Category::Signature,
                region: candidate.region,
                classification: Classification::Signature {
                    verdict: verdict_for(
                        &scored.label,
                        authenticity_confidence,
                        config.authenticity_min_confidence,
                    ),
                    authenticity_confidence,
                },
                confidence: candidate.confidence,
            });
        }

        debug!("{} signature detection(s)", detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_confidence_verdict_is_indeterminate() {
        assert_eq!(verdict_for("genuine", 0.9, 0.6), AuthenticityVerdict::Genuine);
        assert_eq!(verdict_for("forged", 0.7, 0.6), AuthenticityVerdict::Suspicious);
        assert_eq!(verdict_for("genuine", 0.5, 0.6), AuthenticityVerdict::Indeterminate);
        assert_eq!(verdict_for("genuine", f32::NAN, 0.6), AuthenticityVerdict::Indeterminate);
    }
}
