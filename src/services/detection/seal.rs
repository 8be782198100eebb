use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{finalize, locate, score_region, DetectionStage};
use crate::core::config::PipelineConfig;
use crate::core::errors::{StageError, StageResult};
use crate::core::types::{CancelFlag, Category, Classification, Detection, NormalizedImage, SealType};
use crate::middleware::ModelGate;
use crate::services::model::{ModelSet, RegionLocator, RegionScorer};

/// Locates seals and stamps, then classifies each into the configured
/// taxonomy.
#[derive(Clone)]
pub struct SealDetector {
    locator: Arc<dyn RegionLocator>,
    classifier: Arc<dyn RegionScorer>,
    gate: ModelGate,
}

impl SealDetector {
    pub fn new(
        locator: Arc<dyn RegionLocator>,
        classifier: Arc<dyn RegionScorer>,
        gate: ModelGate,
    ) -> Self {
        Self {
            locator,
            classifier,
            gate,
        }
    }

    pub fn from_models(models: &ModelSet) -> Self {
        Self::new(
            models.seal_locator.clone(),
            models.seal_classifier.clone(),
            models.gate.clone(),
        )
    }
}

/// Types outside the configured taxonomy collapse to `unknown`.
pub(crate) fn seal_type_for(label: &str, taxonomy: &[SealType]) -> SealType {
    let seal_type = SealType::from_label(label);
    if taxonomy.contains(&seal_type) {
        seal_type
    } else {
        SealType::Unknown
    }
}

#[async_trait]
impl DetectionStage for SealDetector {
    fn category(&self) -> Category {
        Category::Seal
    }

    #[instrument(skip_all, fields(document_id = %image.document_id))]
    async fn detect(
        &self,
        image: &NormalizedImage,
        config: &PipelineConfig,
        cancel: &CancelFlag,
    ) -> StageResult<Vec<Detection>> {
        let located = locate(&self.gate, &self.locator, image, config, cancel).await?;
        let candidates = finalize(located, image, &config.seal);

        let mut detections = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let scored = score_region(
                &self.gate,
                &self.classifier,
                &image.pixels,
                &candidate.region,
                config,
                cancel,
            )
            .await?;

            detections.push(Detection {
                category: Category::Seal,
                region: candidate.region,
                classification: Classification::Seal {
                    seal_type: seal_type_for(&scored.label, &config.seal_taxonomy),
                    type_confidence: scored.confidence.clamp(0.0, 1.0),
                },
                confidence: candidate.confidence,
            });
        }

        debug!("{} seal detection(s)", detections.len());
        Ok(detections)
    }
}
