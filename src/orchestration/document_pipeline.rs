// Per-document pipeline: ingest -> normalize -> {signature, seal, enhance} -> consolidate

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::PipelineConfig;
use crate::core::errors::{DocumentError, StageError, StageName};
use crate::core::types::{
    CancelFlag, Detection, Document, DocumentResult, EnhancedImage, NormalizedImage, StageTimings,
};
use crate::phases::{consolidate, Enhancer, Normalizer};
use crate::services::detection::{DetectionStage, SealDetector, SignatureDetector};
use crate::services::ingestion::DocumentInput;
use crate::services::model::ModelSet;
use crate::utils::Metrics;

/// Upper bound on a single backoff sleep between stage attempts
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A finished run: the result plus the resolved source document
pub struct ProcessedDocument {
    pub result: DocumentResult,
    pub document: Document,
}

/// Outcome of one detection stage after retries
struct StageRun {
    detections: Vec<Detection>,
    retries: u32,
    elapsed: Duration,
}

pub struct DocumentPipeline {
    signature: Arc<dyn DetectionStage>,
    seal: Arc<dyn DetectionStage>,
    metrics: Metrics,
}

impl DocumentPipeline {
    pub fn new(models: &ModelSet, metrics: Metrics) -> Self {
        Self::with_stages(
            Arc::new(SignatureDetector::from_models(models)),
            Arc::new(SealDetector::from_models(models)),
            metrics,
        )
    }

    pub fn with_stages(
        signature: Arc<dyn DetectionStage>,
        seal: Arc<dyn DetectionStage>,
        metrics: Metrics,
    ) -> Self {
        Self {
            signature,
            seal,
            metrics,
        }
    }

    /// Runs one document end to end. Produces exactly one result or one
    /// error; detection failures fail the document, a missing enhancement
    /// does not.
    #[instrument(skip_all, fields(document_id = %input.id()))]
    pub async fn run(
        &self,
        input: DocumentInput,
        config: Arc<PipelineConfig>,
        cancel: CancelFlag,
    ) -> Result<ProcessedDocument, DocumentError> {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        // Ingestion
        let t = Instant::now();
        let document = input.resolve().await?;
        timings.ingestion_ms = ms(t.elapsed());
        self.metrics.record_stage_duration(StageName::Ingestion, t.elapsed());
        check_cancelled(&cancel, StageName::Normalization)?;

        // Normalization
        let t = Instant::now();
        let normalizer = Normalizer::new(config.normalizer.clone());
        let doc = document.clone();
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&doc))
            .await
            .map_err(|e| DocumentError::Internal(format!("normalization task failed: {}", e)))??;
        let normalized = Arc::new(normalized);
        timings.normalization_ms = ms(t.elapsed());
        self.metrics.record_stage_duration(StageName::Normalization, t.elapsed());
        check_cancelled(&cancel, StageName::Signature)?;

        // Independent stages
        let (signatures, seals, enhancement) = tokio::join!(
            self.run_detection(self.signature.as_ref(), &normalized, &config, &cancel),
            self.run_detection(self.seal.as_ref(), &normalized, &config, &cancel),
            run_enhancement(&normalized, &config),
        );
        let (enhanced, enhancement_elapsed) = enhancement;
        timings.enhancement_ms = ms(enhancement_elapsed);
        self.metrics.record_stage_duration(StageName::Enhancement, enhancement_elapsed);

        let signatures = signatures?;
        let seals = seals?;
        timings.signature_ms = ms(signatures.elapsed);
        timings.seal_ms = ms(seals.elapsed);
        check_cancelled(&cancel, StageName::Consolidation)?;

        // Consolidation
        let t = Instant::now();
        let consolidated = consolidate(
            signatures.detections,
            seals.detections,
            enhanced,
            config.overlap_threshold,
        );
        timings.consolidation_ms = ms(t.elapsed());
        self.metrics.record_stage_duration(StageName::Consolidation, t.elapsed());
        timings.total_ms = ms(started.elapsed());

        debug!(
            "Document done in {:.1}ms: {} detection(s), {} suppressed",
            timings.total_ms,
            consolidated.detections.len(),
            consolidated.suppressed
        );

        let result = DocumentResult {
            document_id: document.id.clone(),
            metadata: document.metadata.clone(),
            original_width: normalized.original_width,
            original_height: normalized.original_height,
            skew_degrees: normalized.skew_degrees,
            quarter_turns: normalized.quarter_turns,
            detections: consolidated.detections,
            enhancement: consolidated.enhancement,
            enhanced: consolidated.enhanced,
            retries: signatures.retries + seals.retries,
            timings,
        };
        Ok(ProcessedDocument { result, document })
    }

    /// One detection stage with retries on transient failures.
    async fn run_detection(
        &self,
        stage: &dyn DetectionStage,
        image: &NormalizedImage,
        config: &PipelineConfig,
        cancel: &CancelFlag,
    ) -> Result<StageRun, DocumentError> {
        let name = stage.category().stage();
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match stage.detect(image, config, cancel).await {
                Ok(detections) => {
                    let elapsed = started.elapsed();
                    self.metrics.record_stage_duration(name, elapsed);
                    debug!("{} stage: {} detection(s) in {:?}", name, detections.len(), elapsed);
                    return Ok(StageRun {
                        detections,
                        retries: attempts - 1,
                        elapsed,
                    });
                }
                Err(e) if e.is_transient() && attempts <= config.max_retries && !cancel.is_cancelled() => {
                    let delay = backoff(config.retry_backoff, attempts);
                    warn!(
                        "{} stage attempt {} failed: {}. Retrying in {:?}",
                        name, attempts, e, delay
                    );
                    self.metrics.record_stage_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(DocumentError::Stage {
                        stage: name,
                        attempts,
                        source,
                    })
                }
            }
        }
    }
}

/// Enhancement never fails the document; a crashed task becomes an
/// unavailable rendition.
async fn run_enhancement(
    image: &Arc<NormalizedImage>,
    config: &PipelineConfig,
) -> (Result<EnhancedImage, String>, Duration) {
    let t = Instant::now();
    let enhancer = Enhancer::new(config.enhancement.clone());
    let image = Arc::clone(image);
    let outcome = tokio::task::spawn_blocking(move || enhancer.enhance(&image))
        .await
        .map_err(|e| {
            warn!("Enhancement task failed: {}", e);
            format!("enhancement did not complete: {}", e)
        });
    (outcome, t.elapsed())
}

/// `base * 2^(attempt - 1)`, capped.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

fn check_cancelled(cancel: &CancelFlag, next: StageName) -> Result<(), DocumentError> {
    if cancel.is_cancelled() {
        return Err(DocumentError::Stage {
            stage: next,
            attempts: 0,
            source: StageError::Cancelled,
        });
    }
    Ok(())
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
