// Batch Orchestrator: schedules documents through the pipeline and keeps the
// batch ledger

use anyhow::{anyhow, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::document_pipeline::DocumentPipeline;
use super::result_store::ResultStore;
use crate::core::config::{BatchOptions, PipelineConfig};
use crate::core::errors::{ConfigError, DocumentError, ErrorKind};
use crate::core::types::{BatchReport, CancelFlag};
use crate::services::ingestion::DocumentInput;
use crate::services::model::ModelSet;
use crate::utils::Metrics;

/// Main batch orchestrator
pub struct BatchOrchestrator {
    pipeline: Arc<DocumentPipeline>,
    models: ModelSet,
    store: Arc<ResultStore>,
    metrics: Metrics,
    base: PipelineConfig,
}

/// A submitted batch. Dropping the handle does not stop the batch.
pub struct BatchHandle {
    pub batch_id: String,
    driver: JoinHandle<()>,
    store: Arc<ResultStore>,
}

impl BatchHandle {
    /// Waits until every document has a terminal record.
    pub async fn wait(self) -> Result<BatchReport> {
        self.driver
            .await
            .map_err(|e| anyhow!("batch {} driver failed: {}", self.batch_id, e))?;
        self.store
            .get_batch_report(&self.batch_id)
            .ok_or_else(|| anyhow!("batch {} is not in the result store", self.batch_id))
    }
}

impl BatchOrchestrator {
    pub fn new(
        models: ModelSet,
        store: Arc<ResultStore>,
        metrics: Metrics,
        base: PipelineConfig,
    ) -> Self {
        let pipeline = Arc::new(DocumentPipeline::new(&models, metrics.clone()));
        Self {
            pipeline,
            models,
            store,
            metrics,
            base,
        }
    }

    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn base_config(&self) -> &PipelineConfig {
        &self.base
    }

    /// Validates the batch configuration, registers every document as
    /// `pending` and starts processing in the background. Configuration
    /// problems are reported here, before any document work starts.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &self,
        inputs: Vec<DocumentInput>,
        options: &BatchOptions,
    ) -> Result<BatchHandle, ConfigError> {
        let config = self.base.clone().with_overrides(options);
        config.validate()?;

        let mut seen = HashSet::with_capacity(inputs.len());
        for input in &inputs {
            if !seen.insert(input.id()) {
                return Err(ConfigError::DuplicateDocumentId(input.id().to_string()));
            }
        }

        let batch_id = Uuid::new_v4().to_string();
        let ids: Vec<String> = inputs.iter().map(|i| i.id().to_string()).collect();
        self.store.register_batch(&batch_id, ids);
        self.metrics.record_batch_submitted();

        info!(
            "Batch {}: {} document(s), concurrency {}, deadline {:?}",
            batch_id,
            inputs.len(),
            config.max_concurrency,
            config.per_document_timeout
        );

        let driver = tokio::spawn(drive_batch(
            batch_id.clone(),
            inputs,
            Arc::new(config),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.store),
            self.metrics.clone(),
        ));
        let driver = tokio::spawn(supervise_batch(
            batch_id.clone(),
            driver,
            Arc::clone(&self.store),
            self.metrics.clone(),
        ));

        Ok(BatchHandle {
            batch_id,
            driver,
            store: Arc::clone(&self.store),
        })
    }

    /// Submit and wait for the final report.
    pub async fn process_batch(
        &self,
        inputs: Vec<DocumentInput>,
        options: &BatchOptions,
    ) -> Result<BatchReport> {
        self.submit(inputs, options)?.wait().await
    }
}

#[instrument(skip(inputs, config, pipeline, store, metrics), fields(total = inputs.len()))]
async fn drive_batch(
    batch_id: String,
    inputs: Vec<DocumentInput>,
    config: Arc<PipelineConfig>,
    pipeline: Arc<DocumentPipeline>,
    store: Arc<ResultStore>,
    metrics: Metrics,
) {
    let start_time = Instant::now();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));

    let tasks: Vec<_> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            run_document(
                batch_id.clone(),
                index,
                input,
                Arc::clone(&config),
                Arc::clone(&pipeline),
                Arc::clone(&store),
                metrics.clone(),
                Arc::clone(&semaphore),
            )
        })
        .collect();
    join_all(tasks).await;

    metrics.record_batch_completed();
    if let Some(report) = store.get_batch_report(&batch_id) {
        info!(
            "✓ Batch {} complete in {:.2}s: {} succeeded, {} failed",
            batch_id,
            start_time.elapsed().as_secs_f64(),
            report.succeeded,
            report.failed
        );
    }
}

/// Finalizes the batch if its driver dies, so no document is left
/// without a terminal record.
async fn supervise_batch(
    batch_id: String,
    driver: JoinHandle<()>,
    store: Arc<ResultStore>,
    metrics: Metrics,
) {
    let Err(join_err) = driver.await else {
        return;
    };
    error!("✗ Batch {} driver stopped: {}", batch_id, join_err);

    let failure = DocumentError::Internal("batch driver stopped unexpectedly".to_string())
        .to_failure_record();
    let failed = store.fail_unsettled(&batch_id, &failure);
    for _ in 0..failed {
        metrics.record_document_failed(ErrorKind::Internal);
    }
    metrics.record_batch_completed();
}

/// One document: wait for a slot, run under the deadline, record the
/// outcome. Never fails; every path ends in exactly one store record.
#[allow(clippy::too_many_arguments)]
async fn run_document(
    batch_id: String,
    index: usize,
    input: DocumentInput,
    config: Arc<PipelineConfig>,
    pipeline: Arc<DocumentPipeline>,
    store: Arc<ResultStore>,
    metrics: Metrics,
    semaphore: Arc<Semaphore>,
) {
    let document_id = input.id().to_string();

    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            let err = DocumentError::Internal("scheduler shut down".to_string());
            store.record_failure(&batch_id, index, err.to_failure_record());
            metrics.record_document_failed(err.kind());
            return;
        }
    };
    store.mark_running(&batch_id, index);

    let cancel = CancelFlag::new();
    let task = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();
        async move { pipeline.run(input, config, cancel).await }
    });
    let abort = task.abort_handle();

    let outcome = match tokio::time::timeout(config.per_document_timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_err)) => Err(DocumentError::Internal(if join_err.is_panic() {
            "document task panicked".to_string()
        } else {
            "document task was cancelled".to_string()
        })),
        Err(_) => {
            // Best effort: blocking work already running finishes on its own
            cancel.cancel();
            abort.abort();
            Err(DocumentError::Timeout {
                timeout_ms: config.per_document_timeout.as_millis() as u64,
            })
        }
    };

    match outcome {
        Ok(processed) => {
            let detections = processed.result.detections.len();
            info!(
                "✓ {} [{}]: {} detection(s) in {:.0}ms",
                document_id, index, detections, processed.result.timings.total_ms
            );
            store.record_success(
                &batch_id,
                index,
                Arc::new(processed.result),
                processed.document,
            );
            metrics.record_document_succeeded(detections);
        }
        Err(err) => {
            error!("✗ {} [{}]: {} ({})", document_id, index, err, err.kind());
            store.record_failure(&batch_id, index, err.to_failure_record());
            metrics.record_document_failed(err.kind());
        }
    }
}
