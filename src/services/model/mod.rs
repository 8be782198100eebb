//! Model capability interfaces and the process-scoped model set.
//!
//! The pipeline core depends only on [`RegionLocator`] and [`RegionScorer`].
//! Concrete model families live in submodules: the pure-Rust heuristic family
//! is always available, the ONNX family is compiled in with feature `onnx`.

pub mod heuristic;
#[cfg(feature = "onnx")]
pub mod onnx;

use anyhow::Result;
use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::config::{Config, ModelBackend};
use crate::core::errors::ModelError;
use crate::core::geometry::{BBox, Point};
use crate::middleware::{CircuitBreakerConfig, ModelGate};
use crate::utils::Metrics;

/// One candidate area reported by a locator, in the pixel grid of the image
/// it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub bbox: BBox,
    /// Optional tighter outline
    pub polygon: Option<Vec<Point>>,
    pub confidence: f32,
}

impl Located {
    pub fn rect(bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            polygon: None,
            confidence,
        }
    }
}

/// Label and confidence produced by a classification-style capability
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub label: String,
    pub confidence: f32,
}

impl Scored {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Detection-style capability: `locate(image) -> [(region, confidence)]`.
///
/// Implementations are synchronous and may block; callers run them on the
/// blocking pool through the [`ModelGate`].
pub trait RegionLocator: Send + Sync {
    fn name(&self) -> &str;

    fn locate(&self, image: &DynamicImage) -> Result<Vec<Located>, ModelError>;

    fn warmup(&self) -> Result<(), ModelError> {
        Ok(())
    }

    fn release(&self) {}
}

/// Classification-style capability: `score(crop) -> (label, confidence)`.
pub trait RegionScorer: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, crop: &DynamicImage) -> Result<Scored, ModelError>;

    fn warmup(&self) -> Result<(), ModelError> {
        Ok(())
    }

    fn release(&self) {}
}

/// All capabilities the pipeline consumes, loaded once per process and
/// injected into the orchestrator.
#[derive(Clone)]
pub struct ModelSet {
    pub signature_locator: Arc<dyn RegionLocator>,
    pub authenticity_scorer: Arc<dyn RegionScorer>,
    pub seal_locator: Arc<dyn RegionLocator>,
    pub seal_classifier: Arc<dyn RegionScorer>,
    pub gate: ModelGate,
    family: String,
}

impl ModelSet {
    pub fn new(
        family: impl Into<String>,
        signature_locator: Arc<dyn RegionLocator>,
        authenticity_scorer: Arc<dyn RegionScorer>,
        seal_locator: Arc<dyn RegionLocator>,
        seal_classifier: Arc<dyn RegionScorer>,
        gate: ModelGate,
    ) -> Self {
        Self {
            signature_locator,
            authenticity_scorer,
            seal_locator,
            seal_classifier,
            gate,
            family: family.into(),
        }
    }

    /// Heuristic family behind the given gate.
    pub fn heuristic(gate: ModelGate) -> Self {
        Self::new(
            "heuristic",
            Arc::new(heuristic::InkSignatureLocator::default()),
            Arc::new(heuristic::StrokeAuthenticityScorer::default()),
            Arc::new(heuristic::ChromaSealLocator::default()),
            Arc::new(heuristic::HueSealClassifier::default()),
            gate,
        )
    }

    /// Builds the configured family, then warms every capability once.
    pub async fn load(config: &Config, metrics: Metrics) -> Result<Self> {
        let gate = ModelGate::new(
            config.models.pool_size,
            CircuitBreakerConfig {
                failure_threshold: config.models.breaker_failure_threshold,
                timeout: Duration::from_secs(config.models.breaker_timeout_secs),
                success_threshold: 1,
            },
            metrics,
        );

        let set = match config.models.backend {
            ModelBackend::Heuristic => Self::heuristic(gate),
            #[cfg(feature = "onnx")]
            ModelBackend::Onnx => {
                let models = config.models.clone();
                let family = tokio::task::spawn_blocking(move || onnx::OnnxFamily::load(&models))
                    .await??;
                family.into_model_set(gate)
            }
            #[cfg(not(feature = "onnx"))]
            ModelBackend::Onnx => {
                anyhow::bail!(
                    "MODEL_BACKEND=onnx but this binary was built without ONNX support. \
                     Rebuild with: cargo build --features onnx"
                )
            }
        };

        let warm = set.clone();
        tokio::task::spawn_blocking(move || warm.warmup()).await??;

        info!(
            "✓ Model set '{}' ready ({} in-flight inferences)",
            set.family,
            set.gate.pool_size()
        );
        Ok(set)
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn warmup(&self) -> Result<(), ModelError> {
        self.signature_locator.warmup()?;
        self.authenticity_scorer.warmup()?;
        self.seal_locator.warmup()?;
        self.seal_classifier.warmup()?;
        Ok(())
    }

    /// Releases backend resources. The set must not be used afterwards.
    pub fn shutdown(&self) {
        self.signature_locator.release();
        self.authenticity_scorer.release();
        self.seal_locator.release();
        self.seal_classifier.release();
        info!("Model set '{}' released", self.family);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_defaults_to_heuristic_family() {
        let config = Config::load_with(|_| None).unwrap();
        let set = ModelSet::load(&config, Metrics::new()).await.unwrap();
        assert_eq!(set.family(), "heuristic");
        assert_eq!(set.gate.pool_size(), config.models.pool_size);
        set.shutdown();
    }

    #[cfg(not(feature = "onnx"))]
    #[tokio::test]
    async fn test_onnx_backend_requires_feature() {
        let config = Config::load_with(|key| {
            (key == "MODEL_BACKEND").then(|| "onnx".to_string())
        })
        .unwrap();
        assert!(ModelSet::load(&config, Metrics::new()).await.is_err());
    }
}
