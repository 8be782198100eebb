use crate::core::errors::ConfigError;
use crate::core::types::SealType;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Upper bound for per-batch concurrency
pub const MAX_CONCURRENCY: usize = 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub max_upload_mb: usize,
}

/// Image normalizer configuration
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Longest side of the normalized grid, in pixels
    pub max_dimension: u32,
    /// Search range for skew correction (symmetric, degrees). 0 disables it.
    pub max_skew_degrees: f32,
    pub skew_step_degrees: f32,
    /// Coarse quarter-turn correction from text-line direction
    pub auto_orient: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_dimension: 2000,
            max_skew_degrees: 5.0,
            skew_step_degrees: 0.5,
            auto_orient: true,
        }
    }
}

/// Detection stage configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub signature_confidence_threshold: f32,
    pub seal_confidence_threshold: f32,
    pub max_regions: usize,
    pub inference_timeout_ms: u64,
    pub seal_taxonomy: Vec<SealType>,
    /// Scorer confidence below which the verdict becomes indeterminate
    pub authenticity_min_confidence: f32,
}

/// Enhancement configuration
#[derive(Debug, Clone)]
pub struct EnhancementConfig {
    /// Median filter radius (0 disables denoising)
    pub denoise_strength: u32,
    /// Target luminance standard deviation (0 disables contrast stretch)
    pub contrast_target: f32,
    pub sharpen: bool,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            denoise_strength: 1,
            contrast_target: 60.0,
            sharpen: true,
        }
    }
}

/// Model family selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    /// Pure-Rust image heuristics, no model files required
    Heuristic,
    /// ONNX Runtime sessions (feature `onnx`)
    Onnx,
}

impl FromStr for ModelBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "heuristic" => Ok(ModelBackend::Heuristic),
            "onnx" => Ok(ModelBackend::Onnx),
            other => Err(ConfigError::InvalidModelConfig(format!(
                "MODEL_BACKEND must be 'heuristic' or 'onnx', got '{}'",
                other
            ))),
        }
    }
}

/// Model capability configuration
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    /// Maximum in-flight inferences across all documents
    pub pool_size: usize,
    pub breaker_failure_threshold: usize,
    pub breaker_timeout_secs: u64,
    pub inference_device: Option<String>,
    pub signature_locator_path: String,
    pub authenticity_scorer_path: String,
    pub seal_locator_path: String,
    pub seal_classifier_path: String,
    /// Square input edge for locator models
    pub input_size: u32,
}

/// Batch orchestration configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_concurrency: usize,
    pub per_document_timeout_ms: u64,
    pub stage_max_retries: u32,
    pub retry_backoff_ms: u64,
    pub overlap_threshold: f32,
}

/// Document storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub document_root: String,
    /// Settled batches kept in the result store, oldest evicted first
    pub max_retained_batches: usize,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub normalizer: NormalizerConfig,
    pub detection: DetectionConfig,
    pub enhancement: EnhancementConfig,
    pub models: ModelConfig,
    pub batch: BatchConfig,
    pub storage: StorageConfig,
}

fn read<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::load_with(|key| env::var(key).ok())
    }

    /// Loads and validates configuration from an arbitrary key lookup.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self::load_from(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let log_level = lookup("LOG_LEVEL")
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let seal_taxonomy = match lookup("SEAL_TAXONOMY") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<SealType>().map_err(ConfigError::InvalidTaxonomy))
                .collect::<Result<Vec<_>, _>>()?,
            None => SealType::ALL.to_vec(),
        };

        let backend = match lookup("MODEL_BACKEND") {
            Some(s) => s.parse()?,
            None => ModelBackend::Heuristic,
        };

        Ok(Self {
            server: ServerConfig {
                port: read(lookup, "SERVER_PORT", 8080),
                host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                log_level,
                max_upload_mb: read(lookup, "MAX_UPLOAD_MB", 64),
            },
            normalizer: NormalizerConfig {
                max_dimension: read(lookup, "MAX_DIMENSION", 2000),
                max_skew_degrees: read(lookup, "MAX_SKEW_DEGREES", 5.0),
                skew_step_degrees: read(lookup, "SKEW_STEP_DEGREES", 0.5),
                auto_orient: read(lookup, "AUTO_ORIENT", true),
            },
            detection: DetectionConfig {
                signature_confidence_threshold: read(lookup, "SIGNATURE_CONFIDENCE_THRESHOLD", 0.5),
                seal_confidence_threshold: read(lookup, "SEAL_CONFIDENCE_THRESHOLD", 0.5),
                max_regions: read(lookup, "MAX_REGIONS", 32),
                inference_timeout_ms: read(lookup, "INFERENCE_TIMEOUT_MS", 10_000),
                seal_taxonomy,
                authenticity_min_confidence: read(lookup, "AUTHENTICITY_MIN_CONFIDENCE", 0.6),
            },
            enhancement: EnhancementConfig {
                denoise_strength: read(lookup, "DENOISE_STRENGTH", 1),
                contrast_target: read(lookup, "CONTRAST_TARGET", 60.0),
                sharpen: read(lookup, "SHARPEN", true),
            },
            models: ModelConfig {
                backend,
                pool_size: lookup("MODEL_POOL_SIZE")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or_else(|| {
                        // Half the cores, at least 2
                        std::cmp::max(num_cpus::get() / 2, 2)
                    }),
                breaker_failure_threshold: read(lookup, "BREAKER_FAILURE_THRESHOLD", 5),
                breaker_timeout_secs: read(lookup, "BREAKER_TIMEOUT_SECS", 30),
                inference_device: lookup("INFERENCE_BACKEND")
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                signature_locator_path: lookup("SIGNATURE_LOCATOR_MODEL")
                    .unwrap_or_else(|| "models/signature_locator.onnx".to_string()),
                authenticity_scorer_path: lookup("AUTHENTICITY_SCORER_MODEL")
                    .unwrap_or_else(|| "models/authenticity_scorer.onnx".to_string()),
                seal_locator_path: lookup("SEAL_LOCATOR_MODEL")
                    .unwrap_or_else(|| "models/seal_locator.onnx".to_string()),
                seal_classifier_path: lookup("SEAL_CLASSIFIER_MODEL")
                    .unwrap_or_else(|| "models/seal_classifier.onnx".to_string()),
                input_size: read(lookup, "MODEL_INPUT_SIZE", 640),
            },
            batch: BatchConfig {
                max_concurrency: read(lookup, "MAX_CONCURRENCY", 4),
                per_document_timeout_ms: read(lookup, "PER_DOCUMENT_TIMEOUT_MS", 60_000),
                stage_max_retries: read(lookup, "STAGE_MAX_RETRIES", 2),
                retry_backoff_ms: read(lookup, "RETRY_BACKOFF_MS", 200),
                overlap_threshold: read(lookup, "OVERLAP_THRESHOLD", 0.5),
            },
            storage: StorageConfig {
                document_root: lookup("DOCUMENT_ROOT").unwrap_or_else(|| "documents".to_string()),
                max_retained_batches: read(lookup, "MAX_RETAINED_BATCHES", 256),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_upload_mb == 0 {
            return Err(ConfigError::EnvVarError(
                "MAX_UPLOAD_MB must be > 0".to_string(),
            ));
        }

        if self.storage.max_retained_batches == 0 {
            return Err(ConfigError::EnvVarError(
                "MAX_RETAINED_BATCHES must be > 0".to_string(),
            ));
        }

        if self.models.pool_size == 0 {
            return Err(ConfigError::InvalidModelConfig(
                "MODEL_POOL_SIZE must be > 0".to_string(),
            ));
        }
        if self.models.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidModelConfig(
                "BREAKER_FAILURE_THRESHOLD must be > 0".to_string(),
            ));
        }
        if !(32..=4096).contains(&self.models.input_size) {
            return Err(ConfigError::InvalidModelConfig(format!(
                "MODEL_INPUT_SIZE must be between 32 and 4096, got {}",
                self.models.input_size
            )));
        }

        // Everything batch-scoped is validated again per batch
        PipelineConfig::from_config(self).validate()
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }

    pub fn model_pool_size(&self) -> usize {
        self.models.pool_size
    }

    pub fn document_root(&self) -> &str {
        &self.storage.document_root
    }

    pub fn max_retained_batches(&self) -> usize {
        self.storage.max_retained_batches
    }
}

/// Per-stage detection settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageConfig {
    pub confidence_threshold: f32,
    pub max_regions: usize,
}

/// Settings for one batch run, derived from `Config` and optionally
/// overridden per batch.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_concurrency: usize,
    pub per_document_timeout: Duration,
    pub overlap_threshold: f32,
    pub signature: StageConfig,
    pub seal: StageConfig,
    pub inference_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub authenticity_min_confidence: f32,
    pub seal_taxonomy: Vec<SealType>,
    pub normalizer: NormalizerConfig,
    pub enhancement: EnhancementConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            per_document_timeout: Duration::from_secs(60),
            overlap_threshold: 0.5,
            signature: StageConfig {
                confidence_threshold: 0.5,
                max_regions: 32,
            },
            seal: StageConfig {
                confidence_threshold: 0.5,
                max_regions: 32,
            },
            inference_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            authenticity_min_confidence: 0.6,
            seal_taxonomy: SealType::ALL.to_vec(),
            normalizer: NormalizerConfig::default(),
            enhancement: EnhancementConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        let detection = &config.detection;
        Self {
            max_concurrency: config.batch.max_concurrency,
            per_document_timeout: Duration::from_millis(config.batch.per_document_timeout_ms),
            overlap_threshold: config.batch.overlap_threshold,
            signature: StageConfig {
                confidence_threshold: detection.signature_confidence_threshold,
                max_regions: detection.max_regions,
            },
            seal: StageConfig {
                confidence_threshold: detection.seal_confidence_threshold,
                max_regions: detection.max_regions,
            },
            inference_timeout: Duration::from_millis(detection.inference_timeout_ms),
            max_retries: config.batch.stage_max_retries,
            retry_backoff: Duration::from_millis(config.batch.retry_backoff_ms),
            authenticity_min_confidence: detection.authenticity_min_confidence,
            seal_taxonomy: detection.seal_taxonomy.clone(),
            normalizer: config.normalizer.clone(),
            enhancement: config.enhancement.clone(),
        }
    }

    /// Applies per-batch overrides. The result still has to be validated.
    pub fn with_overrides(mut self, options: &BatchOptions) -> Self {
        if let Some(v) = options.max_concurrency {
            self.max_concurrency = v;
        }
        if let Some(v) = options.per_document_timeout_ms {
            self.per_document_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.overlap_threshold {
            self.overlap_threshold = v;
        }
        if let Some(v) = options.signature_confidence_threshold {
            self.signature.confidence_threshold = v;
        }
        if let Some(v) = options.seal_confidence_threshold {
            self.seal.confidence_threshold = v;
        }
        if let Some(v) = options.max_regions {
            self.signature.max_regions = v;
            self.seal.max_regions = v;
        }
        if let Some(v) = options.stage_max_retries {
            self.max_retries = v;
        }
        if let Some(v) = options.sharpen {
            self.enhancement.sharpen = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrency));
        }

        for (category, stage) in [("signature", &self.signature), ("seal", &self.seal)] {
            if !(0.0..=1.0).contains(&stage.confidence_threshold) {
                return Err(ConfigError::InvalidConfidenceThreshold {
                    category,
                    value: stage.confidence_threshold,
                });
            }
            if stage.max_regions == 0 {
                return Err(ConfigError::InvalidMaxRegions);
            }
        }

        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(ConfigError::InvalidOverlapThreshold(self.overlap_threshold));
        }
        if !(0.0..=1.0).contains(&self.authenticity_min_confidence) {
            return Err(ConfigError::InvalidConfidenceThreshold {
                category: "authenticity",
                value: self.authenticity_min_confidence,
            });
        }

        if self.per_document_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("per_document_timeout"));
        }
        if self.inference_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("inference_timeout"));
        }

        if self.seal_taxonomy.is_empty() {
            return Err(ConfigError::InvalidTaxonomy(
                "taxonomy must not be empty".to_string(),
            ));
        }
        if !self.seal_taxonomy.contains(&SealType::Unknown) {
            return Err(ConfigError::InvalidTaxonomy(
                "taxonomy must contain 'unknown'".to_string(),
            ));
        }

        let n = &self.normalizer;
        if n.max_dimension < 16 {
            return Err(ConfigError::InvalidNormalizer(format!(
                "max_dimension must be at least 16, got {}",
                n.max_dimension
            )));
        }
        if !(0.0..=45.0).contains(&n.max_skew_degrees) {
            return Err(ConfigError::InvalidNormalizer(format!(
                "max_skew_degrees must be between 0 and 45, got {}",
                n.max_skew_degrees
            )));
        }
        if n.max_skew_degrees > 0.0 && !(n.skew_step_degrees > 0.0) {
            return Err(ConfigError::InvalidNormalizer(format!(
                "skew_step_degrees must be > 0, got {}",
                n.skew_step_degrees
            )));
        }

        let e = &self.enhancement;
        if e.denoise_strength > 10 {
            return Err(ConfigError::InvalidEnhancement(format!(
                "denoise_strength must be between 0 and 10, got {}",
                e.denoise_strength
            )));
        }
        if !(0.0..=128.0).contains(&e.contrast_target) {
            return Err(ConfigError::InvalidEnhancement(format!(
                "contrast_target must be between 0 and 128, got {}",
                e.contrast_target
            )));
        }

        Ok(())
    }
}

/// Per-batch overrides accepted from API callers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub max_concurrency: Option<usize>,
    pub per_document_timeout_ms: Option<u64>,
    pub overlap_threshold: Option<f32>,
    pub signature_confidence_threshold: Option<f32>,
    pub seal_confidence_threshold: Option<f32>,
    pub max_regions: Option<usize>,
    pub stage_max_retries: Option<u32>,
    pub sharpen: Option<bool>,
}
