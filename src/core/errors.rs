// Error taxonomy for the document pipeline
//
// Stage-level errors never cross document boundaries: everything that can go
// wrong while processing one document folds into `DocumentError`, which maps
// onto the public `ErrorKind` reported in failure records. Only
// `ConfigError` is fatal to a whole batch, and only before work starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::types::FailureRecord;

/// Image normalizer errors
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("document bytes could not be decoded: {0}")]
    Decode(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),
}

/// Errors reported by a model capability backend
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Detection stage errors
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("model capability unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference exceeded its {timeout_ms}ms deadline")]
    InferenceTimeout { timeout_ms: u64 },

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("stage cancelled")]
    Cancelled,
}

impl StageError {
    /// Transient errors are retried by the orchestrator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::ModelUnavailable(_) | StageError::InferenceTimeout { .. }
        )
    }
}

impl From<ModelError> for StageError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Unavailable(msg) => StageError::ModelUnavailable(msg),
            ModelError::Inference(msg) => StageError::InferenceFailed(msg),
        }
    }
}

/// Document ingestion errors
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document {0} not found")]
    NotFound(String),

    #[error("storage failure for document {id}: {message}")]
    Storage { id: String, message: String },
}

/// Export (rendering) errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("document {0} has no enhanced rendition")]
    MissingEnhancement(String),

    #[error("original document could not be decoded: {0}")]
    Decode(String),
}

/// Pipeline stage names used in error context and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Ingestion,
    Normalization,
    Signature,
    Seal,
    Enhancement,
    Consolidation,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Ingestion => "ingestion",
            StageName::Normalization => "normalization",
            StageName::Signature => "signature",
            StageName::Seal => "seal",
            StageName::Enhancement => "enhancement",
            StageName::Consolidation => "consolidation",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public failure kinds reported per document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "DecodeError")]
    Decode,
    #[serde(rename = "UnsupportedFormatError")]
    UnsupportedFormat,
    #[serde(rename = "ModelUnavailableError")]
    ModelUnavailable,
    #[serde(rename = "InferenceTimeoutError")]
    InferenceTimeout,
    #[serde(rename = "InferenceError")]
    Inference,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "StorageError")]
    Storage,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Decode => "DecodeError",
            ErrorKind::UnsupportedFormat => "UnsupportedFormatError",
            ErrorKind::ModelUnavailable => "ModelUnavailableError",
            ErrorKind::InferenceTimeout => "InferenceTimeoutError",
            ErrorKind::Inference => "InferenceError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can terminate one document's pipeline run
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("{stage} stage failed after {attempts} attempt(s): {source}")]
    Stage {
        stage: StageName,
        attempts: u32,
        #[source]
        source: StageError,
    },

    #[error("document exceeded its {timeout_ms}ms deadline")]
    Timeout { timeout_ms: u64 },

    #[error("internal pipeline failure: {0}")]
    Internal(String),
}

impl DocumentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocumentError::Normalize(NormalizeError::Decode(_)) => ErrorKind::Decode,
            DocumentError::Normalize(NormalizeError::UnsupportedFormat(_)) => {
                ErrorKind::UnsupportedFormat
            }
            DocumentError::Ingest(IngestError::NotFound(_)) => ErrorKind::NotFound,
            DocumentError::Ingest(IngestError::Storage { .. }) => ErrorKind::Storage,
            DocumentError::Stage { source, .. } => match source {
                StageError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
                StageError::InferenceTimeout { .. } => ErrorKind::InferenceTimeout,
                StageError::InferenceFailed(_) => ErrorKind::Inference,
                StageError::Cancelled => ErrorKind::Timeout,
            },
            DocumentError::Timeout { .. } => ErrorKind::Timeout,
            DocumentError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// User-facing failure record: kind plus the Display message, never the
    /// Debug representation.
    pub fn to_failure_record(&self) -> FailureRecord {
        let attempts = match self {
            DocumentError::Stage { attempts, .. } => *attempts,
            _ => 1,
        };
        FailureRecord {
            kind: self.kind(),
            message: self.to_string(),
            attempts,
        }
    }
}

/// Configuration errors (fatal at batch start)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_concurrency must be between 1 and {max}, got {0}", max = crate::core::config::MAX_CONCURRENCY)]
    InvalidConcurrency(usize),

    #[error("{category} confidence threshold must be in [0.0, 1.0], got {value}")]
    InvalidConfidenceThreshold { category: &'static str, value: f32 },

    #[error("Overlap (IoU) threshold must be in [0.0, 1.0], got {0}")]
    InvalidOverlapThreshold(f32),

    #[error("{0} must be greater than zero")]
    InvalidTimeout(&'static str),

    #[error("max_regions must be > 0")]
    InvalidMaxRegions,

    #[error("Invalid normalizer config: {0}")]
    InvalidNormalizer(String),

    #[error("Invalid enhancement config: {0}")]
    InvalidEnhancement(String),

    #[error("Invalid seal taxonomy: {0}")]
    InvalidTaxonomy(String),

    #[error("Invalid model config: {0}")]
    InvalidModelConfig(String),

    #[error("Duplicate document id in batch: {0}")]
    DuplicateDocumentId(String),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

pub type NormalizeResult<T> = Result<T, NormalizeError>;
pub type StageResult<T> = Result<T, StageError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
