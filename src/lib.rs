// Library exports for the document audit pipeline

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::{BatchOptions, Config, PipelineConfig},
    errors::{ConfigError, DocumentError, ErrorKind, ExportError, StageError},
    types::{BatchReport, Document, DocumentResult, DocumentStatus, StatusEvent},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ModelGate};

pub use orchestration::{BatchHandle, BatchOrchestrator, ResultStore};

pub use services::{DocumentInput, DocumentSource, FsDocumentSource, MemoryDocumentSource, ModelSet};

pub use utils::{Metrics, OutputFormat};
