pub mod batch_orchestrator;
pub mod document_pipeline;
pub mod result_store;

pub use batch_orchestrator::{BatchHandle, BatchOrchestrator};
pub use document_pipeline::{DocumentPipeline, ProcessedDocument};
pub use result_store::ResultStore;
