pub mod detection;
pub mod ingestion;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx_builder; // Shared ONNX session builder for every onnx capability

// Re-export commonly used services
pub use detection::{DetectionStage, SealDetector, SignatureDetector};
pub use ingestion::{DocumentInput, DocumentSource, FsDocumentSource, MemoryDocumentSource};
pub use model::{Located, ModelSet, RegionLocator, RegionScorer, Scored};
