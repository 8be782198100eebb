pub mod config;
pub mod errors;
pub mod geometry;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{BatchOptions, Config, PipelineConfig, StageConfig};
pub use errors::{
    ConfigError, DocumentError, ErrorKind, ExportError, IngestError, ModelError, NormalizeError,
    StageError, StageName,
};
pub use geometry::{AffineTransform, BBox, Point, ProjectedRegion, Region};
pub use types::{
    BatchReport, CancelFlag, Category, Classification, Detection, Document, DocumentResult,
    DocumentStatus, EnhancedImage, NormalizedImage, ResolvedDetection, SealType,
};
