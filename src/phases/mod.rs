// Pure pipeline steps. Everything here is synchronous; the orchestration
// layer moves the heavy ones onto the blocking pool.

pub mod consolidation;
pub mod enhancement;
pub mod export;
pub mod normalization;

pub use consolidation::{consolidate, resolve_overlaps, Consolidated};
pub use enhancement::Enhancer;
pub use export::{export_annotated, export_enhanced, render_annotated};
pub use normalization::Normalizer;
