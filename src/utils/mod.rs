pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{crop_bbox, encode_image, luma_stats, OutputFormat};
pub use metrics::{Metrics, MetricsSnapshot};
