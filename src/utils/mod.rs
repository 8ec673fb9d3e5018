pub mod image_ops;
pub mod metrics;

pub use image_ops::{mime_type_for, EncodedFormat};
pub use metrics::{Metrics, MetricsSnapshot};
