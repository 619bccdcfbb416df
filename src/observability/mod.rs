//! Observability: metrics aggregation and feedback capture

pub mod feedback;
pub mod metrics;

pub use feedback::{FeedbackCollector, FeedbackEntry};
pub use metrics::{MetricsCollector, MetricsStats};
