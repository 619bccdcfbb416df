//! Reasoning layer: complexity analysis, routing, goal tracking, patterns

pub mod complexity;
pub mod goal_tracker;
pub mod oracle;
pub mod patterns;
pub mod router;

pub use complexity::{ComplexityAnalyzer, TaskComplexity};
pub use goal_tracker::{GoalStatus, GoalTracker};
pub use oracle::{ChunkStream, Oracle};
pub use patterns::{DetectedPattern, PatternDetector, PatternType};
pub use router::{ModelRouter, ModelTier, RouterDecision};
