//! Execution layer: memoization, scheduling, dispatch, and retry

pub mod cache;
pub mod cancel;
pub mod dependency;
pub mod parallel;
pub mod planner;

pub use cache::{IntentCache, IntentCacheStats};
pub use cancel::{CancelReason, CancellationToken};
pub use dependency::{DependencyAnalyzer, DependencyGraph};
pub use parallel::{ParallelExecutor, StepInvoker, StepOutcome};
pub use planner::AdaptivePlanner;
