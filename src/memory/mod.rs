//! Persistent memory: actions, rollback, failures, history

pub mod action_tracker;
pub mod failure;
pub mod history;
pub mod rollback;
pub mod semantic;

pub use action_tracker::{ActionRecord, ActionTracker, RollbackStrategy, TransactionStatus};
pub use failure::{FailureAnalyzer, FailureKind};
pub use history::{HistoryRecord, IntentHistory};
pub use rollback::{Feasibility, RollbackEngine, RollbackReport};
