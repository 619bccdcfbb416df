//! Cancellation for long-running executions
//!
//! Pull-based: a token stores the first cancel reason it receives, and
//! child tokens consult their parent chain on every check. Propagation
//! therefore needs no channels or background tasks and is visible to a
//! child the instant the parent is cancelled. The executor and the
//! iterative loop poll `check()` at level and iteration boundaries; the
//! reason survives for reporting after the unwind.

use std::sync::{Arc, Mutex};

use crate::core::error::{MaestroError, Result};

/// Why an execution was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    UserRequested,
    DeadlineExceeded,
    Shutdown,
    Failed(String),
}

/// Cancellation token shared across the executor and orchestrator.
///
/// Cloning shares the same slot; `child()` creates a token that is
/// cancelled whenever any ancestor is, while its own cancellation leaves
/// the ancestors untouched.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Node>,
}

#[derive(Debug)]
struct Node {
    reason: Mutex<Option<CancelReason>>,
    parent: Option<Arc<Node>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Node {
                reason: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Request cancellation. The first reason wins; later calls keep it.
    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.inner.reason.lock().expect("cancel slot poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// The effective reason, taking the nearest cancelled ancestor.
    pub fn reason(&self) -> Option<CancelReason> {
        let mut node = Some(&self.inner);
        while let Some(current) = node {
            let slot = current.reason.lock().expect("cancel slot poisoned");
            if let Some(reason) = slot.clone() {
                return Some(reason);
            }
            drop(slot);
            node = current.parent.as_ref();
        }
        None
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(_) => Err(MaestroError::Cancelled),
            None => Ok(()),
        }
    }

    /// A token scoped below this one. Cancelling the child does not
    /// touch this token; cancelling this token cancels the child.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Node {
                reason: Mutex::new(None),
                parent: Some(self.inner.clone()),
            }),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel(CancelReason::DeadlineExceeded);
        token.cancel(CancelReason::UserRequested);

        assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
        assert!(matches!(token.check(), Err(MaestroError::Cancelled)));
    }

    #[test]
    fn test_clones_share_one_slot() {
        let token = CancellationToken::new();
        let sibling = token.clone();

        sibling.cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_child_sees_ancestor_cancellation_immediately() {
        let root = CancellationToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel(CancelReason::UserRequested);

        // Pull-based propagation: no scheduling involved.
        assert!(child.is_cancelled());
        assert_eq!(grandchild.reason(), Some(CancelReason::UserRequested));
    }

    #[test]
    fn test_child_cancellation_is_scoped() {
        let root = CancellationToken::new();
        let child = root.child();

        child.cancel(CancelReason::Failed("iteration gave up".to_string()));

        assert!(child.is_cancelled());
        assert!(root.check().is_ok());
        assert_eq!(root.reason(), None);
    }

    #[test]
    fn test_nearest_cancelled_ancestor_wins() {
        let root = CancellationToken::new();
        let child = root.child();
        let grandchild = child.child();

        root.cancel(CancelReason::Shutdown);
        child.cancel(CancelReason::UserRequested);

        // The grandchild reports its nearest cancelled ancestor.
        assert_eq!(grandchild.reason(), Some(CancelReason::UserRequested));
        assert_eq!(root.reason(), Some(CancelReason::Shutdown));
    }
}
