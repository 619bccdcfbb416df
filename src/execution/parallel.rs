//! Level-wise parallel step execution
//!
//! Executes an intent level by level. Within a level, steps are dispatched
//! onto a bounded worker pool with a per-step deadline; the final results
//! array always preserves the original plan order. A failed step leaves an
//! error outcome in its slot and execution continues, because a level
//! completing does not imply success: downstream steps that truly needed a
//! failed predecessor observe the error through their own invocation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::core::error::{MaestroError, Result};
use crate::execution::cancel::CancellationToken;
use crate::execution::dependency::DependencyAnalyzer;
use crate::intent::{Intent, Step};

/// Executes one step; the adaptive planner is the production implementation
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(&self, step: &Step) -> Result<Value>;
}

/// Outcome of one step slot
#[derive(Debug)]
pub enum StepOutcome {
    Success(Value),
    Failed(MaestroError),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn error(&self) -> Option<&MaestroError> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Success(_) => None,
        }
    }

    /// Result value for observations and tracking; failures render as
    /// `{"error": message}` slots.
    pub fn as_value(&self) -> Value {
        match self {
            Self::Success(v) => v.clone(),
            Self::Failed(e) => json!({ "error": e.to_string() }),
        }
    }
}

/// Bounded, deadline-enforcing level dispatcher
pub struct ParallelExecutor {
    max_workers: usize,
    step_deadline: Duration,
    analyzer: DependencyAnalyzer,
}

impl ParallelExecutor {
    pub fn new(max_workers: usize, step_deadline: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            step_deadline,
            analyzer: DependencyAnalyzer::new(),
        }
    }

    /// Execute all steps, honoring dependency levels.
    ///
    /// Returns one outcome per step in original plan order. Cancellation
    /// aborts pending levels promptly; in-flight steps finish or time out.
    pub async fn execute(
        &self,
        intent: &Intent,
        invoker: Arc<dyn StepInvoker>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepOutcome>> {
        let steps = &intent.steps;
        let n = steps.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let graph = self.analyzer.analyze(intent);
        let mut results: Vec<Option<StepOutcome>> = (0..n).map(|_| None).collect();

        for (level_idx, level) in graph.levels.iter().enumerate() {
            cancel.check()?;

            if level.len() == 1 {
                let step_idx = level[0];
                let outcome = self.run_step(&steps[step_idx], invoker.clone()).await;
                results[step_idx] = Some(outcome);
                continue;
            }

            debug!(
                level = level_idx + 1,
                width = level.len(),
                "dispatching parallel level"
            );

            let semaphore = Arc::new(Semaphore::new(self.max_workers));
            let mut join_set: JoinSet<(usize, StepOutcome)> = JoinSet::new();

            for &step_idx in level {
                let step = steps[step_idx].clone();
                let invoker = invoker.clone();
                let semaphore = semaphore.clone();
                let deadline = self.step_deadline;

                join_set.spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore never closed");
                    let outcome = invoke_with_deadline(&step, invoker.as_ref(), deadline).await;
                    (step_idx, outcome)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((step_idx, outcome)) => {
                        if let Some(err) = outcome.error() {
                            warn!(step = step_idx, error = %err, "step failed in level");
                        }
                        results[step_idx] = Some(outcome);
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "worker panicked");
                    }
                }
            }

            // A panicked worker leaves its slot empty; record it as failed.
            for &step_idx in level {
                if results[step_idx].is_none() {
                    results[step_idx] = Some(StepOutcome::Failed(MaestroError::internal(
                        "executor",
                        "worker terminated without producing a result",
                    )));
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|slot| slot.expect("every level fills its slots"))
            .collect())
    }

    async fn run_step(&self, step: &Step, invoker: Arc<dyn StepInvoker>) -> StepOutcome {
        invoke_with_deadline(step, invoker.as_ref(), self.step_deadline).await
    }
}

async fn invoke_with_deadline(
    step: &Step,
    invoker: &dyn StepInvoker,
    deadline: Duration,
) -> StepOutcome {
    match tokio::time::timeout(deadline, invoker.invoke(step)).await {
        Ok(Ok(value)) => StepOutcome::Success(value),
        Ok(Err(err)) => StepOutcome::Failed(err),
        Err(_) => StepOutcome::Failed(MaestroError::Timeout {
            operation: format!("{}.{}", step.tool, step.action),
            seconds: deadline.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::execution::cancel::CancelReason;

    struct EchoInvoker;

    #[async_trait]
    impl StepInvoker for EchoInvoker {
        async fn invoke(&self, step: &Step) -> Result<Value> {
            Ok(json!({ "ran": step.signature() }))
        }
    }

    struct FlakyInvoker {
        fail_action: &'static str,
    }

    #[async_trait]
    impl StepInvoker for FlakyInvoker {
        async fn invoke(&self, step: &Step) -> Result<Value> {
            if step.action == self.fail_action {
                Err(MaestroError::tool(
                    step.tool.as_str(),
                    step.action.as_str(),
                    "boom",
                ))
            } else {
                Ok(json!({ "ran": step.action }))
            }
        }
    }

    struct SlowInvoker;

    #[async_trait]
    impl StepInvoker for SlowInvoker {
        async fn invoke(&self, _step: &Step) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    struct CountingInvoker {
        peak: Arc<AtomicUsize>,
        current: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepInvoker for CountingInvoker {
        async fn invoke(&self, _step: &Step) -> Result<Value> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    fn organize_intent() -> Intent {
        Intent::parse(
            r#"{
            "goal": "organize downloads",
            "steps": [
                {"tool": "FileOps", "action": "create_dir", "args": {"path": "/tmp/PDFs"}, "risk": 1},
                {"tool": "FileOps", "action": "create_dir", "args": {"path": "/tmp/Images"}, "risk": 1},
                {"tool": "FileOps", "action": "move_file", "args": {"source": "/tmp/a.pdf", "dest": "/tmp/PDFs/a.pdf"}, "risk": 1},
                {"tool": "FileOps", "action": "move_file", "args": {"source": "/tmp/b.jpg", "dest": "/tmp/Images/b.jpg"}, "risk": 1}
            ]
        }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_results_preserve_plan_order() {
        let executor = ParallelExecutor::new(4, Duration::from_secs(10));
        let results = executor
            .execute(
                &organize_intent(),
                Arc::new(EchoInvoker),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        for (idx, outcome) in results.iter().enumerate() {
            let value = outcome.as_value();
            let ran = value.get("ran").unwrap().as_str().unwrap();
            assert!(ran.contains(&organize_intent().steps[idx].action));
        }
    }

    #[tokio::test]
    async fn test_failure_fills_error_slot_and_continues() {
        let executor = ParallelExecutor::new(4, Duration::from_secs(10));
        let results = executor
            .execute(
                &organize_intent(),
                Arc::new(FlakyInvoker {
                    fail_action: "create_dir",
                }),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!results[0].is_success());
        assert!(!results[1].is_success());
        // Later levels still ran.
        assert!(results[2].is_success());
        assert!(results[3].is_success());
        assert!(results[0].as_value().get("error").is_some());
    }

    #[tokio::test]
    async fn test_step_deadline_enforced() {
        let intent = Intent::parse(
            r#"{"goal": "slow", "steps": [
                {"tool": "ProcessOps", "action": "run", "args": {"command": "sleep"}, "risk": 0}
            ]}"#,
        )
        .unwrap();

        let executor = ParallelExecutor::new(2, Duration::from_millis(50));
        let results = executor
            .execute(&intent, Arc::new(SlowInvoker), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            results[0].error(),
            Some(MaestroError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let intent = Intent::parse(
            r#"{"goal": "fan out", "steps": [
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp/a"}, "risk": 0},
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp/b"}, "risk": 0},
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp/c"}, "risk": 0},
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp/d"}, "risk": 0},
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp/e"}, "risk": 0},
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp/f"}, "risk": 0}
            ]}"#,
        )
        .unwrap();

        let peak = Arc::new(AtomicUsize::new(0));
        let invoker = CountingInvoker {
            peak: peak.clone(),
            current: Arc::new(AtomicUsize::new(0)),
        };

        let executor = ParallelExecutor::new(2, Duration::from_secs(10));
        executor
            .execute(&intent, Arc::new(invoker), &CancellationToken::new())
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_pending_levels() {
        let executor = ParallelExecutor::new(4, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel(CancelReason::UserRequested);

        let err = executor
            .execute(&organize_intent(), Arc::new(EchoInvoker), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Cancelled));
    }
}
