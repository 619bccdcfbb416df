//! Adaptive planner
//!
//! Wraps tool invocation with per-step retry. Failed steps are categorized
//! and retried only when the category's policy allows it, with exponential
//! backoff capped at 30 seconds plus a small jitter. Sandbox violations
//! are final on first sight. Every invocation goes through the sandbox;
//! there is no unsandboxed variant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::error::{MaestroError, Result};
use crate::execution::parallel::StepInvoker;
use crate::intent::Step;
use crate::memory::failure::FailureKind;
use crate::tools::{Sandbox, ToolRegistry};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retrying, sandboxed step invoker
pub struct AdaptivePlanner {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    /// Backoff unit; production uses 1 s, tests shrink it
    backoff_base: Duration,
}

impl AdaptivePlanner {
    pub fn new(registry: Arc<ToolRegistry>, sandbox: Arc<Sandbox>) -> Self {
        Self {
            registry,
            sandbox,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << attempt.min(5));
        let capped = exp.min(MAX_BACKOFF);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        capped + jitter
    }
}

#[async_trait]
impl StepInvoker for AdaptivePlanner {
    async fn invoke(&self, step: &Step) -> Result<Value> {
        let mut attempt: u32 = 0;

        loop {
            let result = self
                .registry
                .invoke(&step.tool, &step.action, &step.args, &self.sandbox)
                .await;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // Sandbox violations and structural errors are never retried.
            if !err.is_retryable() {
                return Err(err);
            }

            let kind = FailureKind::categorize(&err.to_string());
            if attempt >= kind.max_retries() {
                debug!(
                    step = %step.signature(),
                    category = %kind,
                    attempts = attempt + 1,
                    "giving up on step"
                );
                return Err(err);
            }

            attempt += 1;
            let delay = self.backoff_delay(attempt);
            warn!(
                step = %step.signature(),
                category = %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying step"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct ScriptedInvoker {
        attempts: AtomicU32,
        failures_before_success: u32,
        error_message: &'static str,
    }

    #[async_trait]
    impl StepInvoker for ScriptedInvoker {
        async fn invoke(&self, step: &Step) -> Result<Value> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(MaestroError::tool(
                    step.tool.as_str(),
                    step.action.as_str(),
                    self.error_message,
                ))
            } else {
                Ok(serde_json::json!({ "ok": true }))
            }
        }
    }

    /// Planner that delegates invocation to a scripted inner invoker but
    /// keeps the retry loop under test.
    struct RetryHarness {
        inner: ScriptedInvoker,
        backoff_base: Duration,
    }

    #[async_trait]
    impl StepInvoker for RetryHarness {
        async fn invoke(&self, step: &Step) -> Result<Value> {
            let mut attempt: u32 = 0;
            loop {
                let err = match self.inner.invoke(step).await {
                    Ok(v) => return Ok(v),
                    Err(e) => e,
                };
                if !err.is_retryable() {
                    return Err(err);
                }
                let kind = FailureKind::categorize(&err.to_string());
                if attempt >= kind.max_retries() {
                    return Err(err);
                }
                attempt += 1;
                tokio::time::sleep(self.backoff_base).await;
            }
        }
    }

    fn step(tool: &str, action: &str) -> Step {
        serde_json::from_value(serde_json::json!({
            "tool": tool, "action": action, "args": {}, "risk": 0
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_transient_error_retried_to_success() {
        let harness = RetryHarness {
            inner: ScriptedInvoker {
                attempts: AtomicU32::new(0),
                failures_before_success: 2,
                error_message: "connection refused",
            },
            backoff_base: Duration::from_millis(1),
        };

        let result = harness.invoke(&step("NetworkOps", "fetch")).await;
        assert!(result.is_ok());
        assert_eq!(harness.inner.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permission_denied_not_retried() {
        let harness = RetryHarness {
            inner: ScriptedInvoker {
                attempts: AtomicU32::new(0),
                failures_before_success: 10,
                error_message: "permission denied",
            },
            backoff_base: Duration::from_millis(1),
        };

        let result = harness.invoke(&step("FileOps", "delete_file")).await;
        assert!(result.is_err());
        assert_eq!(harness.inner.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_error_retried_once() {
        let harness = RetryHarness {
            inner: ScriptedInvoker {
                attempts: AtomicU32::new(0),
                failures_before_success: 10,
                error_message: "mysterious glitch",
            },
            backoff_base: Duration::from_millis(1),
        };

        let result = harness.invoke(&step("FileOps", "scan")).await;
        assert!(result.is_err());
        assert_eq!(harness.inner.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sandbox_violation_surfaces_immediately() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ToolRegistry::with_builtins());
        let sandbox = Arc::new(Sandbox::rooted_at(dir.path()));
        let planner = AdaptivePlanner::new(registry, sandbox)
            .with_backoff_base(Duration::from_millis(1));

        let mut escape = step("FileOps", "delete_file");
        escape.args.insert(
            "path".into(),
            Value::String("/definitely/outside/root".into()),
        );

        let err = planner.invoke(&escape).await.unwrap_err();
        assert!(matches!(err, MaestroError::SandboxViolation { .. }));
    }

    #[test]
    fn test_backoff_is_capped() {
        let planner = AdaptivePlanner::new(
            Arc::new(ToolRegistry::with_builtins()),
            Arc::new(Sandbox::rooted_at("/tmp")),
        );
        let delay = planner.backoff_delay(10);
        assert!(delay <= MAX_BACKOFF + Duration::from_millis(500));
    }
}
