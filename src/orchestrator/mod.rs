//! Orchestrator
//!
//! The master state machine for one utterance: complexity analysis,
//! context building, routing, cache lookup, translation, pre-execution
//! analysis, confirmation gates, transactional execution, and the
//! post-execution memory/metrics/feedback updates. Complex tasks switch
//! into the iterative plan-act-observe loop with batched user checkpoints
//! and a stuck detector.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::brain::complexity::{self, ComplexityAnalyzer, TaskComplexity};
use crate::brain::goal_tracker::{self, GoalTracker};
use crate::brain::oracle::{self, Oracle};
use crate::brain::router::{ModelRouter, ModelTier};
use crate::cli::output;
use crate::core::config::MaestroConfig;
use crate::core::context::ContextBuilder;
use crate::core::error::{MaestroError, Result};
use crate::execution::cache::IntentCache;
use crate::execution::cancel::CancellationToken;
use crate::execution::dependency::DependencyAnalyzer;
use crate::execution::parallel::{ParallelExecutor, StepOutcome};
use crate::execution::planner::AdaptivePlanner;
use crate::intent::Intent;
use crate::memory::action_tracker::{ActionTracker, TransactionStatus};
use crate::memory::failure::FailureAnalyzer;
use crate::memory::history::IntentHistory;
use crate::observability::feedback::FeedbackCollector;
use crate::observability::metrics::MetricsCollector;
use crate::tools::{Sandbox, ToolRegistry};

/// Options for one `execute` call
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub explain: bool,
    pub iterative: bool,
    pub force_oneshot: bool,
}

/// Final outcome of one utterance
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed {
        message: String,
        transaction_id: Option<String>,
        iterations: u32,
    },
    DryRun {
        plan: String,
    },
}

/// Answers confirmation prompts; injectable so tests never block
pub type ConfirmHandler = Box<dyn Fn(&str) -> bool + Send + Sync>;

fn default_confirm(prompt: &str) -> bool {
    if !console::user_attended() {
        return false;
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

/// End-to-end controller wiring every component together
pub struct Orchestrator {
    config: MaestroConfig,
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    oracle: Arc<dyn Oracle>,
    router: ModelRouter,
    cache: Mutex<IntentCache>,
    tracker: Arc<ActionTracker>,
    failures: FailureAnalyzer,
    complexity: ComplexityAnalyzer,
    dependencies: DependencyAnalyzer,
    executor: ParallelExecutor,
    planner: Arc<AdaptivePlanner>,
    context_builder: ContextBuilder,
    history: IntentHistory,
    metrics: MetricsCollector,
    feedback: FeedbackCollector,
    confirm: ConfirmHandler,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: MaestroConfig, oracle: Arc<dyn Oracle>) -> Result<Self> {
        let state_root = config.state_root.clone();
        std::fs::create_dir_all(&state_root).map_err(|_| MaestroError::StateDirCreation {
            path: state_root.clone(),
        })?;

        let registry = Arc::new(ToolRegistry::with_builtins());
        let sandbox = Arc::new(Sandbox::new(&config.sandbox));
        let planner = Arc::new(AdaptivePlanner::new(registry.clone(), sandbox.clone()));
        let tracker = Arc::new(ActionTracker::open(&state_root)?);

        let force_model = config
            .router
            .force_model
            .as_deref()
            .and_then(ModelTier::from_str);

        Ok(Self {
            router: ModelRouter::new(
                &state_root,
                force_model,
                config.router.enable_fallback,
                config.router.max_fallbacks,
            ),
            cache: Mutex::new(IntentCache::new(
                &state_root,
                config.cache.ttl_seconds,
                config.cache.max_entries,
            )),
            failures: FailureAnalyzer::open(&state_root)?,
            complexity: ComplexityAnalyzer::new(),
            dependencies: DependencyAnalyzer::new(),
            executor: ParallelExecutor::new(
                config.executor.max_workers,
                std::time::Duration::from_secs(config.executor.step_deadline_seconds),
            ),
            context_builder: ContextBuilder::new(),
            history: IntentHistory::open(&state_root),
            metrics: MetricsCollector::new(&state_root),
            feedback: FeedbackCollector::new(
                &state_root,
                config.feedback.sample_rate,
                config.feedback.prompts_enabled,
            ),
            confirm: Box::new(default_confirm),
            cancel: CancellationToken::new(),
            registry,
            sandbox,
            oracle,
            planner,
            tracker,
            config,
        })
    }

    /// Replace the confirmation handler (tests, non-interactive embeds).
    pub fn with_confirm_handler(mut self, handler: ConfirmHandler) -> Self {
        self.confirm = handler;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> Arc<ActionTracker> {
        self.tracker.clone()
    }

    pub fn sandbox(&self) -> Arc<Sandbox> {
        self.sandbox.clone()
    }

    pub fn history(&self) -> &IntentHistory {
        &self.history
    }

    pub fn state_root(&self) -> &std::path::Path {
        &self.config.state_root
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Execute one natural-language command.
    pub async fn execute(&self, utterance: &str, options: ExecuteOptions) -> Result<Outcome> {
        let task = self.classify(utterance, options.force_oneshot).await;

        if (task.needs_iteration || options.iterative) && !options.force_oneshot {
            output::print_dim(&format!(
                "Detected complex task (confidence {:.0}%): {}",
                task.confidence * 100.0,
                task.reasoning
            ));
            return self.execute_iterative(utterance, &options).await;
        }

        self.execute_oneshot(utterance, &options).await
    }

    /// Heuristic classification with an oracle override when unsure.
    async fn classify(&self, utterance: &str, force_oneshot: bool) -> TaskComplexity {
        let heuristic = self.complexity.analyze(utterance);
        if force_oneshot || self.complexity.is_confident(&heuristic) {
            return heuristic;
        }

        let prompt = complexity::classification_prompt(utterance);
        let verdict = async {
            let stream = self.oracle.reflect(&prompt, ModelTier::Cheap).await.ok()?;
            let text = oracle::collect_stream(stream, &self.cancel).await.ok()?;
            complexity::parse_oracle_verdict(&text)
        }
        .await;

        match verdict {
            Some(oracle_view) => {
                debug!(reasoning = %oracle_view.reasoning, "oracle overrode complexity verdict");
                oracle_view
            }
            None => heuristic,
        }
    }

    // --- one-shot path ---

    async fn execute_oneshot(&self, utterance: &str, options: &ExecuteOptions) -> Result<Outcome> {
        let started = Instant::now();

        let snapshot = self.context_builder.build().await;
        let context = snapshot.to_prompt();
        let cache_context = snapshot.cache_context();

        let (intent, tier, cache_hit) = self
            .translate(utterance, &context, &cache_context, &[])
            .await?;

        self.pre_execution_gate(&intent, options)?;

        if options.dry_run {
            let mut plan = output::render_plan(&intent);
            if intent.steps.len() > 1 {
                plan.push('\n');
                plan.push_str(&self.dependencies.visualize(&intent));
            }
            return Ok(Outcome::DryRun { plan });
        }

        output::print_goal(&intent.goal);

        let txn_id = self.tracker.begin(utterance, &intent.goal)?;
        let run = self.run_intent(&intent).await;

        match run {
            Ok(_observations) => {
                self.tracker.end(&txn_id, TransactionStatus::Completed)?;
                self.finish_command(utterance, &intent, tier, cache_hit, started, true);
                output::print_success("Plan executed successfully");
                Ok(Outcome::Completed {
                    message: "Plan executed successfully".to_string(),
                    transaction_id: Some(txn_id),
                    iterations: 1,
                })
            }
            Err(err) => {
                if let Err(close_err) = self.tracker.end(&txn_id, TransactionStatus::Failed) {
                    warn!(error = %close_err, "failed to close transaction");
                }
                self.report_failure(utterance, &intent, &err);
                self.finish_command(utterance, &intent, tier, cache_hit, started, false);
                Err(err)
            }
        }
    }

    /// Translate via cache or the routed oracle with fallback cascade.
    async fn translate(
        &self,
        utterance: &str,
        context: &str,
        cache_context: &str,
        observations: &[String],
    ) -> Result<(Intent, ModelTier, bool)> {
        let (tier, score) = self.router.route(utterance, !observations.is_empty());
        if score.score > 0.5 {
            output::print_dim(&format!(
                "Task complexity {:.2}, using {} tier",
                score.score, tier
            ));
        }

        // Iterative re-planning must see fresh observations, so only the
        // plain one-shot translation is memoized.
        if observations.is_empty() {
            let mut cache = self.cache.lock().await;
            if let Some(intent) = cache.get(utterance, cache_context) {
                output::print_dim("Cache hit (instant, zero tokens)");
                self.router.track_cache_hit();
                self.router.track_tokens(tier, 0);
                return Ok((intent, tier, true));
            }
        }

        let spinner = if console::user_attended() {
            let s = indicatif::ProgressBar::new_spinner();
            s.set_message("Understanding your request");
            s.enable_steady_tick(std::time::Duration::from_millis(120));
            Some(s)
        } else {
            None
        };

        let prompt = oracle::translation_prompt(utterance, context, observations);
        let translated = self
            .router
            .execute_chain(tier, |tier| {
                let prompt = prompt.clone();
                async move {
                    let stream = self.oracle.translate(&prompt, tier).await?;
                    let raw = oracle::collect_stream(stream, &self.cancel).await?;

                    let intent = Intent::parse(&raw)
                        .and_then(|i| i.validate(&self.registry).map(|_| i))
                        .map_err(|e| MaestroError::translation(e.to_string()))?;

                    self.router
                        .track_tokens(tier, oracle::estimate_tokens(&prompt) + oracle::estimate_tokens(&raw));
                    Ok(intent)
                }
            })
            .await;

        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        let (intent, used_tier) = translated?;

        if observations.is_empty() {
            let mut cache = self.cache.lock().await;
            cache.set(utterance, cache_context, intent.clone());
        }

        Ok((intent, used_tier, false))
    }

    /// Warnings, success-probability gate, and the mandatory high-risk
    /// confirmation.
    fn pre_execution_gate(&self, intent: &Intent, options: &ExecuteOptions) -> Result<()> {
        let analysis = self.failures.analyze_before_execution(intent)?;

        if analysis.has_warnings && !options.dry_run {
            output::print_warning("Learning from past experience:");
            for warning in &analysis.warnings {
                println!("  {}", warning);
            }
            for suggestion in &analysis.suggestions {
                println!("  hint: {}", suggestion);
            }

            if analysis.success_probability < 0.7 && !options.explain {
                output::print_warning(&format!(
                    "Success probability: {:.0}%",
                    analysis.success_probability * 100.0
                ));
                if !(self.confirm)("Proceed anyway?") {
                    return Err(MaestroError::user_abort("high failure risk"));
                }
            }
        }

        if intent.requires_confirmation && !options.dry_run {
            output::print_warning("High-risk operation detected");
            println!("{}", output::render_plan(intent));
            if !(self.confirm)("This operation is destructive. Proceed?") {
                return Err(MaestroError::user_abort("high-risk operation declined"));
            }
        } else if options.explain && !options.dry_run {
            println!("{}", output::render_plan(intent));
            if !(self.confirm)("Proceed?") {
                return Err(MaestroError::user_abort("declined after explanation"));
            }
        }

        Ok(())
    }

    /// Execute all steps, record actions, and render per-step results.
    /// Returns the observation strings on success.
    async fn run_intent(&self, intent: &Intent) -> Result<Vec<String>> {
        let outcomes = self
            .executor
            .execute(intent, self.planner.clone(), &self.cancel)
            .await?;

        let mut observations = Vec::new();
        let mut first_failure: Option<&MaestroError> = None;

        for (i, (step, outcome)) in intent.steps.iter().zip(outcomes.iter()).enumerate() {
            let value = outcome.as_value();
            output::print_step(i + 1, &step.tool, &step.action, step.risk, &value);

            if let StepOutcome::Success(result) = outcome {
                if let Err(e) = self.tracker.record(&step.tool, &step.action, &step.args, result) {
                    warn!(error = %e, "failed to record action");
                }
            }

            observations.push(format!(
                "{} → {}",
                step.signature(),
                output::render_result(&value)
            ));

            if first_failure.is_none() {
                first_failure = outcome.error();
            }
        }

        match first_failure {
            None => Ok(observations),
            Some(err) => Err(rebuild_error(err)),
        }
    }

    /// Post-failure analysis rendering: suggestions, recurrence, plan.
    fn report_failure(&self, utterance: &str, intent: &Intent, err: &MaestroError) {
        let tool = intent
            .steps
            .first()
            .map(|s| s.tool.clone())
            .unwrap_or_else(|| "orchestrator".to_string());

        output::print_error(&err.to_string());

        let analysis = self.failures.analyze_failure(
            utterance,
            &intent.goal,
            &tool,
            &err.to_string(),
            &Value::Null,
        );

        if let Ok(analysis) = analysis {
            if !analysis.suggestions.is_empty() {
                println!("Suggestions:");
                for (i, suggestion) in analysis.suggestions.iter().enumerate() {
                    println!("  {}. {}", i + 1, suggestion);
                }
            }
            if analysis.is_recurring {
                output::print_warning("This failure has occurred before");
            }
            if let Some(plan) = analysis.recovery_plan {
                println!("Recovery plan:\n{}", plan);
            }
        }

        if let Err(e) = self.history.record(utterance, intent, false) {
            warn!(error = %e, "failed to record history");
        }
    }

    /// Memory, metrics, and feedback updates after a command finishes.
    fn finish_command(
        &self,
        utterance: &str,
        intent: &Intent,
        tier: ModelTier,
        cache_hit: bool,
        started: Instant,
        success: bool,
    ) {
        if success {
            if let Err(e) = self.history.record(utterance, intent, true) {
                warn!(error = %e, "failed to record history");
            }
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let tool = intent
            .steps
            .first()
            .map(|s| s.tool.as_str())
            .unwrap_or("unknown");
        let session = self.router.session_stats();
        self.metrics.record_command(
            latency_ms,
            tier.as_str(),
            tool,
            session.tokens_used,
            session.estimated_cost,
            cache_hit,
            success,
        );

        if success && self.feedback.should_prompt(utterance) {
            let helpful = (self.confirm)("Was this helpful?");
            self.feedback.record(
                utterance,
                &intent.goal,
                tool,
                if helpful { "positive" } else { "negative" },
                latency_ms,
                success,
                None,
            );
        }
    }

    // --- iterative path ---

    async fn execute_iterative(
        &self,
        utterance: &str,
        options: &ExecuteOptions,
    ) -> Result<Outcome> {
        let batch_size = self.config.iterative.batch_size.max(1);
        let max_total = self.config.iterative.max_total;

        let snapshot = self.context_builder.build().await;
        let mut context = snapshot.to_prompt();
        let cache_context = snapshot.cache_context();

        let mut goal_tracker = GoalTracker::new();
        let mut all_observations: Vec<String> = Vec::new();
        let mut iteration: u32 = 0;
        let mut batch_number: u32 = 1;
        let mut last_txn: Option<String> = None;

        output::print_goal(&format!("Starting iterative execution: {}", utterance));
        output::print_dim(&format!("Batch size: {} iterations per batch", batch_size));

        loop {
            if iteration >= max_total {
                output::print_warning(&format!("Maximum iterations reached ({})", max_total));
                return Err(MaestroError::MaxIterations { limit: max_total });
            }

            // Batch boundary: every `batch_size` iterations ask before
            // continuing.
            if iteration > 0 && iteration % batch_size == 0 {
                batch_number += 1;
                output::print_dim(&format!(
                    "Batch {} complete ({}/{} total iterations used)",
                    batch_number - 1,
                    iteration,
                    max_total
                ));
                if !(self.confirm)(&format!("Continue with batch {}?", batch_number)) {
                    return Err(MaestroError::user_abort(format!(
                        "stopped after {} iteration(s), goal not achieved",
                        iteration
                    )));
                }
            }

            iteration += 1;
            self.cancel.check()?;
            println!(
                "\n=== Iteration {} (batch {}, {}/{}) ===",
                iteration,
                batch_number,
                (iteration - 1) % batch_size + 1,
                batch_size
            );

            let started = Instant::now();
            let (intent, tier, _) = self
                .translate(utterance, &context, &cache_context, &all_observations)
                .await?;
            output::print_goal(&intent.goal);

            if options.dry_run {
                return Ok(Outcome::DryRun {
                    plan: output::render_plan(&intent),
                });
            }

            self.pre_execution_gate(&intent, options)?;

            let txn_id = self.tracker.begin(utterance, &intent.goal)?;
            let run = self.run_intent(&intent).await;

            let iteration_observations = match run {
                Ok(observations) => {
                    self.tracker.end(&txn_id, TransactionStatus::Completed)?;
                    observations
                }
                Err(err) => {
                    self.tracker.end(&txn_id, TransactionStatus::Failed)?;
                    // A failed iteration feeds the loop rather than
                    // aborting it; the reflection sees the error text.
                    warn!(error = %err, iteration, "iteration failed");
                    self.report_failure(utterance, &intent, &err);
                    vec![format!("iteration failed: {}", err)]
                }
            };
            last_txn = Some(txn_id);

            all_observations.extend(iteration_observations.clone());
            self.finish_command(utterance, &intent, tier, false, started, true);

            // Reflection: has the goal been achieved?
            let status = self
                .reflect(utterance, &intent, &iteration_observations, &goal_tracker, tier)
                .await?;
            goal_tracker.record_iteration(&intent, iteration_observations.clone(), status.clone());

            if status.achieved {
                output::print_success(&format!(
                    "Goal achieved after {} iteration(s) across {} batch(es)",
                    iteration, batch_number
                ));
                output::print_dim(&status.reasoning);
                return Ok(Outcome::Completed {
                    message: format!("Task completed in {} iteration(s)", iteration),
                    transaction_id: last_txn,
                    iterations: iteration,
                });
            }

            output::print_dim(&format!(
                "Goal not yet achieved (confidence {:.0}%): {}",
                status.confidence * 100.0,
                status.reasoning
            ));
            for step in &status.next_steps {
                output::print_dim(&format!("  next: {}", step));
            }

            if goal_tracker.is_stuck() {
                output::print_warning(&format!(
                    "Appears to be stuck (same goal repeated {} times with low progress)",
                    goal_tracker.stuck_count()
                ));
                if !(self.confirm)("Continue trying?") {
                    return Err(MaestroError::user_abort(format!(
                        "stopped after {} iteration(s), appears stuck",
                        iteration
                    )));
                }
                goal_tracker.reset_stuck();
            }

            context = format!(
                "Previous attempt: {}. Observations: {}",
                intent.goal,
                iteration_observations
                    .iter()
                    .rev()
                    .take(3)
                    .rev()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    async fn reflect(
        &self,
        utterance: &str,
        intent: &Intent,
        observations: &[String],
        tracker: &GoalTracker,
        tier: ModelTier,
    ) -> Result<goal_tracker::GoalStatus> {
        let prompt = tracker.reflection_prompt(utterance, intent, observations);

        let stream = self.oracle.reflect(&prompt, tier).await?;
        let text = oracle::collect_stream(stream, &self.cancel).await?;
        self.router
            .track_tokens(tier, oracle::estimate_tokens(&prompt) + oracle::estimate_tokens(&text));

        goal_tracker::parse_reflection(&text)
    }

    // --- status ---

    /// One-view summary used by the `status` command.
    pub async fn status_report(&self) -> String {
        let cache = self.cache.lock().await;
        let cache_stats = cache.stats().clone();
        let session = self.router.session_stats();
        let metrics = self.metrics.stats();
        let failures = self.failures.failure_count().unwrap_or(0);
        let recent = self.tracker.recent_transactions(5).unwrap_or_default();

        let mut lines = vec![
            "Maestro status".to_string(),
            format!(
                "  cache: {} entries, {} hits / {} misses ({:.0}% hit rate), ~{} tokens (${:.4}) saved",
                cache.len(),
                cache_stats.hits,
                cache_stats.misses,
                cache_stats.hit_rate() * 100.0,
                cache_stats.tokens_saved,
                cache.estimated_cost_saved()
            ),
            format!(
                "  session: {} commands, {} tokens, ${:.4} estimated",
                session.commands, session.tokens_used, session.estimated_cost
            ),
            format!(
                "  metrics: {} commands, {:.0}ms avg latency, {} ok / {} failed",
                metrics.total_commands, metrics.avg_latency_ms, metrics.successes, metrics.failures
            ),
            format!("  failures recorded: {}", failures),
        ];

        if !recent.is_empty() {
            lines.push("  recent transactions:".to_string());
            for txn in recent {
                lines.push(format!(
                    "    {} [{}] {}",
                    txn.id, txn.status, txn.user_input
                ));
            }
        }

        lines.join("\n")
    }
}

/// Rebuild an owned error from a borrowed step outcome error, preserving
/// the kinds that drive exit codes.
fn rebuild_error(err: &MaestroError) -> MaestroError {
    match err {
        MaestroError::SandboxViolation { message } => MaestroError::sandbox(message.clone()),
        MaestroError::Timeout { operation, seconds } => MaestroError::Timeout {
            operation: operation.clone(),
            seconds: *seconds,
        },
        MaestroError::Tool {
            tool,
            operation,
            message,
        } => MaestroError::tool(tool.clone(), operation.clone(), message.clone()),
        MaestroError::UnknownTool { tool, operation } => MaestroError::UnknownTool {
            tool: tool.clone(),
            operation: operation.clone(),
        },
        other => MaestroError::internal("executor", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedOracle;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> MaestroConfig {
        let mut config = MaestroConfig::default();
        config.state_root = dir.path().join("state");
        config.sandbox.allowed_paths = vec![dir.path().to_path_buf()];
        config.feedback.prompts_enabled = false;
        config
    }

    fn scan_intent_json(path: &std::path::Path) -> String {
        format!(
            r#"{{"goal": "list notes", "steps": [
                {{"tool": "FileOps", "action": "scan", "args": {{"path": "{}"}}, "risk": 0}}
            ]}}"#,
            path.display()
        )
    }

    #[tokio::test]
    async fn test_oneshot_scan_completes_transaction() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();
        std::fs::write(notes.join("a.md"), "a").unwrap();
        std::fs::write(notes.join("b.md"), "b").unwrap();

        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_translation(scan_intent_json(&notes)).await;

        let orchestrator = Orchestrator::new(test_config(&dir), oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| true));

        let outcome = orchestrator
            .execute("list files in notes", ExecuteOptions::default())
            .await
            .unwrap();

        let Outcome::Completed { transaction_id, .. } = outcome else {
            panic!("expected completion");
        };
        let txn = transaction_id.unwrap();

        let actions = orchestrator.tracker().list_transaction(&txn).unwrap();
        assert_eq!(actions.len(), 1);
        let entries = actions[0].result.get("entries").unwrap().as_array().unwrap();
        assert_eq!(entries.len(), 2);

        let recent = orchestrator.tracker().recent_transactions(1).unwrap();
        assert_eq!(recent[0].status, "completed");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_oracle() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();

        let oracle = Arc::new(ScriptedOracle::new());
        // Only ONE translation is queued; the second run must hit cache.
        oracle.push_translation(scan_intent_json(&notes)).await;

        let orchestrator = Orchestrator::new(test_config(&dir), oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| true));

        orchestrator
            .execute("list files in notes", ExecuteOptions::default())
            .await
            .unwrap();
        orchestrator
            .execute("list files in notes", ExecuteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_renders_plan_without_executing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("new.txt");

        let oracle = Arc::new(ScriptedOracle::new());
        oracle
            .push_translation(format!(
                r#"{{"goal": "create a file", "steps": [
                    {{"tool": "FileOps", "action": "create_file", "args": {{"path": "{}"}}, "risk": 1}}
                ]}}"#,
                target.display()
            ))
            .await;

        let orchestrator = Orchestrator::new(test_config(&dir), oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| true));

        let outcome = orchestrator
            .execute(
                "create new.txt",
                ExecuteOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::DryRun { .. }));
        assert!(!target.exists());
        assert!(orchestrator.tracker().recent_transactions(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_high_risk_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let victim = dir.path().join("precious.txt");
        std::fs::write(&victim, "data").unwrap();

        let oracle = Arc::new(ScriptedOracle::new());
        oracle
            .push_translation(format!(
                r#"{{"goal": "delete the file", "steps": [
                    {{"tool": "FileOps", "action": "delete_file", "args": {{"path": "{}"}}, "risk": 3}}
                ]}}"#,
                victim.display()
            ))
            .await;

        let orchestrator = Orchestrator::new(test_config(&dir), oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| false));

        let err = orchestrator
            .execute("delete precious.txt", ExecuteOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, MaestroError::UserAbort { .. }));
        assert_eq!(err.exit_code(), 4);
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn test_invalid_translation_surfaces_as_translation_error() {
        let dir = TempDir::new().unwrap();
        let oracle = Arc::new(ScriptedOracle::new());
        // Exhaust the whole fallback chain with garbage.
        for _ in 0..3 {
            oracle.push_translation("no json here at all").await;
        }

        let orchestrator = Orchestrator::new(test_config(&dir), oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| true));

        let err = orchestrator
            .execute("list files", ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_iterative_achieves_goal() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();

        let oracle = Arc::new(ScriptedOracle::new());
        // Two iterations: one not-achieved reflection, then success.
        oracle.push_translation(scan_intent_json(&notes)).await;
        oracle
            .push_reflection("ACHIEVED: no\nCONFIDENCE: 0.6\nREASONING: need more\nNEXT_STEPS: rescan")
            .await;
        oracle.push_translation(scan_intent_json(&notes)).await;
        oracle
            .push_reflection("ACHIEVED: yes\nCONFIDENCE: 0.9\nREASONING: done\nNEXT_STEPS:")
            .await;

        let orchestrator = Orchestrator::new(test_config(&dir), oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| true));

        let outcome = orchestrator
            .execute(
                "analyze the notes directory and improve its structure based on the contents",
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let Outcome::Completed { iterations, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(iterations, 2);
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();

        let mut config = test_config(&dir);
        config.iterative.max_total = 2;
        config.iterative.batch_size = 5;

        let oracle = Arc::new(ScriptedOracle::new());
        for _ in 0..3 {
            oracle.push_translation(scan_intent_json(&notes)).await;
            oracle
                .push_reflection("ACHIEVED: no\nCONFIDENCE: 0.6\nREASONING: not yet\nNEXT_STEPS: retry")
                .await;
        }

        let orchestrator = Orchestrator::new(config, oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|_| true));

        let err = orchestrator
            .execute(
                "analyze everything and improve it based on what you find out",
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MaestroError::MaxIterations { limit: 2 }));
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_batch_prompt_declined_aborts() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes");
        std::fs::create_dir_all(&notes).unwrap();

        let mut config = test_config(&dir);
        config.iterative.batch_size = 1;
        config.iterative.max_total = 10;

        let oracle = Arc::new(ScriptedOracle::new());
        oracle.push_translation(scan_intent_json(&notes)).await;
        oracle
            .push_reflection("ACHIEVED: no\nCONFIDENCE: 0.6\nREASONING: not yet\nNEXT_STEPS: retry")
            .await;

        let orchestrator = Orchestrator::new(config, oracle)
            .unwrap()
            .with_confirm_handler(Box::new(|prompt: &str| !prompt.contains("Continue with batch")));

        let err = orchestrator
            .execute(
                "analyze everything and improve it based on what you find out",
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MaestroError::UserAbort { .. }));
    }
}
