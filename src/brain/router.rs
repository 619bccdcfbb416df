//! Model routing
//!
//! Picks an LLM tier by estimated complexity and falls back up the
//! capability ladder on failure. Tiers are statically ordered: local
//! (0.5) < cheap (0.7) < mid (0.85) < top (1.0); the router selects the
//! lowest-capability tier whose capability covers the score, so cheap
//! requests never burn expensive models.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::core::error::{MaestroError, Result};

/// Capability band of LLM backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Local,
    Cheap,
    Mid,
    Top,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [Self::Local, Self::Cheap, Self::Mid, Self::Top];

    pub fn capability(&self) -> f64 {
        match self {
            Self::Local => 0.5,
            Self::Cheap => 0.7,
            Self::Mid => 0.85,
            Self::Top => 1.0,
        }
    }

    /// Rough dollars per million tokens, for cost estimates
    pub fn cost_per_million(&self) -> f64 {
        match self {
            Self::Local => 0.0,
            Self::Cheap => 0.15,
            Self::Mid => 1.0,
            Self::Top => 3.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cheap => "cheap",
            Self::Mid => "mid",
            Self::Top => "top",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "cheap" => Some(Self::Cheap),
            "mid" => Some(Self::Mid),
            "top" => Some(Self::Top),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized complexity in [0, 1] with the reasons that produced it
#[derive(Debug, Clone)]
pub struct ComplexityScore {
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Record of one routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDecision {
    pub timestamp: String,
    pub user_input: String,
    pub complexity_score: f64,
    pub selected_model: String,
    pub reasons: Vec<String>,
    pub fallback_used: bool,
    pub success: bool,
    pub tokens_used: u64,
    pub latency_ms: f64,
}

/// Per-tier counters, persisted across sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub commands: u64,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    pub cache_hits: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedStats {
    models: HashMap<String, TierStats>,
}

struct RouterState {
    stats: PersistedStats,
    session: SessionStats,
    decisions: Vec<RouterDecision>,
    last_successful: Option<ModelTier>,
}

/// Complexity-based tier selection with a capability-graded fallback chain
pub struct ModelRouter {
    state: Mutex<RouterState>,
    stats_path: PathBuf,
    force_model: Option<ModelTier>,
    enable_fallback: bool,
    max_fallbacks: usize,
}

impl ModelRouter {
    pub fn new(
        state_root: &std::path::Path,
        force_model: Option<ModelTier>,
        enable_fallback: bool,
        max_fallbacks: usize,
    ) -> Self {
        let stats_path = state_root.join("router_stats.json");
        let stats = std::fs::read_to_string(&stats_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Self {
            state: Mutex::new(RouterState {
                stats,
                session: SessionStats::default(),
                decisions: Vec::new(),
                last_successful: None,
            }),
            stats_path,
            force_model,
            enable_fallback,
            max_fallbacks,
        }
    }

    /// Score an utterance into [0, 1].
    pub fn score(&self, user_input: &str, iterative: bool) -> ComplexityScore {
        let text = user_input.to_lowercase();
        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        let word_count = text.split_whitespace().count();
        if word_count > 50 {
            score += 0.3;
            reasons.push(format!("long request ({} words)", word_count));
        }

        let multi_req = ["and", "also", "additionally", "furthermore", "plus"]
            .iter()
            .filter(|w| text.contains(*w))
            .count();
        if multi_req > 0 {
            score += multi_req as f64 * 0.1;
            reasons.push(format!("{} compound requirement(s)", multi_req));
        }

        let conditionals = ["if", "when", "unless", "while", "until", "after", "before"]
            .iter()
            .filter(|w| text.split_whitespace().any(|t| t == **w))
            .count();
        if conditionals > 0 {
            score += conditionals as f64 * 0.15;
            reasons.push(format!("{} conditional(s)", conditionals));
        }

        if ["analyze", "debug", "investigate", "review", "audit", "assess"]
            .iter()
            .any(|w| text.contains(w))
        {
            score += 0.4;
            reasons.push("analysis request".to_string());
        }

        if ["architecture", "design", "structure", "pattern", "framework"]
            .iter()
            .any(|w| text.contains(w))
        {
            score += 0.3;
            reasons.push("design request".to_string());
        }

        if iterative {
            score += 0.3;
            reasons.push("iterative execution".to_string());
        }

        if reasons.is_empty() {
            reasons.push("simple request".to_string());
        }

        ComplexityScore {
            score: score.min(1.0),
            reasons,
        }
    }

    /// Select the tier for an utterance: lowest capability covering the
    /// score, unless an operator override forces a tier.
    pub fn route(&self, user_input: &str, iterative: bool) -> (ModelTier, ComplexityScore) {
        let mut complexity = self.score(user_input, iterative);

        let tier = match self.force_model {
            Some(forced) => {
                complexity.reasons.push(format!("forced model: {}", forced));
                forced
            }
            None => select_tier(complexity.score),
        };

        let mut state = self.state.lock().expect("router state poisoned");
        state.session.commands += 1;
        state.decisions.push(RouterDecision {
            timestamp: Utc::now().to_rfc3339(),
            user_input: user_input.chars().take(100).collect(),
            complexity_score: complexity.score,
            selected_model: tier.to_string(),
            reasons: complexity.reasons.clone(),
            fallback_used: false,
            success: true,
            tokens_used: 0,
            latency_ms: 0.0,
        });

        debug!(tier = %tier, score = complexity.score, "routed request");
        (tier, complexity)
    }

    /// Chain of tiers to try, primary first, then strictly more capable
    /// tiers up to `max_fallbacks` extra entries.
    pub fn fallback_chain(&self, primary: ModelTier) -> Vec<ModelTier> {
        if !self.enable_fallback {
            return vec![primary];
        }

        let mut chain = vec![primary];
        for tier in ModelTier::ALL {
            if tier.capability() > primary.capability() {
                chain.push(tier);
            }
            if chain.len() > self.max_fallbacks {
                break;
            }
        }
        chain
    }

    /// Route, then attempt `operation` once per chain entry until one
    /// succeeds. The last failure propagates when the chain exhausts.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        user_input: &str,
        iterative: bool,
        operation: F,
    ) -> Result<(T, ModelTier)>
    where
        F: Fn(ModelTier) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (primary, _) = self.route(user_input, iterative);
        self.execute_chain(primary, operation).await
    }

    /// Attempt `operation` on an already-routed primary tier, climbing the
    /// fallback chain on failure.
    pub async fn execute_chain<T, F, Fut>(
        &self,
        primary: ModelTier,
        operation: F,
    ) -> Result<(T, ModelTier)>
    where
        F: Fn(ModelTier) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let chain = self.fallback_chain(primary);

        let mut last_error = None;
        for (attempt, tier) in chain.iter().enumerate() {
            let started = Instant::now();
            match operation(*tier).await {
                Ok(value) => {
                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                    self.record_outcome(*tier, true, latency, attempt > 0);
                    return Ok((value, *tier));
                }
                Err(err) => {
                    warn!(tier = %tier, error = %err, "tier failed, falling back");
                    self.record_outcome(*tier, false, 0.0, attempt > 0);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MaestroError::translation("no model tiers available")
        }))
    }

    fn record_outcome(&self, tier: ModelTier, success: bool, latency_ms: f64, fallback: bool) {
        let mut state = self.state.lock().expect("router state poisoned");

        let entry = state.stats.models.entry(tier.to_string()).or_default();
        entry.requests += 1;
        if success {
            entry.successes += 1;
            let n = entry.successes as f64;
            entry.avg_latency_ms = (entry.avg_latency_ms * (n - 1.0) + latency_ms) / n;
        } else {
            entry.failures += 1;
        }

        if success {
            state.last_successful = Some(tier);
        }
        if let Some(decision) = state.decisions.last_mut() {
            decision.success = success;
            decision.fallback_used = fallback;
            if success {
                decision.latency_ms = latency_ms;
                decision.selected_model = tier.to_string();
            }
        }

        persist(&self.stats_path, &state.stats);
    }

    pub fn track_tokens(&self, tier: ModelTier, tokens: u64) {
        let mut state = self.state.lock().expect("router state poisoned");
        state.session.tokens_used += tokens;
        let cost = (tokens as f64 / 1_000_000.0) * tier.cost_per_million();
        state.session.estimated_cost += cost;

        let entry = state.stats.models.entry(tier.to_string()).or_default();
        entry.total_tokens += tokens;
        entry.total_cost += cost;

        if let Some(decision) = state.decisions.last_mut() {
            decision.tokens_used += tokens;
        }

        persist(&self.stats_path, &state.stats);
    }

    pub fn track_cache_hit(&self) {
        let mut state = self.state.lock().expect("router state poisoned");
        state.session.cache_hits += 1;
    }

    pub fn tier_stats(&self, tier: ModelTier) -> TierStats {
        let state = self.state.lock().expect("router state poisoned");
        state
            .stats
            .models
            .get(tier.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.state
            .lock()
            .expect("router state poisoned")
            .session
            .clone()
    }

    pub fn last_successful(&self) -> Option<ModelTier> {
        self.state
            .lock()
            .expect("router state poisoned")
            .last_successful
    }

    pub fn last_decision(&self) -> Option<RouterDecision> {
        self.state
            .lock()
            .expect("router state poisoned")
            .decisions
            .last()
            .cloned()
    }
}

/// Lowest-capability tier whose capability covers the score.
fn select_tier(score: f64) -> ModelTier {
    for tier in ModelTier::ALL {
        if tier.capability() >= score {
            return tier;
        }
    }
    ModelTier::Top
}

fn persist(path: &PathBuf, stats: &PersistedStats) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(json) = serde_json::to_string_pretty(stats) {
        let _ = std::fs::write(path, json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn router(dir: &TempDir) -> ModelRouter {
        ModelRouter::new(dir.path(), None, true, 2)
    }

    #[test]
    fn test_simple_request_routes_local() {
        let dir = TempDir::new().unwrap();
        let (tier, complexity) = router(&dir).route("list files in ~/notes", false);
        assert_eq!(tier, ModelTier::Local);
        assert!(complexity.score <= 0.5);
    }

    #[test]
    fn test_selection_is_monotone() {
        let scores = [0.0, 0.2, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 1.0];
        let mut last_capability = 0.0;
        for score in scores {
            let capability = select_tier(score).capability();
            assert!(capability >= last_capability);
            assert!(capability >= score);
            last_capability = capability;
        }
    }

    #[test]
    fn test_force_model_honored() {
        let dir = TempDir::new().unwrap();
        let forced = ModelRouter::new(dir.path(), Some(ModelTier::Top), true, 2);
        let (tier, _) = forced.route("list files", false);
        assert_eq!(tier, ModelTier::Top);
    }

    #[test]
    fn test_fallback_chain_ascends() {
        let dir = TempDir::new().unwrap();
        let chain = router(&dir).fallback_chain(ModelTier::Local);
        assert_eq!(chain, vec![ModelTier::Local, ModelTier::Cheap, ModelTier::Mid]);

        let chain = router(&dir).fallback_chain(ModelTier::Top);
        assert_eq!(chain, vec![ModelTier::Top]);
    }

    #[tokio::test]
    async fn test_fallback_on_failure() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);

        let (value, tier) = router
            .execute_with_fallback("list files", false, |tier| async move {
                if tier == ModelTier::Local {
                    Err(MaestroError::translation("local backend down"))
                } else {
                    Ok(format!("answered by {}", tier))
                }
            })
            .await
            .unwrap();

        assert_eq!(tier, ModelTier::Cheap);
        assert_eq!(value, "answered by cheap");
        assert_eq!(router.last_successful(), Some(ModelTier::Cheap));

        let decision = router.last_decision().unwrap();
        assert!(decision.fallback_used);
        assert!(decision.success);

        assert_eq!(router.tier_stats(ModelTier::Local).failures, 1);
        assert_eq!(router.tier_stats(ModelTier::Cheap).successes, 1);
    }

    #[tokio::test]
    async fn test_all_tiers_exhausted_propagates_last_error() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);

        let result: Result<((), ModelTier)> = router
            .execute_with_fallback("list files", false, |_tier| async move {
                Err::<(), _>(MaestroError::translation("everything is down"))
            })
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_token_tracking_accumulates_cost() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        router.track_tokens(ModelTier::Top, 1_000_000);

        let session = router.session_stats();
        assert_eq!(session.tokens_used, 1_000_000);
        assert!((session.estimated_cost - 3.0).abs() < 1e-9);
        assert_eq!(router.tier_stats(ModelTier::Top).total_tokens, 1_000_000);
    }

    #[test]
    fn test_stats_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let router = router(&dir);
            router.track_tokens(ModelTier::Cheap, 500);
        }
        let reloaded = router(&dir);
        assert_eq!(reloaded.tier_stats(ModelTier::Cheap).total_tokens, 500);
    }
}
