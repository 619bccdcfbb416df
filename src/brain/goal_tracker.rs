//! Goal tracking for the iterative loop
//!
//! After each iteration the oracle reflects on whether the user's goal is
//! achieved. The tracker records every iteration and owns the stuck
//! detector: repeating the same iteration goal with low confidence three
//! times in a row means the loop is spinning and the user should be asked.

use serde::{Deserialize, Serialize};

use crate::core::error::{MaestroError, Result};
use crate::intent::Intent;

const STUCK_CONFIDENCE: f64 = 0.4;
const STUCK_THRESHOLD: u32 = 3;

/// Oracle verdict on goal achievement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalStatus {
    pub achieved: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub next_steps: Vec<String>,
}

/// One completed iteration
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub intent_goal: String,
    pub observations: Vec<String>,
    pub status: GoalStatus,
}

/// Tracks iterations and detects stuck loops
pub struct GoalTracker {
    iterations: Vec<IterationRecord>,
    stuck_count: u32,
    last_goal: Option<String>,
}

impl GoalTracker {
    pub fn new() -> Self {
        Self {
            iterations: Vec::new(),
            stuck_count: 0,
            last_goal: None,
        }
    }

    /// Prompt for the oracle's reflection call.
    pub fn reflection_prompt(
        &self,
        user_goal: &str,
        intent: &Intent,
        observations: &[String],
    ) -> String {
        let mut prompt = format!(
            "Evaluate whether the user's goal has been achieved.\n\n\
             User goal: {}\n\
             Current plan goal: {}\n\n\
             Observations from this iteration:\n",
            user_goal, intent.goal
        );
        for obs in observations {
            prompt.push_str(&format!("- {}\n", obs));
        }

        if !self.iterations.is_empty() {
            prompt.push_str("\nEarlier iterations:\n");
            for record in self.iterations.iter().rev().take(5).rev() {
                prompt.push_str(&format!(
                    "- {} (achieved: {}, confidence: {:.2})\n",
                    record.intent_goal, record.status.achieved, record.status.confidence
                ));
            }
        }

        prompt.push_str(
            "\nRespond with exactly these lines:\n\
             ACHIEVED: yes|no\n\
             CONFIDENCE: 0.0-1.0\n\
             REASONING: one sentence\n\
             NEXT_STEPS: comma-separated suggestions (empty if achieved)",
        );
        prompt
    }

    /// Record an iteration and update the stuck detector.
    ///
    /// The counter increments exactly when this iteration repeats the
    /// previous iteration's goal with confidence below 0.4; anything else
    /// resets it.
    pub fn record_iteration(
        &mut self,
        intent: &Intent,
        observations: Vec<String>,
        status: GoalStatus,
    ) {
        let repeated = self.last_goal.as_deref() == Some(intent.goal.as_str());
        if !status.achieved && repeated && status.confidence < STUCK_CONFIDENCE {
            self.stuck_count += 1;
        } else {
            self.stuck_count = 0;
        }
        self.last_goal = Some(intent.goal.clone());

        self.iterations.push(IterationRecord {
            intent_goal: intent.goal.clone(),
            observations,
            status,
        });
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck_count >= STUCK_THRESHOLD
    }

    pub fn stuck_count(&self) -> u32 {
        self.stuck_count
    }

    /// Called after the user confirms they want to keep going.
    pub fn reset_stuck(&mut self) {
        self.stuck_count = 0;
    }

    pub fn iterations(&self) -> &[IterationRecord] {
        &self.iterations
    }
}

impl Default for GoalTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the oracle's reflection output into a [`GoalStatus`].
pub fn parse_reflection(text: &str) -> Result<GoalStatus> {
    let mut achieved = None;
    let mut confidence = None;
    let mut reasoning = String::new();
    let mut next_steps = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ACHIEVED:") {
            achieved = Some(rest.trim().eq_ignore_ascii_case("yes"));
        } else if let Some(rest) = line.strip_prefix("CONFIDENCE:") {
            confidence = rest.trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("REASONING:") {
            reasoning = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("NEXT_STEPS:") {
            next_steps = rest
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s != "none")
                .collect();
        }
    }

    let achieved = achieved.ok_or_else(|| {
        MaestroError::Reflection {
            message: "reflection output has no ACHIEVED line".to_string(),
        }
    })?;

    Ok(GoalStatus {
        achieved,
        confidence: confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        reasoning,
        next_steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(goal: &str) -> Intent {
        Intent::parse(&format!(
            r#"{{"goal": "{}", "steps": [
                {{"tool": "FileOps", "action": "scan", "args": {{"path": "/tmp"}}, "risk": 0}}
            ]}}"#,
            goal
        ))
        .unwrap()
    }

    fn status(achieved: bool, confidence: f64) -> GoalStatus {
        GoalStatus {
            achieved,
            confidence,
            reasoning: "r".to_string(),
            next_steps: vec![],
        }
    }

    #[test]
    fn test_parse_reflection() {
        let parsed = parse_reflection(
            "ACHIEVED: no\nCONFIDENCE: 0.3\nREASONING: still missing tests\nNEXT_STEPS: add tests, run them",
        )
        .unwrap();
        assert!(!parsed.achieved);
        assert!((parsed.confidence - 0.3).abs() < 1e-9);
        assert_eq!(parsed.next_steps, vec!["add tests", "run them"]);
    }

    #[test]
    fn test_parse_requires_achieved_line() {
        assert!(parse_reflection("CONFIDENCE: 0.9").is_err());
    }

    #[test]
    fn test_stuck_requires_same_goal_and_low_confidence() {
        let mut tracker = GoalTracker::new();

        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.3));
        assert_eq!(tracker.stuck_count(), 0); // First sighting of the goal.

        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.3));
        assert_eq!(tracker.stuck_count(), 1);

        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.2));
        assert_eq!(tracker.stuck_count(), 2);
        assert!(!tracker.is_stuck());

        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.1));
        assert!(tracker.is_stuck());
    }

    #[test]
    fn test_goal_change_resets_counter() {
        let mut tracker = GoalTracker::new();
        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.3));
        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.3));
        assert_eq!(tracker.stuck_count(), 1);

        tracker.record_iteration(&intent("write docs"), vec![], status(false, 0.3));
        assert_eq!(tracker.stuck_count(), 0);
    }

    #[test]
    fn test_high_confidence_resets_counter() {
        let mut tracker = GoalTracker::new();
        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.3));
        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.3));
        tracker.record_iteration(&intent("fix tests"), vec![], status(false, 0.8));
        assert_eq!(tracker.stuck_count(), 0);
    }

    #[test]
    fn test_prompt_includes_recent_history() {
        let mut tracker = GoalTracker::new();
        for i in 0..8 {
            tracker.record_iteration(&intent(&format!("goal {}", i)), vec![], status(false, 0.5));
        }

        let prompt = tracker.reflection_prompt("finish it", &intent("goal 8"), &[]);
        assert!(prompt.contains("goal 7"));
        assert!(prompt.contains("goal 3"));
        assert!(!prompt.contains("goal 2"));
    }
}
