//! Task complexity analysis
//!
//! Decides whether an utterance needs iterative (plan-act-observe)
//! execution or a single shot. A keyword and structure heuristic scores
//! the utterance; when the heuristic is unsure and an oracle is available
//! the oracle's judgment wins.

use serde::{Deserialize, Serialize};

/// Classification of one utterance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComplexity {
    pub needs_iteration: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub estimated_steps: u32,
}

/// Keywords suggesting multi-cycle work
const ITERATIVE_KEYWORDS: &[&str] = &[
    // Analysis
    "analyze", "understand", "examine", "study", "investigate", "explore", "review", "assess",
    "evaluate", "inspect",
    // Multi-step connectives
    "then", "after", "next", "followed by", "and then", "subsequently", "afterwards",
    // Improvement
    "improve", "enhance", "optimize", "refactor", "fix", "update", "modify", "change", "adjust",
    "revise",
    // Context-dependent
    "based on", "depending on", "according to", "that match",
    // Discovery
    "find out", "discover", "determine", "figure out", "identify", "detect", "locate",
    // Complex organization
    "organize by", "sort by", "group by", "categorize", "classify", "arrange by",
];

/// Keywords suggesting simple one-shot tasks
const ONESHOT_KEYWORDS: &[&str] = &[
    "list", "show", "display", "print", "create empty", "make folder", "touch", "what is",
    "how much", "status of", "info about", "details of",
];

const CONDITION_WORDS: &[&str] = &["if", "where", "that", "which"];
const FILE_WORDS: &[&str] = &["file", "folder", "directory"];

/// Heuristic analyzer; threshold and weights tuned for short shell-style
/// utterances.
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, user_input: &str) -> TaskComplexity {
        let text = user_input.to_lowercase();

        let iterative_hits = ITERATIVE_KEYWORDS
            .iter()
            .filter(|kw| text.contains(*kw))
            .count() as i32;
        let oneshot_hits = ONESHOT_KEYWORDS
            .iter()
            .filter(|kw| text.contains(*kw))
            .count() as i32;

        let sentence_count = text
            .split(['.', '!', '?', ';'])
            .filter(|s| !s.trim().is_empty())
            .count() as i32;
        let clause_count = (text.matches(',').count() + text.matches(" and ").count()) as i32;

        let words: Vec<&str> = text.split_whitespace().collect();
        let has_conditions = CONDITION_WORDS.iter().any(|w| words.contains(w));
        let has_file_ops = FILE_WORDS.iter().any(|w| text.contains(w));

        let mut score = 0i32;
        score += iterative_hits * 3;
        score -= oneshot_hits * 3;
        if sentence_count > 1 {
            score += sentence_count;
        }
        if clause_count > 2 {
            score += 2;
        }
        if has_conditions && has_file_ops {
            score += 3;
        }
        let word_count = words.len();
        if word_count > 15 {
            score += 2;
        } else if word_count > 10 {
            score += 1;
        }

        let needs_iteration = score >= 2;

        let confidence = if score >= 5 {
            0.9
        } else if score >= 2 {
            0.75
        } else if score <= -2 {
            0.85
        } else {
            0.6
        };

        let estimated_steps = (score + 1).clamp(1, 10) as u32;

        let reasoning = if needs_iteration {
            format!(
                "Complex task: {} iterative keywords, {} sentence(s), score {}",
                iterative_hits, sentence_count, score
            )
        } else {
            format!(
                "Simple task: {} one-shot keywords, score {}",
                oneshot_hits, score
            )
        };

        TaskComplexity {
            needs_iteration,
            confidence,
            reasoning,
            estimated_steps,
        }
    }

    /// Whether the heuristic verdict is confident enough to skip asking
    /// the oracle.
    pub fn is_confident(&self, complexity: &TaskComplexity) -> bool {
        complexity.confidence >= 0.8
    }
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an oracle override of the heuristic verdict. The oracle answers
/// with `NEEDS_ITERATION`, `CONFIDENCE`, `ESTIMATED_STEPS`, and
/// `REASONING` lines; anything unparseable leaves the heuristic in force.
pub fn parse_oracle_verdict(text: &str) -> Option<TaskComplexity> {
    let mut needs_iteration = None;
    let mut confidence = None;
    let mut estimated_steps = None;
    let mut reasoning = String::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("NEEDS_ITERATION:") {
            needs_iteration = Some(rest.trim().eq_ignore_ascii_case("yes"));
        } else if let Some(rest) = line.strip_prefix("CONFIDENCE:") {
            confidence = rest.trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("ESTIMATED_STEPS:") {
            estimated_steps = rest.trim().parse::<u32>().ok();
        } else if let Some(rest) = line.strip_prefix("REASONING:") {
            reasoning = rest.trim().to_string();
        }
    }

    Some(TaskComplexity {
        needs_iteration: needs_iteration?,
        confidence: confidence.unwrap_or(0.8).clamp(0.0, 1.0),
        reasoning: if reasoning.is_empty() {
            "oracle classification".to_string()
        } else {
            reasoning
        },
        estimated_steps: estimated_steps.unwrap_or(3).clamp(1, 10),
    })
}

/// Prompt asking the oracle to classify a task (used when the heuristic
/// is unsure).
pub fn classification_prompt(user_input: &str) -> String {
    format!(
        "Classify this command for execution mode:\n\n\
         Command: \"{}\"\n\n\
         ITERATIVE tasks require exploration, depend on intermediate results, \
         or have conditional logic. ONE-SHOT tasks are single well-defined actions.\n\n\
         Respond with exactly these lines:\n\
         NEEDS_ITERATION: yes|no\n\
         CONFIDENCE: 0.0-1.0\n\
         ESTIMATED_STEPS: 1-10\n\
         REASONING: brief explanation",
        user_input
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_listing_is_oneshot() {
        let analyzer = ComplexityAnalyzer::new();
        let result = analyzer.analyze("list files in ~/notes");
        assert!(!result.needs_iteration);
        assert!(result.confidence >= 0.85);
        assert_eq!(result.estimated_steps, 1);
    }

    #[test]
    fn test_analysis_task_is_iterative() {
        let analyzer = ComplexityAnalyzer::new();
        let result =
            analyzer.analyze("analyze this project and improve the README based on the code");
        assert!(result.needs_iteration);
        assert!(result.confidence >= 0.9);
        assert!(result.estimated_steps >= 5);
    }

    #[test]
    fn test_conditional_file_ops_add_weight() {
        let analyzer = ComplexityAnalyzer::new();
        let plain = analyzer.analyze("move the pictures");
        let conditional = analyzer.analyze("move the files that are older into the archive folder");
        assert!(conditional.estimated_steps > plain.estimated_steps);
        assert!(conditional.needs_iteration);
    }

    #[test]
    fn test_threshold_at_two() {
        let analyzer = ComplexityAnalyzer::new();
        // One iterative keyword alone crosses the threshold (3 >= 2).
        let result = analyzer.analyze("refactor the parser");
        assert!(result.needs_iteration);
    }

    #[test]
    fn test_steps_clamped() {
        let analyzer = ComplexityAnalyzer::new();
        let result = analyzer.analyze(
            "analyze and understand and review and improve and optimize and refactor \
             everything, then fix it, then update the docs based on what you find out",
        );
        assert!(result.estimated_steps <= 10);
    }

    #[test]
    fn test_oracle_verdict_parsing() {
        let verdict = parse_oracle_verdict(
            "NEEDS_ITERATION: yes\nCONFIDENCE: 0.95\nESTIMATED_STEPS: 6\nREASONING: exploration needed",
        )
        .unwrap();
        assert!(verdict.needs_iteration);
        assert!((verdict.confidence - 0.95).abs() < 1e-9);
        assert_eq!(verdict.estimated_steps, 6);
    }

    #[test]
    fn test_oracle_verdict_requires_decision_line() {
        assert!(parse_oracle_verdict("CONFIDENCE: 0.9").is_none());
    }
}
