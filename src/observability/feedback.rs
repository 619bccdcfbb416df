//! Feedback collection
//!
//! Samples a fraction of commands for a quick helpful/not-helpful rating,
//! deduplicated per normalized utterance (both within the session and
//! against prior stored feedback). Entries are length-bounded and
//! personally identifying tokens are redacted before hitting disk.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One stored rating
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub timestamp: String,
    pub user_input: String,
    pub intent_goal: String,
    pub tool_used: String,
    /// "positive", "negative", or "skip"
    pub feedback: String,
    pub execution_time_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Sampled, deduplicating feedback sink
pub struct FeedbackCollector {
    path: PathBuf,
    sample_rate: f64,
    prompts_enabled: bool,
    asked_this_session: Mutex<HashSet<String>>,
}

impl FeedbackCollector {
    pub fn new(state_root: &Path, sample_rate: f64, prompts_enabled: bool) -> Self {
        Self {
            path: state_root.join("feedback.jsonl"),
            sample_rate,
            prompts_enabled,
            asked_this_session: Mutex::new(HashSet::new()),
        }
    }

    /// Decide whether to prompt for this command. Marks the utterance as
    /// asked when the decision is yes.
    pub fn should_prompt(&self, user_input: &str) -> bool {
        if !self.prompts_enabled {
            return false;
        }

        let normalized = user_input.trim().to_lowercase();
        {
            let asked = self.asked_this_session.lock().expect("feedback set poisoned");
            if asked.contains(&normalized) {
                return false;
            }
        }
        if self.has_prior_feedback(&normalized) {
            return false;
        }
        if rand::thread_rng().gen::<f64>() > self.sample_rate {
            return false;
        }

        self.asked_this_session
            .lock()
            .expect("feedback set poisoned")
            .insert(normalized);
        true
    }

    /// Store a rating. Input and goal are redacted and truncated.
    pub fn record(
        &self,
        user_input: &str,
        intent_goal: &str,
        tool_used: &str,
        feedback: &str,
        execution_time_ms: f64,
        success: bool,
        comment: Option<String>,
    ) {
        let entry = FeedbackEntry {
            timestamp: Utc::now().to_rfc3339(),
            user_input: redact(&truncate(user_input, 200)),
            intent_goal: redact(&truncate(intent_goal, 200)),
            tool_used: tool_used.to_string(),
            feedback: feedback.to_string(),
            execution_time_ms,
            success,
            comment: comment.map(|c| redact(&truncate(&c, 500))),
        };

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
            }
        }
    }

    pub fn entries(&self) -> Vec<FeedbackEntry> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn has_prior_feedback(&self, normalized: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.user_input.trim().to_lowercase() == *normalized)
    }
}

/// Strip emails and password-like assignments.
fn redact(text: &str) -> String {
    static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"[\w.+-]+@[\w-]+\.[\w.]+").expect("static regex")
    });
    static SECRET_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(password|passwd|token|secret|api[_-]?key)\s*[=:]\s*\S+")
            .expect("static regex")
    });

    let redacted = EMAIL_RE.replace_all(text, "<email>");
    SECRET_RE.replace_all(&redacted, "$1=<redacted>").to_string()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disabled_prompts_never_ask() {
        let dir = TempDir::new().unwrap();
        let collector = FeedbackCollector::new(dir.path(), 1.0, false);
        assert!(!collector.should_prompt("list files"));
    }

    #[test]
    fn test_session_dedup() {
        let dir = TempDir::new().unwrap();
        let collector = FeedbackCollector::new(dir.path(), 1.0, true);
        assert!(collector.should_prompt("list files"));
        assert!(!collector.should_prompt("List Files "));
    }

    #[test]
    fn test_prior_feedback_skipped() {
        let dir = TempDir::new().unwrap();
        let collector = FeedbackCollector::new(dir.path(), 1.0, true);
        collector.record("list files", "list", "FileOps", "positive", 50.0, true, None);

        let fresh = FeedbackCollector::new(dir.path(), 1.0, true);
        assert!(!fresh.should_prompt("list files"));
    }

    #[test]
    fn test_sampling_zero_rate() {
        let dir = TempDir::new().unwrap();
        let collector = FeedbackCollector::new(dir.path(), 0.0, true);
        assert!(!collector.should_prompt("list files"));
    }

    #[test]
    fn test_redaction() {
        assert_eq!(redact("email me at dev@example.com"), "email me at <email>");
        assert_eq!(
            redact("login with password=hunter2 please"),
            "login with password=<redacted> please"
        );
        assert_eq!(redact("set API_KEY: sk-12345"), "set API_KEY=<redacted>");
    }

    #[test]
    fn test_record_truncates_and_persists() {
        let dir = TempDir::new().unwrap();
        let collector = FeedbackCollector::new(dir.path(), 1.0, true);

        let long_input = "x".repeat(500);
        collector.record(&long_input, "goal", "FileOps", "negative", 10.0, false, None);

        let entries = collector.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_input.len(), 200);
        assert_eq!(entries[0].feedback, "negative");
    }
}
