//! Intent history
//!
//! Append-only JSONL record of executed commands. Feeds the pattern
//! detector, the semantic index, and `explain history`.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::intent::Intent;

/// One executed command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: String,
    pub user_input: String,
    pub goal: String,
    pub tools: Vec<String>,
    pub success: bool,
}

/// Append-only history store at `<state_root>/history.jsonl`
pub struct IntentHistory {
    path: PathBuf,
}

impl IntentHistory {
    pub fn open(state_root: &Path) -> Self {
        Self {
            path: state_root.join("history.jsonl"),
        }
    }

    pub fn record(&self, user_input: &str, intent: &Intent, success: bool) -> Result<()> {
        let record = HistoryRecord {
            timestamp: Utc::now().to_rfc3339(),
            user_input: user_input.to_string(),
            goal: intent.goal.clone(),
            tools: intent.steps.iter().map(|s| s.tool.clone()).collect(),
            success,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// All records in chronological order; malformed lines are skipped.
    pub fn load(&self) -> Vec<HistoryRecord> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn recent(&self, n: usize) -> Vec<HistoryRecord> {
        let mut all = self.load();
        let skip = all.len().saturating_sub(n);
        all.drain(..skip);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn intent() -> Intent {
        Intent::parse(
            r#"{"goal": "scan", "steps": [
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp"}, "risk": 0}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_record_and_load() {
        let dir = TempDir::new().unwrap();
        let history = IntentHistory::open(dir.path());

        history.record("list files", &intent(), true).unwrap();
        history.record("list files again", &intent(), false).unwrap();

        let records = history.load();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_input, "list files");
        assert!(records[0].success);
        assert!(!records[1].success);
        assert_eq!(records[0].tools, vec!["FileOps"]);
    }

    #[test]
    fn test_recent_takes_tail() {
        let dir = TempDir::new().unwrap();
        let history = IntentHistory::open(dir.path());

        for i in 0..5 {
            history.record(&format!("cmd {}", i), &intent(), true).unwrap();
        }
        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].user_input, "cmd 4");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("history.jsonl"), "garbage\n").unwrap();

        let history = IntentHistory::open(dir.path());
        history.record("ok", &intent(), true).unwrap();
        assert_eq!(history.load().len(), 1);
    }
}
