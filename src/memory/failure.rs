//! Failure logging and analysis
//!
//! Every execution failure is categorized, persisted, and folded into a
//! pattern table so the engine learns which operations go wrong and what
//! fixed them. Before execution, past failures derate the success
//! probability; after a failure, the analyzer produces categorized
//! suggestions and a recovery plan for known categories.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::error::{MaestroError, Result};

/// Failure taxonomy. Categorization is a stable case-insensitive
/// substring match over the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    PermissionDenied,
    FileNotFound,
    CommandNotFound,
    SyntaxError,
    NetworkError,
    Timeout,
    DiskSpace,
    PackageConflict,
    MemoryError,
    ProcessKilled,
    ParseError,
    Unknown,
}

impl FailureKind {
    /// Categorize raw error text. Indicator order matters: the more
    /// specific phrases are checked before generic ones ("command not
    /// found" before "not found").
    pub fn categorize(error_message: &str) -> Self {
        let text = error_message.to_lowercase();

        const INDICATORS: &[(FailureKind, &[&str])] = &[
            (
                FailureKind::PermissionDenied,
                &["permission denied", "access denied", "not permitted", "operation not permitted"],
            ),
            (
                FailureKind::CommandNotFound,
                &["command not found", "not recognized as"],
            ),
            (
                FailureKind::FileNotFound,
                &["no such file", "not found", "does not exist"],
            ),
            (
                FailureKind::SyntaxError,
                &["syntax error", "invalid syntax", "unexpected token"],
            ),
            (
                FailureKind::NetworkError,
                &["connection refused", "network unreachable", "no route to host", "network error"],
            ),
            (FailureKind::Timeout, &["timed out", "timeout"]),
            (
                FailureKind::DiskSpace,
                &["no space left", "disk full", "quota exceeded"],
            ),
            (
                FailureKind::PackageConflict,
                &["dependency conflict", "version mismatch", "incompatible"],
            ),
            (FailureKind::MemoryError, &["out of memory", "memory"]),
            (FailureKind::ProcessKilled, &["killed", "signal"]),
            (FailureKind::ParseError, &["parse", "parsing"]),
        ];

        for (kind, phrases) in INDICATORS {
            if phrases.iter().any(|p| text.contains(p)) {
                return *kind;
            }
        }
        FailureKind::Unknown
    }

    /// How many retries the adaptive planner may spend on this category.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NetworkError | Self::Timeout | Self::MemoryError => 3,
            Self::Unknown => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::FileNotFound => "file_not_found",
            Self::CommandNotFound => "command_not_found",
            Self::SyntaxError => "syntax_error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::DiskSpace => "disk_space",
            Self::PackageConflict => "package_conflict",
            Self::MemoryError => "memory_error",
            Self::ProcessKilled => "process_killed",
            Self::ParseError => "parse_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded failure
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub id: i64,
    pub timestamp: String,
    pub user_input: String,
    pub intent_goal: String,
    pub tool: String,
    pub error_type: String,
    pub error_message: String,
    pub context: Value,
    pub resolution: Option<String>,
}

/// Pre-execution risk assessment derived from past failures
#[derive(Debug, Clone, Default)]
pub struct PreExecutionAnalysis {
    pub has_warnings: bool,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub success_probability: f64,
    pub similar_failures: Vec<FailureRecord>,
}

/// Post-failure analysis result
#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    pub failure_id: i64,
    pub error_type: FailureKind,
    pub suggestions: Vec<String>,
    pub similar_failures: Vec<FailureRecord>,
    pub is_recurring: bool,
    pub recovery_plan: Option<String>,
}

/// Persistent failure store + analyzer over `failures.db`
pub struct FailureAnalyzer {
    conn: Mutex<Connection>,
}

impl FailureAnalyzer {
    pub fn open(state_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_root)
            .map_err(|_| MaestroError::StateDirCreation {
                path: state_root.to_path_buf(),
            })?;
        let conn = Connection::open(state_root.join("failures.db"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                user_input TEXT NOT NULL,
                intent_goal TEXT NOT NULL,
                tool TEXT NOT NULL,
                error_type TEXT NOT NULL,
                error_message TEXT NOT NULL,
                context_json TEXT,
                resolution TEXT
            );
            CREATE TABLE IF NOT EXISTS failure_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_hash TEXT UNIQUE NOT NULL,
                pattern_description TEXT,
                count INTEGER DEFAULT 1,
                last_seen TEXT NOT NULL,
                suggested_fix TEXT,
                success_after_fix INTEGER DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_failures_timestamp ON failures(timestamp);
            CREATE INDEX IF NOT EXISTS idx_failures_tool ON failures(tool);
            CREATE INDEX IF NOT EXISTS idx_failures_error_type ON failures(error_type);
            CREATE INDEX IF NOT EXISTS idx_patterns_hash ON failure_patterns(pattern_hash);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a failure and fold it into the pattern table.
    pub fn log_failure(
        &self,
        user_input: &str,
        intent_goal: &str,
        tool: &str,
        error_message: &str,
        context: &Value,
    ) -> Result<(i64, FailureKind)> {
        let kind = FailureKind::categorize(error_message);
        let timestamp = Utc::now().to_rfc3339();

        let conn = self.conn.lock().expect("failure db poisoned");
        conn.execute(
            "INSERT INTO failures
             (timestamp, user_input, intent_goal, tool, error_type, error_message, context_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                timestamp,
                user_input,
                intent_goal,
                tool,
                kind.as_str(),
                error_message,
                context.to_string(),
            ],
        )?;
        let failure_id = conn.last_insert_rowid();

        let hash = pattern_hash(tool, kind, error_message);
        let updated = conn.execute(
            "UPDATE failure_patterns SET count = count + 1, last_seen = ?1 WHERE pattern_hash = ?2",
            params![timestamp, hash],
        )?;
        if updated == 0 {
            let description = format!("{} {}: {}", tool, kind, truncate(error_message, 100));
            conn.execute(
                "INSERT INTO failure_patterns (pattern_hash, pattern_description, last_seen)
                 VALUES (?1, ?2, ?3)",
                params![hash, description, timestamp],
            )?;
        }

        debug!(failure_id, error_type = %kind, tool, "failure logged");
        Ok((failure_id, kind))
    }

    /// Most recent failures for a tool, newest first.
    pub fn similar_failures(&self, tool: Option<&str>, limit: usize) -> Result<Vec<FailureRecord>> {
        let conn = self.conn.lock().expect("failure db poisoned");

        let mut records = Vec::new();
        let mut push_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            records.push(FailureRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                user_input: row.get(2)?,
                intent_goal: row.get(3)?,
                tool: row.get(4)?,
                error_type: row.get(5)?,
                error_message: row.get(6)?,
                context: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(Value::Null),
                resolution: row.get(8)?,
            });
            Ok(())
        };

        const COLUMNS: &str = "id, timestamp, user_input, intent_goal, tool, error_type, \
                               error_message, context_json, resolution";
        if let Some(tool) = tool {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM failures WHERE tool = ?1 ORDER BY timestamp DESC LIMIT ?2",
                COLUMNS
            ))?;
            let mut rows = stmt.query(params![tool, limit as i64])?;
            while let Some(row) = rows.next()? {
                push_row(row)?;
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM failures ORDER BY timestamp DESC LIMIT ?1",
                COLUMNS
            ))?;
            let mut rows = stmt.query(params![limit as i64])?;
            while let Some(row) = rows.next()? {
                push_row(row)?;
            }
        }

        Ok(records)
    }

    /// Learned suggestion for a pattern, only when the fix has worked more
    /// than half the times the pattern was seen.
    pub fn pattern_suggestion(&self, tool: &str, error_message: &str) -> Result<Option<String>> {
        let kind = FailureKind::categorize(error_message);
        let hash = pattern_hash(tool, kind, error_message);

        let conn = self.conn.lock().expect("failure db poisoned");
        let row: Option<(Option<String>, i64, i64)> = conn
            .query_row(
                "SELECT suggested_fix, count, success_after_fix
                 FROM failure_patterns WHERE pattern_hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(row.and_then(|(fix, count, successes)| {
            match fix {
                Some(fix) if successes as f64 > count as f64 * 0.5 => Some(fix),
                _ => None,
            }
        }))
    }

    pub fn add_pattern_suggestion(
        &self,
        tool: &str,
        error_message: &str,
        suggested_fix: &str,
    ) -> Result<()> {
        let kind = FailureKind::categorize(error_message);
        let hash = pattern_hash(tool, kind, error_message);
        let conn = self.conn.lock().expect("failure db poisoned");
        conn.execute(
            "UPDATE failure_patterns SET suggested_fix = ?1 WHERE pattern_hash = ?2",
            params![suggested_fix, hash],
        )?;
        Ok(())
    }

    pub fn mark_pattern_success(&self, tool: &str, error_message: &str) -> Result<()> {
        let kind = FailureKind::categorize(error_message);
        let hash = pattern_hash(tool, kind, error_message);
        let conn = self.conn.lock().expect("failure db poisoned");
        conn.execute(
            "UPDATE failure_patterns SET success_after_fix = success_after_fix + 1
             WHERE pattern_hash = ?1",
            params![hash],
        )?;
        Ok(())
    }

    /// Analyze an intent before execution: derate success probability by
    /// past failures of the tools involved and surface known fixes.
    pub fn analyze_before_execution(
        &self,
        intent: &crate::intent::Intent,
    ) -> Result<PreExecutionAnalysis> {
        let mut analysis = PreExecutionAnalysis {
            success_probability: 1.0,
            ..Default::default()
        };

        let mut seen_tools = std::collections::HashSet::new();
        for step in &intent.steps {
            if !seen_tools.insert(step.tool.clone()) {
                continue;
            }

            let similar = self.similar_failures(Some(&step.tool), 3)?;
            if similar.is_empty() {
                continue;
            }

            analysis.has_warnings = true;
            let count = similar.len();
            analysis.success_probability *= match count {
                1 => 0.85,
                2 => 0.7,
                _ => 0.5,
            };
            analysis.warnings.push(format!(
                "Tool '{}' has failed {} time(s) recently",
                step.tool, count
            ));

            for failure in &similar {
                // Learned fixes first, then the static hint for the
                // failure's category.
                if let Some(fix) = self.pattern_suggestion(&failure.tool, &failure.error_message)? {
                    if !analysis.suggestions.contains(&fix) {
                        analysis.suggestions.push(fix);
                    }
                }
                let kind = FailureKind::categorize(&failure.error_message);
                if let Some(hint) = known_suggestions(kind).first() {
                    let hint = hint.to_string();
                    if !analysis.suggestions.contains(&hint) {
                        analysis.suggestions.push(hint);
                    }
                }
            }
            analysis.similar_failures.extend(similar);
        }

        Ok(analysis)
    }

    /// Log and analyze a failure: categorized suggestions (capped at 5),
    /// similar failures, recurrence flag, and a recovery plan for known
    /// categories.
    pub fn analyze_failure(
        &self,
        user_input: &str,
        intent_goal: &str,
        tool: &str,
        error_message: &str,
        context: &Value,
    ) -> Result<FailureAnalysis> {
        let (failure_id, kind) =
            self.log_failure(user_input, intent_goal, tool, error_message, context)?;

        let mut suggestions = Vec::new();
        if let Some(fix) = self.pattern_suggestion(tool, error_message)? {
            suggestions.push(format!("Learned fix: {}", fix));
        }
        suggestions.extend(known_suggestions(kind).iter().map(|s| s.to_string()));
        suggestions.extend(tool_suggestions(tool, &error_message.to_lowercase()));
        if suggestions.is_empty() {
            suggestions.push("Review the error message for details".to_string());
            suggestions.push("Check the command syntax and arguments".to_string());
        }
        suggestions.truncate(5);

        let similar = self.similar_failures(Some(tool), 3)?;
        // The failure just logged is included in the query results.
        let is_recurring = similar.len() >= 2;

        Ok(FailureAnalysis {
            failure_id,
            error_type: kind,
            suggestions,
            similar_failures: similar,
            is_recurring,
            recovery_plan: recovery_plan(kind),
        })
    }

    pub fn failure_count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("failure db poisoned");
        Ok(conn.query_row("SELECT COUNT(*) FROM failures", [], |row| row.get(0))?)
    }
}

/// Normalize an error message for pattern hashing: paths and integers are
/// replaced by placeholders, text is lowercased and truncated. Applying the
/// normalization twice yields the same result.
pub fn normalize_error(error_message: &str) -> String {
    static PATH_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"/[\w/.\-]+").expect("static regex"));
    static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

    let normalized = PATH_RE.replace_all(error_message, "/<path>");
    let normalized = NUM_RE.replace_all(&normalized, "<NUM>");
    let normalized = normalized.to_lowercase();
    truncate(&normalized, 200)
}

fn pattern_hash(tool: &str, kind: FailureKind, error_message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_error(error_message).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn known_suggestions(kind: FailureKind) -> &'static [&'static str] {
    match kind {
        FailureKind::PermissionDenied => &[
            "Try elevated permissions (sudo) if appropriate",
            "Check file and directory permissions with 'ls -la'",
            "Verify you own the file or directory",
        ],
        FailureKind::FileNotFound => &[
            "Check the file path is correct",
            "Verify the file exists with 'ls' or 'find'",
            "Check for typos in the filename",
        ],
        FailureKind::CommandNotFound => &[
            "Install the required package",
            "Check if the command is in your PATH",
            "Verify the command name spelling",
        ],
        FailureKind::SyntaxError => &[
            "Check for missing quotes or brackets",
            "Verify command syntax with --help",
        ],
        FailureKind::NetworkError => &[
            "Check your internet connection",
            "Verify the server is accessible",
            "Try again after a moment",
        ],
        FailureKind::Timeout => &[
            "Try again (may be temporary)",
            "Check system resources",
            "Increase the timeout if possible",
        ],
        FailureKind::DiskSpace => &[
            "Free up disk space",
            "Check disk usage with 'df -h'",
        ],
        FailureKind::PackageConflict => &[
            "Update package dependencies",
            "Check for version conflicts",
        ],
        FailureKind::MemoryError => &[
            "Close unnecessary programs",
            "Check memory usage",
        ],
        FailureKind::ProcessKilled => &["Check system logs for the kill reason"],
        FailureKind::ParseError => &["Verify the input format"],
        FailureKind::Unknown => &[],
    }
}

fn tool_suggestions(tool: &str, error_lower: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    match tool {
        "FileOps" => {
            if error_lower.contains("permission") {
                suggestions.push("Check file ownership and permissions".to_string());
            }
        }
        "PackageOps" => {
            if error_lower.contains("not found") {
                suggestions.push("Update package lists first".to_string());
            }
            if error_lower.contains("conflict") {
                suggestions.push("Try resolving broken dependencies".to_string());
            }
        }
        "GitOps" => {
            if error_lower.contains("conflict") {
                suggestions.push("Resolve merge conflicts manually".to_string());
            }
            if error_lower.contains("remote") {
                suggestions.push("Check the git remote configuration".to_string());
            }
        }
        "ContainerOps" => {
            if error_lower.contains("not found") {
                suggestions.push("Pull the container image first".to_string());
            }
            if error_lower.contains("permission") {
                suggestions.push("Add your user to the docker group".to_string());
            }
        }
        "NetworkOps" => {
            if error_lower.contains("connection") {
                suggestions.push("Check network connectivity".to_string());
            }
        }
        _ => {}
    }
    suggestions
}

fn recovery_plan(kind: FailureKind) -> Option<String> {
    let plan = match kind {
        FailureKind::PermissionDenied => {
            "1. Check permissions with 'ls -la <path>'\n\
             2. Fix permissions with 'chmod' or 'chown'\n\
             3. Or retry with elevated permissions if appropriate"
        }
        FailureKind::FileNotFound => {
            "1. Verify the file path\n\
             2. Check spelling and case sensitivity\n\
             3. Use 'find' to locate the file"
        }
        FailureKind::CommandNotFound => {
            "1. Install the required package\n\
             2. Or check if it's installed but not in PATH\n\
             3. Verify the command name"
        }
        FailureKind::NetworkError => {
            "1. Check internet connection\n\
             2. Verify firewall settings\n\
             3. Wait and retry if the server is temporarily down"
        }
        _ => return None,
    };
    Some(plan.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use tempfile::TempDir;

    #[test]
    fn test_categorization() {
        assert_eq!(
            FailureKind::categorize("Permission denied: /etc/shadow"),
            FailureKind::PermissionDenied
        );
        assert_eq!(
            FailureKind::categorize("bash: frobnicate: command not found"),
            FailureKind::CommandNotFound
        );
        assert_eq!(
            FailureKind::categorize("No such file or directory"),
            FailureKind::FileNotFound
        );
        assert_eq!(
            FailureKind::categorize("Connection refused by host"),
            FailureKind::NetworkError
        );
        assert_eq!(
            FailureKind::categorize("operation timed out after 30s"),
            FailureKind::Timeout
        );
        assert_eq!(FailureKind::categorize("???"), FailureKind::Unknown);
    }

    #[test]
    fn test_retry_policy() {
        assert_eq!(FailureKind::PermissionDenied.max_retries(), 0);
        assert_eq!(FailureKind::FileNotFound.max_retries(), 0);
        assert_eq!(FailureKind::SyntaxError.max_retries(), 0);
        assert_eq!(FailureKind::NetworkError.max_retries(), 3);
        assert_eq!(FailureKind::Timeout.max_retries(), 3);
        assert_eq!(FailureKind::MemoryError.max_retries(), 3);
        assert_eq!(FailureKind::Unknown.max_retries(), 1);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let raw = "cannot open /home/user/projects/demo.txt at line 42";
        let once = normalize_error(raw);
        let twice = normalize_error(&once);
        assert_eq!(once, twice);
        assert!(once.contains("/<path>"));
        assert!(once.contains("<num>"));
    }

    #[test]
    fn test_normalization_ignores_specifics() {
        let a = normalize_error("cannot open /tmp/alpha.txt at line 3");
        let b = normalize_error("cannot open /var/log/beta.log at line 99");
        assert_eq!(a, b);
    }

    #[test]
    fn test_log_and_recurrence() {
        let dir = TempDir::new().unwrap();
        let analyzer = FailureAnalyzer::open(dir.path()).unwrap();

        let ctx = Value::Null;
        analyzer
            .log_failure("install foo", "install", "PackageOps", "package not found", &ctx)
            .unwrap();
        let analysis = analyzer
            .analyze_failure("install foo", "install", "PackageOps", "package not found", &ctx)
            .unwrap();

        assert_eq!(analysis.error_type, FailureKind::FileNotFound);
        assert!(analysis.is_recurring);
        assert!(!analysis.suggestions.is_empty());
        assert!(analysis.suggestions.len() <= 5);
    }

    #[test]
    fn test_pre_execution_derating() {
        let dir = TempDir::new().unwrap();
        let analyzer = FailureAnalyzer::open(dir.path()).unwrap();
        let ctx = Value::Null;

        let intent = Intent::parse(
            r#"{"goal": "scan", "steps": [
                {"tool": "FileOps", "action": "scan", "args": {"path": "/tmp"}, "risk": 0}
            ]}"#,
        )
        .unwrap();

        let clean = analyzer.analyze_before_execution(&intent).unwrap();
        assert!((clean.success_probability - 1.0).abs() < f64::EPSILON);
        assert!(!clean.has_warnings);

        analyzer
            .log_failure("x", "g", "FileOps", "permission denied", &ctx)
            .unwrap();
        let one = analyzer.analyze_before_execution(&intent).unwrap();
        assert!((one.success_probability - 0.85).abs() < 1e-9);

        analyzer
            .log_failure("x", "g", "FileOps", "permission denied", &ctx)
            .unwrap();
        let two = analyzer.analyze_before_execution(&intent).unwrap();
        assert!((two.success_probability - 0.7).abs() < 1e-9);

        analyzer
            .log_failure("x", "g", "FileOps", "permission denied", &ctx)
            .unwrap();
        let three = analyzer.analyze_before_execution(&intent).unwrap();
        assert!((three.success_probability - 0.5).abs() < 1e-9);
        assert!(three.has_warnings);
    }

    #[test]
    fn test_learned_suggestion_gate() {
        let dir = TempDir::new().unwrap();
        let analyzer = FailureAnalyzer::open(dir.path()).unwrap();
        let ctx = Value::Null;
        let msg = "connection refused";

        analyzer
            .log_failure("fetch", "fetch", "NetworkOps", msg, &ctx)
            .unwrap();
        analyzer
            .add_pattern_suggestion("NetworkOps", msg, "check the VPN")
            .unwrap();

        // One sighting, zero successes: suggestion withheld.
        assert!(analyzer.pattern_suggestion("NetworkOps", msg).unwrap().is_none());

        analyzer.mark_pattern_success("NetworkOps", msg).unwrap();
        // success_after_fix (1) > 0.5 * count (1): suggestion surfaces.
        assert_eq!(
            analyzer.pattern_suggestion("NetworkOps", msg).unwrap().as_deref(),
            Some("check the VPN")
        );
    }

    #[test]
    fn test_recovery_plan_known_categories_only() {
        assert!(recovery_plan(FailureKind::PermissionDenied).is_some());
        assert!(recovery_plan(FailureKind::NetworkError).is_some());
        assert!(recovery_plan(FailureKind::Unknown).is_none());
        assert!(recovery_plan(FailureKind::ProcessKilled).is_none());
    }
}
