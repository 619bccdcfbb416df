//! Environment context snapshots
//!
//! Gathers facts about the user's environment (directory, git state, time,
//! processes, recent files, system load) into a pure value used as prompt
//! context and for suggestion/feedback decisions. Every probe is total: a
//! failing subsystem contributes its sentinel defaults and the snapshot
//! always returns.

use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use walkdir::WalkDir;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RECENT_FILES: usize = 10;

/// Complete context snapshot for one utterance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub directory: DirectoryContext,
    pub git: GitContext,
    pub time: TimeContext,
    pub processes: ProcessContext,
    pub recent_files: Vec<String>,
    pub system: SystemContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryContext {
    /// Home-relative display path (`~/projects/foo`) when under home
    pub path: String,
    pub absolute_path: PathBuf,
    pub project_name: String,
    pub project_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitContext {
    pub is_repo: bool,
    pub branch: Option<String>,
    pub status_summary: Option<String>,
    pub modified_files: usize,
    pub ahead_commits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeContext {
    pub timestamp: String,
    pub hour: u32,
    pub day_of_week: String,
    pub time_of_day: String,
    pub is_weekend: bool,
    pub is_work_hours: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessContext {
    pub total: usize,
    pub dev_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemContext {
    pub load_average: f64,
    pub disk_usage_percent: f64,
    pub is_busy: bool,
    pub low_disk: bool,
}

/// Builds context snapshots for the orchestrator
pub struct ContextBuilder {
    cwd: PathBuf,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// Build a full snapshot. Never fails; subsystems degrade to defaults.
    pub async fn build(&self) -> ContextSnapshot {
        ContextSnapshot {
            directory: self.directory_context(),
            git: self.git_context().await,
            time: self.time_context(),
            processes: self.process_context().await,
            recent_files: self.recent_files(),
            system: self.system_context().await,
        }
    }

    fn directory_context(&self) -> DirectoryContext {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        let path = match self.cwd.strip_prefix(&home) {
            Ok(rel) if rel.as_os_str().is_empty() => "~".to_string(),
            Ok(rel) => format!("~/{}", rel.display()),
            Err(_) => self.cwd.display().to_string(),
        };

        let project_name = self
            .cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        DirectoryContext {
            path,
            absolute_path: self.cwd.clone(),
            project_name,
            project_type: detect_project_type(&self.cwd),
        }
    }

    async fn git_context(&self) -> GitContext {
        let in_repo = run_probe("git", &["rev-parse", "--git-dir"], &self.cwd).await;
        if in_repo.is_none() {
            return GitContext::default();
        }

        let branch = run_probe("git", &["branch", "--show-current"], &self.cwd)
            .await
            .map(|out| {
                let b = out.trim().to_string();
                if b.is_empty() {
                    "detached HEAD".to_string()
                } else {
                    b
                }
            });

        let modified = run_probe("git", &["status", "--porcelain"], &self.cwd)
            .await
            .map(|out| out.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0);

        let ahead = run_probe("git", &["rev-list", "--count", "@{u}..HEAD"], &self.cwd)
            .await
            .and_then(|out| out.trim().parse().ok())
            .unwrap_or(0);

        let status_summary = if modified == 0 {
            "clean".to_string()
        } else {
            format!("{} changes", modified)
        };

        GitContext {
            is_repo: true,
            branch,
            status_summary: Some(status_summary),
            modified_files: modified,
            ahead_commits: ahead,
        }
    }

    fn time_context(&self) -> TimeContext {
        let now = Local::now();
        let hour = now.hour();

        let time_of_day = match hour {
            5..=11 => "morning",
            12..=16 => "afternoon",
            17..=20 => "evening",
            _ => "night",
        };

        let day_of_week = now.format("%A").to_string();
        let is_weekend = matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);

        TimeContext {
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            hour,
            day_of_week,
            time_of_day: time_of_day.to_string(),
            is_weekend,
            is_work_hours: (9..18).contains(&hour) && !is_weekend,
        }
    }

    async fn process_context(&self) -> ProcessContext {
        let Some(out) = run_probe("ps", &["aux"], &self.cwd).await else {
            return ProcessContext::default();
        };

        let total = out.lines().count().saturating_sub(1);

        let known = ["code", "docker", "node", "python", "cargo", "rust-analyzer"];
        let dev_tools = known
            .iter()
            .filter(|name| out.contains(**name))
            .map(|s| s.to_string())
            .collect();

        ProcessContext { total, dev_tools }
    }

    /// Files under cwd modified in the last 24 h, depth <= 2, hidden
    /// excluded, newest first, capped at 10.
    fn recent_files(&self) -> Vec<String> {
        let now = std::time::SystemTime::now();
        let mut recent: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        let walker = WalkDir::new(&self.cwd)
            .max_depth(2)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .map(|n| n.starts_with('.'))
                        .unwrap_or(false)
            });

        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            if let Ok(age) = now.duration_since(mtime) {
                if age < Duration::from_secs(86_400) {
                    recent.push((entry.path().to_path_buf(), mtime));
                }
            }
        }

        recent.sort_by(|a, b| b.1.cmp(&a.1));
        recent
            .into_iter()
            .take(MAX_RECENT_FILES)
            .map(|(p, _)| {
                p.strip_prefix(&self.cwd)
                    .map(|r| r.display().to_string())
                    .unwrap_or_else(|_| p.display().to_string())
            })
            .collect()
    }

    async fn system_context(&self) -> SystemContext {
        let load_average = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<f64>().ok())
            })
            .unwrap_or(0.0);

        let disk_usage_percent = run_probe("df", &["-P", "."], &self.cwd)
            .await
            .and_then(|out| {
                out.lines()
                    .nth(1)
                    .and_then(|line| line.split_whitespace().nth(4))
                    .and_then(|pct| pct.trim_end_matches('%').parse::<f64>().ok())
            })
            .unwrap_or(0.0);

        SystemContext {
            load_average,
            disk_usage_percent,
            is_busy: load_average > 2.0,
            low_disk: disk_usage_percent > 90.0,
        }
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextSnapshot {
    /// Stable subset of the context used for cache keying. Volatile
    /// facts (timestamps, load, recent files) would defeat memoization.
    pub fn cache_context(&self) -> String {
        let mut parts = vec![self.directory.path.clone()];
        if let Some(ptype) = &self.directory.project_type {
            parts.push(ptype.clone());
        }
        if let Some(branch) = &self.git.branch {
            parts.push(branch.clone());
        }
        parts.join("|")
    }

    /// Render the snapshot as prompt context for the oracle
    pub fn to_prompt(&self) -> String {
        let mut parts = vec![format!("Working directory: {}", self.directory.path)];

        if !self.directory.project_name.is_empty() {
            parts.push(format!("Project: {}", self.directory.project_name));
        }
        if let Some(ptype) = &self.directory.project_type {
            parts.push(format!("Project type: {}", ptype));
        }
        if self.git.is_repo {
            parts.push(format!(
                "Git: {} ({})",
                self.git.branch.as_deref().unwrap_or("unknown"),
                self.git.status_summary.as_deref().unwrap_or("unknown")
            ));
        }
        parts.push(format!(
            "Time: {} ({})",
            self.time.time_of_day, self.time.timestamp
        ));
        if !self.recent_files.is_empty() {
            let shown: Vec<&str> = self.recent_files.iter().take(3).map(|s| s.as_str()).collect();
            parts.push(format!("Recent files: {}", shown.join(", ")));
        }

        parts.join("\n")
    }
}

async fn run_probe(program: &str, args: &[&str], cwd: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(program).args(args).current_dir(cwd).output(),
    )
    .await
    .ok()?
    .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        None
    }
}

fn detect_project_type(path: &Path) -> Option<String> {
    let indicators: &[(&str, &[&str])] = &[
        ("Rust", &["Cargo.toml"]),
        ("Node.js", &["package.json"]),
        ("Python", &["pyproject.toml", "setup.py", "requirements.txt"]),
        ("Go", &["go.mod"]),
        ("Java", &["pom.xml", "build.gradle"]),
        ("C/C++", &["CMakeLists.txt", "Makefile"]),
        ("Ruby", &["Gemfile"]),
        ("Docker", &["Dockerfile", "docker-compose.yml"]),
    ];

    for (ptype, files) in indicators {
        if files.iter().any(|f| path.join(f).exists()) {
            return Some(ptype.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_is_total() {
        // A nonexistent cwd must still produce a snapshot with sentinels.
        let builder = ContextBuilder::with_cwd("/nonexistent/maestro-test");
        let snapshot = builder.build().await;
        assert!(!snapshot.git.is_repo);
        assert!(snapshot.recent_files.is_empty());
    }

    #[tokio::test]
    async fn test_recent_files_excludes_hidden() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("visible.txt"), "x").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();

        let builder = ContextBuilder::with_cwd(dir.path());
        let recent = builder.recent_files();
        assert!(recent.iter().any(|f| f == "visible.txt"));
        assert!(!recent.iter().any(|f| f.contains("hidden")));
    }

    #[tokio::test]
    async fn test_project_type_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        assert_eq!(detect_project_type(dir.path()).as_deref(), Some("Rust"));
    }

    #[test]
    fn test_time_of_day_bounds() {
        let builder = ContextBuilder::new();
        let ctx = builder.time_context();
        assert!(["morning", "afternoon", "evening", "night"].contains(&ctx.time_of_day.as_str()));
        assert!(ctx.hour < 24);
    }
}
