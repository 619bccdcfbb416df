//! Rollback engine
//!
//! Undoes recorded actions by executing their derived inverses in reverse
//! insertion order. A transaction is rollbackable only when every still
//! active action has a usable strategy; `manual` and `not_rollbackable`
//! strategies never execute. Inverse failures are collected, not raised,
//! and the transaction ends up `completed` or `partial` accordingly.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::core::error::{MaestroError, Result};
use crate::memory::action_tracker::{ActionRecord, ActionTracker, RollbackStrategy};
use crate::tools::Sandbox;

/// Feasibility analysis of a set of actions
#[derive(Debug, Clone)]
pub struct Feasibility {
    pub possible: bool,
    pub rollbackable_count: usize,
    pub non_rollbackable: Vec<String>,
    pub reason: Option<String>,
}

/// Result of a rollback run
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub success: bool,
    pub dry_run: bool,
    /// Ordered human-readable plan (dry run) or executed descriptions
    pub plan: Vec<String>,
    pub actions_rolled_back: usize,
    pub actions_failed: usize,
    pub errors: Vec<String>,
    pub files_restored: usize,
    pub warnings: Vec<String>,
}

/// Executes inverse operations against the action store
pub struct RollbackEngine {
    tracker: Arc<ActionTracker>,
    sandbox: Arc<Sandbox>,
}

impl RollbackEngine {
    pub fn new(tracker: Arc<ActionTracker>, sandbox: Arc<Sandbox>) -> Self {
        Self { tracker, sandbox }
    }

    /// A transaction is rollbackable iff every still-active action is;
    /// already rolled-back actions don't block.
    pub fn feasible(&self, actions: &[ActionRecord]) -> Feasibility {
        let mut rollbackable = 0;
        let mut non_rollbackable = Vec::new();

        for action in actions {
            if action.rolled_back {
                continue;
            }
            if action.rollback_possible {
                rollbackable += 1;
            } else {
                non_rollbackable.push(format!("{}.{}", action.tool, action.operation));
            }
        }

        let possible = non_rollbackable.is_empty();
        let reason = (!possible).then(|| {
            format!(
                "The following actions cannot be rolled back: {}",
                non_rollbackable.join(", ")
            )
        });

        Feasibility {
            possible,
            rollbackable_count: rollbackable,
            non_rollbackable,
            reason,
        }
    }

    /// Roll back a whole transaction in reverse insertion order.
    pub async fn rollback_transaction(
        &self,
        transaction_id: &str,
        dry_run: bool,
    ) -> Result<RollbackReport> {
        let actions = self.tracker.list_transaction(transaction_id)?;
        if actions.is_empty() {
            return Err(MaestroError::rollback(format!(
                "no actions found for transaction {}",
                transaction_id
            )));
        }

        let feasibility = self.feasible(&actions);
        if !feasibility.possible {
            return Err(MaestroError::rollback(
                feasibility
                    .reason
                    .unwrap_or_else(|| "transaction is not rollbackable".to_string()),
            ));
        }

        let report = self.undo_actions(&actions, dry_run).await;

        if !dry_run {
            let status = if report.success { "completed" } else { "partial" };
            self.tracker.set_rollback_status(transaction_id, status)?;
            info!(txn = %transaction_id, status, "rollback finished");
        }

        Ok(report)
    }

    /// Roll back the last `n` actions of the most recent transaction.
    ///
    /// This path skips the feasibility gate by explicit caller request:
    /// non-rollbackable actions are skipped with a warning instead.
    pub async fn rollback_last_n(&self, n: usize, dry_run: bool) -> Result<RollbackReport> {
        let recent = self.tracker.recent_transactions(1)?;
        let last = recent
            .first()
            .ok_or_else(|| MaestroError::rollback("no recent transactions found"))?;

        let actions = self.tracker.list_transaction(&last.id)?;
        if actions.is_empty() {
            return Err(MaestroError::rollback("last transaction has no actions"));
        }

        let take = n.min(actions.len());
        let slice = &actions[actions.len() - take..];

        Ok(self.undo_actions(slice, dry_run).await)
    }

    /// Restore every file backed up by a checkpoint. Missing backups are
    /// warnings, not fatals.
    pub async fn restore_checkpoint(&self, name: &str, dry_run: bool) -> Result<RollbackReport> {
        let checkpoint = self
            .tracker
            .get_checkpoint(name)?
            .ok_or_else(|| MaestroError::rollback(format!("checkpoint '{}' not found", name)))?;

        let mut report = RollbackReport {
            success: true,
            dry_run,
            ..Default::default()
        };

        for (original, backup) in &checkpoint.backup_paths {
            let Some(backup_path) = backup.as_str() else { continue };

            if dry_run {
                report.plan.push(format!("Restore {}", original));
                continue;
            }

            if !Path::new(backup_path).exists() {
                report
                    .warnings
                    .push(format!("backup file not found: {}", backup_path));
                continue;
            }

            match std::fs::copy(backup_path, original) {
                Ok(_) => {
                    report.files_restored += 1;
                    report.plan.push(format!("Restored {}", original));
                }
                Err(e) => {
                    report.success = false;
                    report
                        .errors
                        .push(format!("failed to restore {}: {}", original, e));
                }
            }
        }

        Ok(report)
    }

    /// Undo a slice of actions in reverse order, collecting errors.
    async fn undo_actions(&self, actions: &[ActionRecord], dry_run: bool) -> RollbackReport {
        let mut report = RollbackReport {
            success: true,
            dry_run,
            ..Default::default()
        };

        for action in actions.iter().rev() {
            if action.rolled_back {
                continue;
            }
            if !action.rollback_possible {
                report
                    .warnings
                    .push(format!("skipping non-rollbackable {}.{}", action.tool, action.operation));
                continue;
            }

            let description = describe(action);
            if dry_run {
                report.plan.push(description);
                continue;
            }

            match self.execute_inverse(action).await {
                Ok(()) => {
                    if let Err(e) = self.tracker.mark_rolled_back(action.id) {
                        warn!(action = action.id, error = %e, "failed to mark rolled back");
                    }
                    report.actions_rolled_back += 1;
                    report.plan.push(description);
                }
                Err(e) => {
                    let message = format!("failed to rollback action {}: {}", action.id, e);
                    warn!("{}", message);
                    report.errors.push(message);
                    report.actions_failed += 1;
                    report.success = false;
                }
            }
        }

        report
    }

    async fn execute_inverse(&self, action: &ActionRecord) -> Result<()> {
        let data = action.rollback_data.clone().unwrap_or(Value::Null);
        let get = |key: &str| {
            data.get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    MaestroError::rollback(format!(
                        "rollback data for {}.{} is missing '{}'",
                        action.tool, action.operation, key
                    ))
                })
        };

        match action.rollback_strategy {
            RollbackStrategy::Delete => {
                let path = get("path")?;
                let path = Path::new(&path);
                if path.is_dir() {
                    std::fs::remove_dir_all(path)
                        .map_err(|e| MaestroError::rollback(e.to_string()))?;
                } else if path.exists() {
                    std::fs::remove_file(path)
                        .map_err(|e| MaestroError::rollback(e.to_string()))?;
                }
                Ok(())
            }
            RollbackStrategy::DeleteCopy => {
                let path = get("path")?;
                if Path::new(&path).exists() {
                    std::fs::remove_file(&path)
                        .map_err(|e| MaestroError::rollback(e.to_string()))?;
                }
                Ok(())
            }
            RollbackStrategy::MoveBack => {
                let from = get("from")?;
                let to = get("to")?;
                if Path::new(&from).exists() {
                    std::fs::rename(&from, &to)
                        .map_err(|e| MaestroError::rollback(e.to_string()))?;
                }
                Ok(())
            }
            RollbackStrategy::RestoreFromCheckpoint => {
                let path = get("path")?;
                let checkpoint_name = get("checkpoint")?;
                let checkpoint = self
                    .tracker
                    .get_checkpoint(&checkpoint_name)?
                    .ok_or_else(|| {
                        MaestroError::rollback(format!(
                            "checkpoint '{}' not found",
                            checkpoint_name
                        ))
                    })?;

                let backup = checkpoint
                    .backup_paths
                    .get(&path)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MaestroError::rollback(format!(
                            "checkpoint '{}' has no backup for {}",
                            checkpoint_name, path
                        ))
                    })?;

                std::fs::copy(backup, &path)
                    .map_err(|e| MaestroError::rollback(e.to_string()))?;
                Ok(())
            }
            RollbackStrategy::Uninstall => {
                let package = get("package")?;
                self.package_inverse(false, &package).await
            }
            RollbackStrategy::Reinstall => {
                let package = get("package")?;
                self.package_inverse(true, &package).await
            }
            RollbackStrategy::GitReset => {
                let commit = get("commit")?;
                let target = format!("{}^", commit);
                self.run_checked(&["git", "reset", "--hard", &target]).await
            }
            RollbackStrategy::Stop => {
                let service = get("service")?;
                self.run_checked(&["systemctl", "stop", &service]).await
            }
            RollbackStrategy::Start => {
                let service = get("service")?;
                self.run_checked(&["systemctl", "start", &service]).await
            }
            RollbackStrategy::StopAndRemove => {
                let id = get("container_id")?;
                self.run_checked(&["docker", "stop", &id]).await?;
                self.run_checked(&["docker", "rm", &id]).await
            }
            RollbackStrategy::NotRollbackable | RollbackStrategy::Manual => Err(
                MaestroError::rollback(format!(
                    "{}.{} requires manual rollback",
                    action.tool, action.operation
                )),
            ),
        }
    }

    async fn package_inverse(&self, install: bool, package: &str) -> Result<()> {
        let op = if install { "install" } else { "remove" };
        self.run_checked(&["apt", op, "-y", package]).await
    }

    async fn run_checked(&self, argv: &[&str]) -> Result<()> {
        let output = self.sandbox.run_subprocess(argv, None, &[]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MaestroError::rollback(format!(
                "command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn describe(action: &ActionRecord) -> String {
    let data = action.rollback_data.clone().unwrap_or(Value::Null);
    let get = |key: &str| data.get(key).and_then(|v| v.as_str()).unwrap_or("?").to_string();

    match action.rollback_strategy {
        RollbackStrategy::Delete => format!("Delete {}", get("path")),
        RollbackStrategy::DeleteCopy => format!("Delete copied file {}", get("path")),
        RollbackStrategy::MoveBack => format!("Move {} back to {}", get("from"), get("to")),
        RollbackStrategy::RestoreFromCheckpoint => {
            format!("Restore {} from checkpoint {}", get("path"), get("checkpoint"))
        }
        RollbackStrategy::Uninstall => format!("Uninstall package {}", get("package")),
        RollbackStrategy::Reinstall => format!("Reinstall package {}", get("package")),
        RollbackStrategy::GitReset => format!("Reset git to before commit {}", get("commit")),
        RollbackStrategy::Stop => format!("Stop service {}", get("service")),
        RollbackStrategy::Start => format!("Start service {}", get("service")),
        RollbackStrategy::StopAndRemove => {
            format!("Stop and remove container {}", get("container_id"))
        }
        RollbackStrategy::NotRollbackable | RollbackStrategy::Manual => {
            format!("Manual rollback needed for {}.{}", action.tool, action.operation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::action_tracker::TransactionStatus;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<ActionTracker>, RollbackEngine) {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(ActionTracker::open(dir.path()).unwrap());
        let sandbox = Arc::new(Sandbox::rooted_at(dir.path()));
        let engine = RollbackEngine::new(tracker.clone(), sandbox);
        (dir, tracker, engine)
    }

    fn params(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_rollback_create_then_move() {
        let (dir, tracker, engine) = setup();

        // Execute: create a.txt, then move it to b.txt.
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "payload").unwrap();
        std::fs::rename(&a, &b).unwrap();

        let txn = tracker.begin("create and move", "create then move").unwrap();
        tracker
            .record(
                "FileOps",
                "create_file",
                &params(&[("path", &a.display().to_string())]),
                &json!({}),
            )
            .unwrap();
        tracker
            .record(
                "FileOps",
                "move_file",
                &params(&[
                    ("source", &a.display().to_string()),
                    ("dest", &b.display().to_string()),
                ]),
                &json!({}),
            )
            .unwrap();
        tracker.end(&txn, TransactionStatus::Completed).unwrap();

        let report = engine.rollback_transaction(&txn, false).await.unwrap();
        assert!(report.success);
        assert_eq!(report.actions_rolled_back, 2);

        // Inverse of the move ran first (b -> a), then the delete of a.
        assert!(!a.exists());
        assert!(!b.exists());

        let actions = tracker.list_transaction(&txn).unwrap();
        assert!(actions.iter().all(|a| a.rolled_back));

        let recorded = tracker.recent_transactions(1).unwrap();
        assert_eq!(recorded[0].rollback_status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn test_refuses_non_rollbackable_transaction() {
        let (_dir, tracker, engine) = setup();

        let txn = tracker.begin("push it", "commit and push").unwrap();
        tracker
            .record("GitOps", "push", &Map::new(), &json!({}))
            .unwrap();
        tracker.end(&txn, TransactionStatus::Completed).unwrap();

        let actions = tracker.list_transaction(&txn).unwrap();
        let feasibility = engine.feasible(&actions);
        assert!(!feasibility.possible);
        assert_eq!(feasibility.non_rollbackable, vec!["GitOps.push".to_string()]);

        let err = engine.rollback_transaction(&txn, false).await.unwrap_err();
        assert!(matches!(err, MaestroError::Rollback { .. }));

        // Nothing was touched.
        let actions = tracker.list_transaction(&txn).unwrap();
        assert!(actions.iter().all(|a| !a.rolled_back));
    }

    #[tokio::test]
    async fn test_already_rolled_back_does_not_block() {
        let (_dir, tracker, engine) = setup();

        let txn = tracker.begin("x", "y").unwrap();
        let id = tracker
            .record("GitOps", "push", &Map::new(), &json!({}))
            .unwrap();
        tracker.end(&txn, TransactionStatus::Completed).unwrap();
        tracker.mark_rolled_back(id).unwrap();

        let actions = tracker.list_transaction(&txn).unwrap();
        assert!(engine.feasible(&actions).possible);
    }

    #[tokio::test]
    async fn test_dry_run_produces_plan_without_changes() {
        let (dir, tracker, engine) = setup();

        let file = dir.path().join("keep.txt");
        std::fs::write(&file, "data").unwrap();

        let txn = tracker.begin("create", "create file").unwrap();
        tracker
            .record(
                "FileOps",
                "create_file",
                &params(&[("path", &file.display().to_string())]),
                &json!({}),
            )
            .unwrap();
        tracker.end(&txn, TransactionStatus::Completed).unwrap();

        let report = engine.rollback_transaction(&txn, true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.plan.len(), 1);
        assert!(report.plan[0].starts_with("Delete"));
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_last_n_skips_non_rollbackable() {
        let (dir, tracker, engine) = setup();

        let file = dir.path().join("recent.txt");
        std::fs::write(&file, "data").unwrap();

        let txn = tracker.begin("mixed", "mixed").unwrap();
        tracker
            .record("GitOps", "push", &Map::new(), &json!({}))
            .unwrap();
        tracker
            .record(
                "FileOps",
                "create_file",
                &params(&[("path", &file.display().to_string())]),
                &json!({}),
            )
            .unwrap();
        tracker.end(&txn, TransactionStatus::Completed).unwrap();

        let report = engine.rollback_last_n(2, false).await.unwrap();
        assert_eq!(report.actions_rolled_back, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_restore_checkpoint_roundtrip() {
        let (dir, tracker, engine) = setup();

        let file = dir.path().join("settings.json");
        std::fs::write(&file, "v1").unwrap();

        tracker.begin("edit settings", "edit").unwrap();
        tracker
            .checkpoint("before-edit", "settings backup", &[file.clone()])
            .unwrap();

        std::fs::write(&file, "v2").unwrap();

        let report = engine.restore_checkpoint("before-edit", false).await.unwrap();
        assert!(report.success);
        assert_eq!(report.files_restored, 1);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_restore_missing_backup_is_warning() {
        let (dir, tracker, engine) = setup();

        let file = dir.path().join("ghost.txt");
        std::fs::write(&file, "data").unwrap();

        tracker.begin("x", "y").unwrap();
        tracker.checkpoint("cp", "backup", &[file.clone()]).unwrap();

        // Remove the backup behind the engine's back.
        let checkpoint = tracker.get_checkpoint("cp").unwrap().unwrap();
        let backup = checkpoint
            .backup_paths
            .values()
            .next()
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();
        std::fs::remove_file(&backup).unwrap();

        let report = engine.restore_checkpoint("cp", false).await.unwrap();
        assert!(report.success);
        assert_eq!(report.warnings.len(), 1);
    }
}
