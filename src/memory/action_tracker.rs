//! Action tracking for transactional undo
//!
//! Every executed step is recorded with an inverse derived at insertion
//! time from a static `(tool, operation)` decision table. Actions group
//! into transactions sharing one user utterance; exactly one transaction
//! may be open per orchestrator. Checkpoints copy files aside so
//! write/delete operations become restorable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::error::{MaestroError, Result};

/// How a recorded action can be undone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStrategy {
    Delete,
    DeleteCopy,
    MoveBack,
    RestoreFromCheckpoint,
    Uninstall,
    Reinstall,
    GitReset,
    Stop,
    Start,
    StopAndRemove,
    NotRollbackable,
    Manual,
}

impl RollbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::DeleteCopy => "delete_copy",
            Self::MoveBack => "move_back",
            Self::RestoreFromCheckpoint => "restore_from_checkpoint",
            Self::Uninstall => "uninstall",
            Self::Reinstall => "reinstall",
            Self::GitReset => "git_reset",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::StopAndRemove => "stop_and_remove",
            Self::NotRollbackable => "not_rollbackable",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "delete" => Self::Delete,
            "delete_copy" => Self::DeleteCopy,
            "move_back" => Self::MoveBack,
            "restore_from_checkpoint" => Self::RestoreFromCheckpoint,
            "uninstall" => Self::Uninstall,
            "reinstall" => Self::Reinstall,
            "git_reset" => Self::GitReset,
            "stop" => Self::Stop,
            "start" => Self::Start,
            "stop_and_remove" => Self::StopAndRemove,
            "not_rollbackable" => Self::NotRollbackable,
            _ => Self::Manual,
        }
    }
}

impl fmt::Display for RollbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One recorded action with its inverse
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub id: i64,
    pub transaction_id: String,
    pub timestamp: String,
    pub tool: String,
    pub operation: String,
    pub params: Map<String, Value>,
    pub result: Value,
    pub rollback_possible: bool,
    pub rollback_strategy: RollbackStrategy,
    pub rollback_data: Option<Value>,
    pub rolled_back: bool,
}

/// Transaction summary row
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub user_input: String,
    pub intent_goal: String,
    pub status: String,
    pub rollback_status: Option<String>,
}

/// A checkpoint's backed-up paths, keyed by original path
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub name: String,
    pub transaction_id: String,
    pub description: String,
    pub backup_paths: Map<String, Value>,
}

/// Persistent action store over `actions.db`
pub struct ActionTracker {
    conn: Mutex<Connection>,
    current_transaction: Mutex<Option<String>>,
    backup_root: PathBuf,
}

impl ActionTracker {
    pub fn open(state_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_root).map_err(|_| MaestroError::StateDirCreation {
            path: state_root.to_path_buf(),
        })?;
        let conn = Connection::open(state_root.join("actions.db"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                tool TEXT NOT NULL,
                operation TEXT NOT NULL,
                params_json TEXT NOT NULL,
                result_json TEXT,
                rollback_possible INTEGER NOT NULL,
                rollback_strategy TEXT NOT NULL,
                rollback_data_json TEXT,
                rolled_back INTEGER DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL,
                end_time TEXT,
                user_input TEXT NOT NULL,
                intent_goal TEXT NOT NULL,
                status TEXT NOT NULL,
                rollback_status TEXT
            );
            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                checkpoint_name TEXT UNIQUE NOT NULL,
                transaction_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                description TEXT,
                backup_paths_json TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_actions_transaction ON actions(transaction_id);
            CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions(timestamp);
            CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);",
        )?;

        let backup_root = state_root.join("backups");
        std::fs::create_dir_all(&backup_root)?;

        Ok(Self {
            conn: Mutex::new(conn),
            current_transaction: Mutex::new(None),
            backup_root,
        })
    }

    /// Open a new transaction. Only one may be open at a time.
    pub fn begin(&self, user_input: &str, intent_goal: &str) -> Result<String> {
        let mut current = self.current_transaction.lock().expect("txn lock poisoned");
        if let Some(open) = current.as_ref() {
            return Err(MaestroError::TransactionInProgress { id: open.clone() });
        }

        let start_time = Utc::now().to_rfc3339();
        let id = transaction_id(&start_time, user_input);

        let conn = self.conn.lock().expect("action db poisoned");
        conn.execute(
            "INSERT INTO transactions (id, start_time, user_input, intent_goal, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                start_time,
                user_input,
                intent_goal,
                TransactionStatus::InProgress.as_str()
            ],
        )?;

        *current = Some(id.clone());
        debug!(txn = %id, "transaction opened");
        Ok(id)
    }

    /// Close a transaction. Further records against it fail.
    pub fn end(&self, transaction_id: &str, status: TransactionStatus) -> Result<()> {
        let end_time = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().expect("action db poisoned");
            conn.execute(
                "UPDATE transactions SET end_time = ?1, status = ?2 WHERE id = ?3",
                params![end_time, status.as_str(), transaction_id],
            )?;
        }

        let mut current = self.current_transaction.lock().expect("txn lock poisoned");
        if current.as_deref() == Some(transaction_id) {
            *current = None;
        }
        debug!(txn = %transaction_id, status = status.as_str(), "transaction closed");
        Ok(())
    }

    pub fn current_transaction(&self) -> Option<String> {
        self.current_transaction
            .lock()
            .expect("txn lock poisoned")
            .clone()
    }

    /// Record an executed action in the open transaction (or the synthetic
    /// `standalone` bucket when none is open). The rollback strategy is
    /// derived here, at insertion time.
    pub fn record(
        &self,
        tool: &str,
        operation: &str,
        params: &Map<String, Value>,
        result: &Value,
    ) -> Result<i64> {
        let txn_id = self
            .current_transaction()
            .unwrap_or_else(|| "standalone".to_string());

        let (possible, strategy, data) = self.derive_rollback(tool, operation, params, result, &txn_id)?;

        let timestamp = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("action db poisoned");
        conn.execute(
            "INSERT INTO actions
             (transaction_id, timestamp, tool, operation, params_json, result_json,
              rollback_possible, rollback_strategy, rollback_data_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                txn_id,
                timestamp,
                tool,
                operation,
                Value::Object(params.clone()).to_string(),
                result.to_string(),
                possible as i64,
                strategy.as_str(),
                data.as_ref().map(|d| d.to_string()),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Static decision table mapping `(tool, operation)` to an inverse.
    fn derive_rollback(
        &self,
        tool: &str,
        operation: &str,
        params: &Map<String, Value>,
        result: &Value,
        txn_id: &str,
    ) -> Result<(bool, RollbackStrategy, Option<Value>)> {
        let arg = |key: &str| params.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let derived = match (tool, operation) {
            ("FileOps", "create_file") | ("FileOps", "create_dir") => {
                (true, RollbackStrategy::Delete, arg("path").map(|p| json!({ "path": p })))
            }
            ("FileOps", "copy_file") => (
                true,
                RollbackStrategy::DeleteCopy,
                arg("dest").map(|p| json!({ "path": p })),
            ),
            ("FileOps", "move_file") => match (arg("source"), arg("dest")) {
                (Some(source), Some(dest)) => (
                    true,
                    RollbackStrategy::MoveBack,
                    Some(json!({ "from": dest, "to": source })),
                ),
                _ => (false, RollbackStrategy::Manual, None),
            },
            ("FileOps", "write_file") | ("FileOps", "delete_file") => {
                let path = arg("path");
                let backed_up = match &path {
                    Some(p) => self.checkpoint_backing(txn_id, p)?,
                    None => None,
                };
                match (path, backed_up) {
                    (Some(p), Some(checkpoint)) => (
                        true,
                        RollbackStrategy::RestoreFromCheckpoint,
                        Some(json!({ "path": p, "checkpoint": checkpoint })),
                    ),
                    (Some(p), None) => (
                        false,
                        RollbackStrategy::RestoreFromCheckpoint,
                        Some(json!({ "path": p })),
                    ),
                    (None, _) => (false, RollbackStrategy::Manual, None),
                }
            }
            ("PackageOps", "install") => (
                true,
                RollbackStrategy::Uninstall,
                arg("package").map(|p| json!({ "package": p })),
            ),
            ("PackageOps", "uninstall") => (
                true,
                RollbackStrategy::Reinstall,
                arg("package").map(|p| json!({ "package": p })),
            ),
            ("GitOps", "commit") => {
                let hash = result
                    .get("commit_hash")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match hash {
                    Some(h) => (true, RollbackStrategy::GitReset, Some(json!({ "commit": h }))),
                    None => (false, RollbackStrategy::GitReset, None),
                }
            }
            ("GitOps", "push") => (false, RollbackStrategy::NotRollbackable, None),
            ("ServiceOps", "start") => (
                true,
                RollbackStrategy::Stop,
                arg("service").map(|s| json!({ "service": s })),
            ),
            ("ServiceOps", "stop") => (
                true,
                RollbackStrategy::Start,
                arg("service").map(|s| json!({ "service": s })),
            ),
            ("ContainerOps", "run") => {
                let id = result
                    .get("container_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                match id {
                    Some(id) => (
                        true,
                        RollbackStrategy::StopAndRemove,
                        Some(json!({ "container_id": id })),
                    ),
                    None => (false, RollbackStrategy::StopAndRemove, None),
                }
            }
            _ => (false, RollbackStrategy::Manual, None),
        };

        Ok(derived)
    }

    /// Create a checkpoint backing up the given files eagerly.
    ///
    /// Names are unique; a duplicate name is an error. Requires an open
    /// transaction.
    pub fn checkpoint(&self, name: &str, description: &str, file_paths: &[PathBuf]) -> Result<()> {
        let txn_id = self.current_transaction().ok_or_else(|| {
            MaestroError::rollback("checkpoint requires an open transaction")
        })?;

        let checkpoint_dir = self.backup_root.join(name);
        std::fs::create_dir_all(&checkpoint_dir)?;

        let mut backup_paths = Map::new();
        for path in file_paths {
            if !path.exists() {
                continue;
            }
            let Some(file_name) = path.file_name() else { continue };
            let backup_path = checkpoint_dir.join(file_name);
            if std::fs::copy(path, &backup_path).is_ok() {
                backup_paths.insert(
                    path.display().to_string(),
                    Value::String(backup_path.display().to_string()),
                );
            }
        }

        let conn = self.conn.lock().expect("action db poisoned");
        conn.execute(
            "INSERT INTO checkpoints
             (checkpoint_name, transaction_id, timestamp, description, backup_paths_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                txn_id,
                Utc::now().to_rfc3339(),
                description,
                Value::Object(backup_paths).to_string(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                MaestroError::rollback(format!("checkpoint '{}' already exists", name))
            }
            other => other.into(),
        })?;

        Ok(())
    }

    /// First checkpoint in the transaction that backs up `path`, if any.
    fn checkpoint_backing(&self, txn_id: &str, path: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("action db poisoned");
        let mut stmt = conn.prepare(
            "SELECT checkpoint_name, backup_paths_json FROM checkpoints
             WHERE transaction_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![txn_id])?;

        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let backup_json: Option<String> = row.get(1)?;
            if let Some(json) = backup_json {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&json) {
                    if map.contains_key(path) {
                        return Ok(Some(name));
                    }
                }
            }
        }
        Ok(None)
    }

    pub fn get_checkpoint(&self, name: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.conn.lock().expect("action db poisoned");
        let record = conn
            .query_row(
                "SELECT checkpoint_name, transaction_id, description, backup_paths_json
                 FROM checkpoints WHERE checkpoint_name = ?1",
                params![name],
                |row| {
                    let backup_json: Option<String> = row.get(3)?;
                    Ok(CheckpointRecord {
                        name: row.get(0)?,
                        transaction_id: row.get(1)?,
                        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        backup_paths: backup_json
                            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                            .and_then(|v| v.as_object().cloned())
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Actions of a transaction in insertion order (ascending id).
    pub fn list_transaction(&self, transaction_id: &str) -> Result<Vec<ActionRecord>> {
        let conn = self.conn.lock().expect("action db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, timestamp, tool, operation, params_json,
                    result_json, rollback_possible, rollback_strategy,
                    rollback_data_json, rolled_back
             FROM actions WHERE transaction_id = ?1 ORDER BY id ASC",
        )?;

        let mut rows = stmt.query(params![transaction_id])?;
        let mut actions = Vec::new();
        while let Some(row) = rows.next()? {
            actions.push(ActionRecord {
                id: row.get(0)?,
                transaction_id: row.get(1)?,
                timestamp: row.get(2)?,
                tool: row.get(3)?,
                operation: row.get(4)?,
                params: serde_json::from_str::<Value>(&row.get::<_, String>(5)?)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default(),
                result: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(Value::Null),
                rollback_possible: row.get::<_, i64>(7)? != 0,
                rollback_strategy: RollbackStrategy::from_str(&row.get::<_, String>(8)?),
                rollback_data: row
                    .get::<_, Option<String>>(9)?
                    .and_then(|s| serde_json::from_str(&s).ok()),
                rolled_back: row.get::<_, i64>(10)? != 0,
            });
        }
        Ok(actions)
    }

    /// Most recent transactions, newest first. The synthetic standalone
    /// bucket never appears here.
    pub fn recent_transactions(&self, limit: usize) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn.lock().expect("action db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, start_time, end_time, user_input, intent_goal, status, rollback_status
             FROM transactions ORDER BY start_time DESC LIMIT ?1",
        )?;

        let mut rows = stmt.query(params![limit as i64])?;
        let mut transactions = Vec::new();
        while let Some(row) = rows.next()? {
            transactions.push(TransactionRecord {
                id: row.get(0)?,
                start_time: row.get(1)?,
                end_time: row.get(2)?,
                user_input: row.get(3)?,
                intent_goal: row.get(4)?,
                status: row.get(5)?,
                rollback_status: row.get(6)?,
            });
        }
        Ok(transactions)
    }

    pub fn mark_rolled_back(&self, action_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("action db poisoned");
        conn.execute(
            "UPDATE actions SET rolled_back = 1 WHERE id = ?1",
            params![action_id],
        )?;
        Ok(())
    }

    pub fn set_rollback_status(&self, transaction_id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().expect("action db poisoned");
        conn.execute(
            "UPDATE transactions SET rollback_status = ?1 WHERE id = ?2",
            params![status, transaction_id],
        )?;
        Ok(())
    }
}

/// 96-bit hex transaction id derived from the start time and utterance.
fn transaction_id(timestamp: &str, user_input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(user_input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..12])
}
