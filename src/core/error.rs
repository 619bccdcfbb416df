//! Unified error handling for Maestro
//!
//! A single error type covering every failure mode in the pipeline, from
//! configuration loading through translation, execution, and rollback.
//! Component boundaries return `Result<T>`; internal helpers may use
//! `anyhow` but never leak it past the orchestrator.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for all Maestro operations
#[derive(Error, Debug)]
pub enum MaestroError {
    // Configuration errors
    /// Invalid configuration format or value
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// Configuration directory creation failed
    #[error("Failed to create state directory: {path}")]
    StateDirCreation { path: PathBuf },

    // Translation and schema errors
    /// Oracle output failed to parse or validate as an Intent
    #[error("Schema error: {message}")]
    Schema { message: String },

    /// Oracle unreachable or repeatedly invalid
    #[error("Translation failed: {message}")]
    Translation { message: String },

    /// Oracle reflection output could not be interpreted
    #[error("Reflection failed: {message}")]
    Reflection { message: String },

    // Tool and execution errors
    /// A tool operation failed during execution
    #[error("{tool}.{operation} failed: {message}")]
    Tool {
        tool: String,
        operation: String,
        message: String,
    },

    /// Unknown (tool, action) pair
    #[error("Unknown tool operation: {tool}.{operation}")]
    UnknownTool { tool: String, operation: String },

    /// Step exceeded its deadline
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Execution was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,

    // Sandbox errors
    /// Sandbox boundary breached; never retried
    #[error("Sandbox violation: {message}")]
    SandboxViolation { message: String },

    // Transaction and rollback errors
    /// A transaction is already open on this orchestrator
    #[error("Transaction {id} is already in progress")]
    TransactionInProgress { id: String },

    /// Rollback could not proceed or an inverse failed
    #[error("Rollback failed: {message}")]
    Rollback { message: String },

    // Database errors
    /// Embedded store query failed
    #[error("Database error: {message}")]
    Database { message: String },

    // Oracle transport errors
    /// HTTP request to an oracle backend failed
    #[error("Oracle request failed: {message}")]
    OracleTransport { message: String },

    // User-driven outcomes
    /// User refused a confirmation or stopped an iteration
    #[error("Aborted by user: {reason}")]
    UserAbort { reason: String },

    /// Iterative loop hit the absolute iteration cap
    #[error("Maximum iterations reached ({limit})")]
    MaxIterations { limit: u32 },

    // Generic errors with context
    /// Internal error with context
    #[error("Internal error in {context}: {message}")]
    Internal { context: String, message: String },
}

impl MaestroError {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    pub fn tool(
        tool: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool: tool.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::SandboxViolation {
            message: message.into(),
        }
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Self::Rollback {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn user_abort(reason: impl Into<String>) -> Self {
        Self::UserAbort {
            reason: reason.into(),
        }
    }

    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Process exit code for the CLI surface.
    ///
    /// Cancellation is a user-initiated clean abort, so it shares the
    /// `UserAbort` code rather than looking like an execution failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Schema { .. } | Self::Translation { .. } => 2,
            Self::SandboxViolation { .. } => 3,
            Self::UserAbort { .. } | Self::Cancelled => 4,
            Self::MaxIterations { .. } => 5,
            _ => 1,
        }
    }

    /// Whether the adaptive planner may retry this error at all.
    ///
    /// Sandbox violations and schema problems are never retried; the
    /// per-category retry policy for tool errors lives in the failure
    /// analyzer.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::SandboxViolation { .. }
                | Self::Schema { .. }
                | Self::UnknownTool { .. }
                | Self::TransactionInProgress { .. }
                | Self::UserAbort { .. }
                | Self::Cancelled
        )
    }

    /// Error category for logging and metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigInvalid { .. } | Self::StateDirCreation { .. } => {
                ErrorCategory::Configuration
            }
            Self::Schema { .. } | Self::Translation { .. } | Self::Reflection { .. } => {
                ErrorCategory::Translation
            }
            Self::Tool { .. } | Self::UnknownTool { .. } | Self::Timeout { .. } => {
                ErrorCategory::Execution
            }
            Self::SandboxViolation { .. } => ErrorCategory::Sandbox,
            Self::TransactionInProgress { .. } | Self::Rollback { .. } => ErrorCategory::Rollback,
            Self::Database { .. } => ErrorCategory::Database,
            Self::OracleTransport { .. } => ErrorCategory::Oracle,
            Self::UserAbort { .. } | Self::MaxIterations { .. } | Self::Cancelled => {
                ErrorCategory::User
            }
            Self::Internal { .. } => ErrorCategory::System,
        }
    }
}

/// Error category for metrics and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Translation,
    Execution,
    Sandbox,
    Rollback,
    Database,
    Oracle,
    User,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Translation => write!(f, "translation"),
            Self::Execution => write!(f, "execution"),
            Self::Sandbox => write!(f, "sandbox"),
            Self::Rollback => write!(f, "rollback"),
            Self::Database => write!(f, "database"),
            Self::Oracle => write!(f, "oracle"),
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
        }
    }
}

impl From<io::Error> for MaestroError {
    fn from(err: io::Error) -> Self {
        Self::Internal {
            context: "io".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MaestroError {
    fn from(err: serde_json::Error) -> Self {
        Self::Schema {
            message: format!("JSON parsing error: {}", err),
        }
    }
}

impl From<toml::de::Error> for MaestroError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigInvalid {
            message: format!("TOML parsing error: {}", err),
        }
    }
}

impl From<rusqlite::Error> for MaestroError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for MaestroError {
    fn from(err: reqwest::Error) -> Self {
        Self::OracleTransport {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for MaestroError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal {
            context: "task".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for MaestroError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            context: "anyhow".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Maestro operations
pub type Result<T> = std::result::Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MaestroError::translation("x").exit_code(), 2);
        assert_eq!(MaestroError::sandbox("x").exit_code(), 3);
        assert_eq!(MaestroError::user_abort("x").exit_code(), 4);
        assert_eq!(MaestroError::Cancelled.exit_code(), 4);
        assert_eq!(MaestroError::MaxIterations { limit: 50 }.exit_code(), 5);
        assert_eq!(MaestroError::tool("FileOps", "scan", "x").exit_code(), 1);
    }

    #[test]
    fn test_sandbox_violations_never_retryable() {
        assert!(!MaestroError::sandbox("escape attempt").is_retryable());
        assert!(MaestroError::tool("NetworkOps", "fetch", "connection refused").is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            MaestroError::schema("bad").category(),
            ErrorCategory::Translation
        );
        assert_eq!(
            MaestroError::rollback("bad").category(),
            ErrorCategory::Rollback
        );
    }
}
