//! Tool registry
//!
//! Maps `(tool, action)` pairs to operations carrying an argument schema,
//! a side-effect class, an expected runtime class, and an invoke function.
//! The side-effect class drives sandbox checks and the dependency
//! analyzer's conflict rules; unknown pairs surface as `UnknownTool`.

pub mod sandbox;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::error::{MaestroError, Result};

pub use sandbox::{Sandbox, TempWorkspace};

/// What an operation does to the world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideEffect {
    ReadOnly,
    Create,
    Overwrite,
    Delete,
    Control,
}

/// Expected runtime class, used for scheduling hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeClass {
    Fast,
    Io,
    Slow,
}

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;
type Handler = for<'a> fn(&'a Map<String, Value>, &'a Sandbox) -> HandlerFuture<'a>;

/// One registered operation
pub struct ToolOperation {
    pub tool: &'static str,
    pub action: &'static str,
    required: &'static [&'static str],
    pub side_effect: SideEffect,
    pub runtime: RuntimeClass,
    handler: Handler,
}

impl ToolOperation {
    pub fn required_args(&self) -> &'static [&'static str] {
        self.required
    }

    pub async fn invoke(&self, args: &Map<String, Value>, sandbox: &Sandbox) -> Result<Value> {
        debug!(tool = self.tool, action = self.action, "invoking operation");
        (self.handler)(args, sandbox).await
    }
}

/// Registry of all known operations
pub struct ToolRegistry {
    ops: HashMap<(&'static str, &'static str), ToolOperation>,
}

impl ToolRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            ops: HashMap::new(),
        };
        for op in builtin_operations() {
            registry.ops.insert((op.tool, op.action), op);
        }
        registry
    }

    pub fn lookup(&self, tool: &str, action: &str) -> Option<&ToolOperation> {
        self.ops
            .iter()
            .find(|((t, a), _)| *t == tool && *a == action)
            .map(|(_, op)| op)
    }

    pub async fn invoke(
        &self,
        tool: &str,
        action: &str,
        args: &Map<String, Value>,
        sandbox: &Sandbox,
    ) -> Result<Value> {
        let op = self.lookup(tool, action).ok_or_else(|| MaestroError::UnknownTool {
            tool: tool.to_string(),
            operation: action.to_string(),
        })?;
        op.invoke(args, sandbox).await
    }

    pub fn operations(&self) -> impl Iterator<Item = &ToolOperation> {
        self.ops.values()
    }
}

fn op(
    tool: &'static str,
    action: &'static str,
    required: &'static [&'static str],
    side_effect: SideEffect,
    runtime: RuntimeClass,
    handler: Handler,
) -> ToolOperation {
    ToolOperation {
        tool,
        action,
        required,
        side_effect,
        runtime,
        handler,
    }
}

fn builtin_operations() -> Vec<ToolOperation> {
    use RuntimeClass::*;
    use SideEffect::*;

    vec![
        // FileOps
        op("FileOps", "scan", &["path"], ReadOnly, Io, file_scan),
        op("FileOps", "read_file", &["path"], ReadOnly, Io, file_read),
        op("FileOps", "create_file", &["path"], Create, Io, file_create),
        op(
            "FileOps",
            "write_file",
            &["path", "content"],
            Overwrite,
            Io,
            file_write,
        ),
        op("FileOps", "delete_file", &["path"], Delete, Io, file_delete),
        op(
            "FileOps",
            "move_file",
            &["source", "dest"],
            Create,
            Io,
            file_move,
        ),
        op(
            "FileOps",
            "copy_file",
            &["source", "dest"],
            Create,
            Io,
            file_copy,
        ),
        op("FileOps", "create_dir", &["path"], Create, Io, dir_create),
        // ProcessOps
        op("ProcessOps", "run", &["command"], Control, Slow, process_run),
        op("ProcessOps", "list", &[], ReadOnly, Fast, process_list),
        // PackageOps
        op(
            "PackageOps",
            "install",
            &["package"],
            Control,
            Slow,
            package_install,
        ),
        op(
            "PackageOps",
            "uninstall",
            &["package"],
            Control,
            Slow,
            package_uninstall,
        ),
        // GitOps
        op("GitOps", "status", &[], ReadOnly, Fast, git_status),
        op("GitOps", "commit", &["message"], Create, Fast, git_commit),
        op("GitOps", "push", &[], Control, Io, git_push),
        // ServiceOps
        op(
            "ServiceOps",
            "start",
            &["service"],
            Control,
            Io,
            service_start,
        ),
        op("ServiceOps", "stop", &["service"], Control, Io, service_stop),
        // ContainerOps
        op(
            "ContainerOps",
            "run",
            &["image"],
            Control,
            Slow,
            container_run,
        ),
        op(
            "ContainerOps",
            "stop",
            &["container_id"],
            Control,
            Io,
            container_stop,
        ),
        // NetworkOps
        op("NetworkOps", "fetch", &["url"], ReadOnly, Io, network_fetch),
    ]
}

fn require<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| MaestroError::schema(format!("missing string argument '{}'", key)))
}

/// Turn a subprocess output into a tool result, surfacing nonzero exits
/// as tool errors so the failure analyzer can categorize stderr text.
fn subprocess_value(tool: &str, operation: &str, output: std::process::Output) -> Result<Value> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

    if output.status.success() {
        Ok(json!({ "stdout": stdout, "status": 0 }))
    } else {
        let message = if stderr.is_empty() { stdout } else { stderr };
        Err(MaestroError::tool(tool, operation, message))
    }
}

// --- FileOps handlers ---

fn file_scan<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let path = sandbox.authorize(require(args, "path")?, false)?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "scan", e.to_string()))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| MaestroError::tool("FileOps", "scan", e.to_string()))?
        {
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok(json!({ "path": path.display().to_string(), "entries": entries }))
    })
}

fn file_read<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let path = sandbox.authorize(require(args, "path")?, false)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "read_file", e.to_string()))?;
        Ok(json!({ "path": path.display().to_string(), "content": content }))
    })
}

fn file_create<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let path = sandbox.authorize(require(args, "path")?, true)?;
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MaestroError::tool("FileOps", "create_file", e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "create_file", e.to_string()))?;
        Ok(json!({ "created": path.display().to_string() }))
    })
}

fn file_write<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let path = sandbox.authorize(require(args, "path")?, true)?;
        let content = require(args, "content")?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "write_file", e.to_string()))?;
        Ok(json!({ "written": path.display().to_string(), "bytes": content.len() }))
    })
}

fn file_delete<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let path = sandbox.authorize(require(args, "path")?, true)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "delete_file", e.to_string()))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| MaestroError::tool("FileOps", "delete_file", e.to_string()))?;
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| MaestroError::tool("FileOps", "delete_file", e.to_string()))?;
        }
        Ok(json!({ "deleted": path.display().to_string() }))
    })
}

fn file_move<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let source = sandbox.authorize(require(args, "source")?, true)?;
        let dest = sandbox.authorize(require(args, "dest")?, true)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MaestroError::tool("FileOps", "move_file", e.to_string()))?;
        }
        tokio::fs::rename(&source, &dest)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "move_file", e.to_string()))?;
        Ok(json!({
            "moved": source.display().to_string(),
            "to": dest.display().to_string()
        }))
    })
}

fn file_copy<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let source = sandbox.authorize(require(args, "source")?, false)?;
        let dest = sandbox.authorize(require(args, "dest")?, true)?;
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "copy_file", e.to_string()))?;
        Ok(json!({
            "copied": source.display().to_string(),
            "to": dest.display().to_string()
        }))
    })
}

fn dir_create<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let path = sandbox.authorize(require(args, "path")?, true)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| MaestroError::tool("FileOps", "create_dir", e.to_string()))?;
        Ok(json!({ "created": path.display().to_string() }))
    })
}

// --- ProcessOps handlers ---

fn process_run<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let command = require(args, "command")?;
        let output = sandbox
            .run_subprocess(&["sh", "-c", command], None, &[])
            .await?;
        subprocess_value("ProcessOps", "run", output)
    })
}

fn process_list<'a>(_args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let output = sandbox.run_subprocess(&["ps", "aux"], None, &[]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let count = text.lines().count().saturating_sub(1);
        Ok(json!({ "process_count": count }))
    })
}

// --- PackageOps handlers ---

fn detect_package_manager() -> Option<&'static str> {
    for pm in ["apt", "dnf", "pacman", "brew"] {
        if std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|d| d.join(pm).is_file()))
            .unwrap_or(false)
        {
            return Some(pm);
        }
    }
    None
}

fn package_command(pm: &str, install: bool, package: &str) -> Vec<String> {
    let parts: Vec<&str> = match (pm, install) {
        ("apt", true) => vec!["apt", "install", "-y", package],
        ("apt", false) => vec!["apt", "remove", "-y", package],
        ("dnf", true) => vec!["dnf", "install", "-y", package],
        ("dnf", false) => vec!["dnf", "remove", "-y", package],
        ("pacman", true) => vec!["pacman", "-S", "--noconfirm", package],
        ("pacman", false) => vec!["pacman", "-R", "--noconfirm", package],
        ("brew", true) => vec!["brew", "install", package],
        ("brew", false) => vec!["brew", "uninstall", package],
        _ => vec![],
    };
    parts.into_iter().map(|s| s.to_string()).collect()
}

fn package_install<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move { package_op(args, sandbox, true).await })
}

fn package_uninstall<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move { package_op(args, sandbox, false).await })
}

async fn package_op(args: &Map<String, Value>, sandbox: &Sandbox, install: bool) -> Result<Value> {
    let operation = if install { "install" } else { "uninstall" };
    let package = require(args, "package")?;
    let pm = detect_package_manager().ok_or_else(|| {
        MaestroError::tool("PackageOps", operation, "command not found: no package manager")
    })?;

    let argv = package_command(pm, install, package);
    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let output = sandbox.run_subprocess(&argv_refs, None, &[]).await?;
    subprocess_value("PackageOps", operation, output)
}

// --- GitOps handlers ---

fn git_status<'a>(_args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let output = sandbox
            .run_subprocess(&["git", "status", "--porcelain"], None, &[])
            .await?;
        subprocess_value("GitOps", "status", output)
    })
}

fn git_commit<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let message = require(args, "message")?;
        let output = sandbox
            .run_subprocess(&["git", "commit", "-am", message], None, &[])
            .await?;
        subprocess_value("GitOps", "commit", output)?;

        let head = sandbox
            .run_subprocess(&["git", "rev-parse", "HEAD"], None, &[])
            .await?;
        let hash = String::from_utf8_lossy(&head.stdout).trim().to_string();
        Ok(json!({ "commit_hash": hash }))
    })
}

fn git_push<'a>(_args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let output = sandbox.run_subprocess(&["git", "push"], None, &[]).await?;
        subprocess_value("GitOps", "push", output)
    })
}

// --- ServiceOps handlers ---

fn service_start<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let service = require(args, "service")?;
        let output = sandbox
            .run_subprocess(&["systemctl", "start", service], None, &[])
            .await?;
        subprocess_value("ServiceOps", "start", output)
    })
}

fn service_stop<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let service = require(args, "service")?;
        let output = sandbox
            .run_subprocess(&["systemctl", "stop", service], None, &[])
            .await?;
        subprocess_value("ServiceOps", "stop", output)
    })
}

// --- ContainerOps handlers ---

fn container_run<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let image = require(args, "image")?;
        let output = sandbox
            .run_subprocess(&["docker", "run", "-d", image], None, &[])
            .await?;
        let value = subprocess_value("ContainerOps", "run", output)?;
        let container_id = value
            .get("stdout")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(json!({ "container_id": container_id }))
    })
}

fn container_stop<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        let id = require(args, "container_id")?;
        let output = sandbox
            .run_subprocess(&["docker", "stop", id], None, &[])
            .await?;
        subprocess_value("ContainerOps", "stop", output)
    })
}

// --- NetworkOps handlers ---

fn network_fetch<'a>(args: &'a Map<String, Value>, sandbox: &'a Sandbox) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !sandbox.network_allowed() {
            return Err(MaestroError::sandbox("network access is disabled"));
        }
        let url = require(args, "url")?;
        let response = reqwest::get(url)
            .await
            .map_err(|e| MaestroError::tool("NetworkOps", "fetch", format!("network error: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| MaestroError::tool("NetworkOps", "fetch", e.to_string()))?;
        let truncated: String = body.chars().take(2000).collect();
        Ok(json!({ "status": status, "body": truncated }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.lookup("FileOps", "scan").is_some());
        assert!(registry.lookup("FileOps", "move_file").is_some());
        assert!(registry.lookup("GitOps", "push").is_some());
        assert!(registry.lookup("FileOps", "teleport").is_none());
    }

    #[test]
    fn test_side_effect_classes() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(
            registry.lookup("FileOps", "scan").unwrap().side_effect,
            SideEffect::ReadOnly
        );
        assert_eq!(
            registry.lookup("FileOps", "write_file").unwrap().side_effect,
            SideEffect::Overwrite
        );
        assert_eq!(
            registry.lookup("FileOps", "delete_file").unwrap().side_effect,
            SideEffect::Delete
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_surfaces() {
        let registry = ToolRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::rooted_at(dir.path());
        let err = registry
            .invoke("VisionOps", "describe", &Map::new(), &sandbox)
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let registry = ToolRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::rooted_at(dir.path());

        let file = dir.path().join("a.txt");
        let mut args = Map::new();
        args.insert("path".into(), Value::String(file.display().to_string()));
        args.insert("content".into(), Value::String("hello".into()));

        registry
            .invoke("FileOps", "create_file", &args, &sandbox)
            .await
            .unwrap();
        assert!(file.exists());

        let mut scan_args = Map::new();
        scan_args.insert(
            "path".into(),
            Value::String(dir.path().display().to_string()),
        );
        let listing = registry
            .invoke("FileOps", "scan", &scan_args, &sandbox)
            .await
            .unwrap();
        let entries = listing.get("entries").unwrap().as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], "a.txt");

        registry
            .invoke("FileOps", "delete_file", &args, &sandbox)
            .await
            .unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_move_between_dirs() {
        let registry = ToolRegistry::with_builtins();
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::rooted_at(dir.path());

        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload").unwrap();
        let dest = dir.path().join("sub/dest.txt");

        let mut args = Map::new();
        args.insert("source".into(), Value::String(src.display().to_string()));
        args.insert("dest".into(), Value::String(dest.display().to_string()));

        registry
            .invoke("FileOps", "move_file", &args, &sandbox)
            .await
            .unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload");
    }
}
