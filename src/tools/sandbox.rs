//! Execution sandbox
//!
//! Every tool invocation is checked here: paths must fall under the
//! allowed roots, writes into read-only roots fail, and subprocesses run
//! under a wall-clock cap with optional network isolation. Violations are
//! a distinct error kind and are never retried.

use std::path::{Component, Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use crate::core::config::SandboxConfig;
use crate::core::error::{MaestroError, Result};

/// Path and process boundary enforcement
pub struct Sandbox {
    allowed_roots: Vec<PathBuf>,
    read_only_roots: Vec<PathBuf>,
    /// Scoped extensions from temp workspaces; reverted on guard drop
    extra_roots: Mutex<Vec<PathBuf>>,
    subprocess_timeout: Duration,
    allow_network: bool,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        let mut allowed_roots = config.allowed_paths.clone();
        if allowed_roots.is_empty() {
            if let Some(home) = dirs::home_dir() {
                allowed_roots.push(home);
            }
            allowed_roots.push(std::env::temp_dir());
        }

        Self {
            allowed_roots,
            read_only_roots: config.read_only_paths.clone(),
            extra_roots: Mutex::new(Vec::new()),
            subprocess_timeout: Duration::from_secs(config.subprocess_timeout_seconds),
            allow_network: config.allow_network,
        }
    }

    /// Permissive sandbox rooted at a single directory (tests, dry runs)
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_roots: vec![root.into(), std::env::temp_dir()],
            read_only_roots: Vec::new(),
            extra_roots: Mutex::new(Vec::new()),
            subprocess_timeout: Duration::from_secs(30),
            allow_network: false,
        }
    }

    pub fn network_allowed(&self) -> bool {
        self.allow_network
    }

    /// Authorize access to a path, returning its normalized absolute form.
    ///
    /// `write` additionally rejects paths under the read-only roots.
    pub fn authorize(&self, path: &str, write: bool) -> Result<PathBuf> {
        let expanded = shellexpand::tilde(path).to_string();
        let absolute = normalize(Path::new(&expanded));

        let mut permitted = self
            .allowed_roots
            .iter()
            .any(|root| absolute.starts_with(normalize(root)));

        if !permitted {
            let extras = self.extra_roots.lock().expect("sandbox roots poisoned");
            permitted = extras.iter().any(|root| absolute.starts_with(root));
        }

        if !permitted {
            return Err(MaestroError::sandbox(format!(
                "path {} is outside the allowed roots",
                absolute.display()
            )));
        }

        if write {
            for ro in &self.read_only_roots {
                if absolute.starts_with(normalize(ro)) {
                    return Err(MaestroError::sandbox(format!(
                        "write access denied: {} is read-only",
                        absolute.display()
                    )));
                }
            }
        }

        Ok(absolute)
    }

    /// Run a subprocess under the wall-clock cap.
    ///
    /// With networking disabled the command is run inside `unshare -n`
    /// when that binary is present; otherwise the command runs as-is.
    /// Exceeding the cap is a sandbox violation, not a plain tool error.
    pub async fn run_subprocess(
        &self,
        argv: &[&str],
        cwd: Option<&Path>,
        envs: &[(&str, &str)],
    ) -> Result<Output> {
        if argv.is_empty() {
            return Err(MaestroError::internal("sandbox", "empty argv"));
        }

        if let Some(dir) = cwd {
            self.authorize(&dir.to_string_lossy(), false)?;
        }

        // -r maps the caller to root inside a user namespace so network
        // isolation works unprivileged.
        let isolated: Vec<String> = if !self.allow_network && which("unshare") {
            let mut v = ["unshare", "-r", "-n", "--"]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>();
            v.extend(argv.iter().map(|s| s.to_string()));
            v
        } else {
            argv.iter().map(|s| s.to_string()).collect()
        };

        debug!(command = %isolated.join(" "), "sandbox subprocess");

        let mut cmd = Command::new(&isolated[0]);
        cmd.args(&isolated[1..]).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in envs {
            cmd.env(k, v);
        }

        match tokio::time::timeout(self.subprocess_timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                MaestroError::tool(
                    "sandbox",
                    "subprocess",
                    format!("failed to spawn {}: {}", isolated[0], e),
                )
            }),
            Err(_) => Err(MaestroError::sandbox(format!(
                "command exceeded time limit: {}s",
                self.subprocess_timeout.as_secs()
            ))),
        }
    }

    /// Acquire a scoped temporary workspace.
    ///
    /// The workspace directory is added to the allowed roots for the
    /// lifetime of the guard and removed again on drop, even when the
    /// caller's operation fails. The directory itself is deleted with the
    /// guard.
    pub fn temp_workspace(&self) -> Result<TempWorkspace<'_>> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("maestro-{}-", uuid::Uuid::new_v4().simple()))
            .tempdir()
            .map_err(|e| MaestroError::internal("sandbox", format!("temp workspace: {}", e)))?;

        let path = normalize(dir.path());
        self.extra_roots
            .lock()
            .expect("sandbox roots poisoned")
            .push(path.clone());

        Ok(TempWorkspace {
            sandbox: self,
            dir,
            path,
        })
    }

    fn release_root(&self, path: &Path) {
        let mut extras = self.extra_roots.lock().expect("sandbox roots poisoned");
        extras.retain(|p| p != path);
    }
}

/// Scoped workspace guard; see [`Sandbox::temp_workspace`]
pub struct TempWorkspace<'a> {
    sandbox: &'a Sandbox,
    dir: TempDir,
    path: PathBuf,
}

impl TempWorkspace<'_> {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for TempWorkspace<'_> {
    fn drop(&mut self) {
        self.sandbox.release_root(&self.path);
    }
}

/// Lexical normalization: expand relative paths against cwd and resolve
/// `.`/`..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn which(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
        })
        .unwrap_or(false)
}
