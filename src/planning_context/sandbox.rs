//! Filesystem and command sandbox (spec §4.6).
//!
//! Every tool that touches the filesystem or spawns a process resolves
//! its target through this module first. Canonicalization happens
//! before the containment check so `..` components and symlinks can't
//! be used to escape the allowed set.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use forge_common::SandboxMode;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_CAPTURED_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path {path} escapes the sandbox (mode {mode:?})")]
    PathNotAllowed { path: PathBuf, mode: SandboxMode },

    #[error("path {0} does not exist and cannot be canonicalized")]
    PathDoesNotExist(PathBuf),

    #[error("command {0} timed out after {1:?}")]
    CommandTimedOut(String, Duration),

    #[error("failed to spawn command {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to overwrite existing file {0} without an explicit overwrite flag")]
    RefusingOverwrite(PathBuf),

    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A resolved set of directories a sandboxed operation may touch.
pub struct Sandbox {
    mode: SandboxMode,
    workspace_root: PathBuf,
    allowed_external_paths: Vec<PathBuf>,
}

impl Sandbox {
    pub fn new(
        mode: SandboxMode,
        workspace_root: impl Into<PathBuf>,
        allowed_external_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            mode,
            workspace_root: workspace_root.into(),
            allowed_external_paths,
        }
    }

    /// Canonicalize `path` (resolving `..` and symlinks) and check it
    /// against the active mode's permissive set. `path` may be relative
    /// to the workspace root or already absolute.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, SandboxError> {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        };

        let resolved = canonicalize_best_effort(&candidate)?;

        let allowed = match self.mode {
            SandboxMode::Workspace => self.within(&resolved, &self.workspace_root),
            SandboxMode::Relaxed => {
                self.within(&resolved, &self.workspace_root)
                    || self
                        .allowed_external_paths
                        .iter()
                        .any(|root| self.within(&resolved, root))
            }
            SandboxMode::Strict => self
                .allowed_external_paths
                .iter()
                .any(|root| self.within(&resolved, root)),
        };

        if allowed {
            Ok(resolved)
        } else {
            Err(SandboxError::PathNotAllowed { path: resolved, mode: self.mode })
        }
    }

    fn within(&self, resolved: &Path, root: &Path) -> bool {
        let root = canonicalize_best_effort(root).unwrap_or_else(|_| root.to_path_buf());
        resolved.starts_with(&root)
    }
}

/// Canonicalize what exists; for a not-yet-created file, canonicalize
/// the deepest existing ancestor and re-append the remaining components
/// so a `write_file` call to a new path still gets checked.
fn canonicalize_best_effort(path: &Path) -> Result<PathBuf, SandboxError> {
    if let Ok(canon) = path.canonicalize() {
        return Ok(canon);
    }

    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        if existing.as_os_str().is_empty() {
            return Err(SandboxError::PathDoesNotExist(path.to_path_buf()));
        }
        if let Ok(canon) = existing.canonicalize() {
            tail.reverse();
            let mut result = canon;
            for component in tail {
                result.push(component);
            }
            return Ok(result);
        }
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_owned());
                existing = existing
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
            }
            None => return Err(SandboxError::PathDoesNotExist(path.to_path_buf())),
        }
    }
}

/// Output captured from a `run_command` invocation. `exit_code` is kept
/// for observability; the sandbox contract treats output contents, not
/// exit status, as the signal callers should reason about.
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub combined_output: String,
    pub truncated: bool,
}

/// Spawn `program` with `args` directly (no shell), capped to `timeout`
/// (default 120 s), killing the process if it runs over. stdout/stderr
/// are concatenated and truncated to a safe upper bound.
pub async fn run_command(
    sandbox: &Sandbox,
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> Result<CommandOutput, SandboxError> {
    let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&sandbox.workspace_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SandboxError::SpawnFailed { command: program.to_string(), source })?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let read_output = async {
        let mut buf = Vec::new();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let _ = stdout.read_to_end(&mut out).await;
        let _ = stderr.read_to_end(&mut err).await;
        buf.extend_from_slice(&out);
        buf.extend_from_slice(&err);
        buf
    };

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|source| SandboxError::SpawnFailed { command: program.to_string(), source })?;
            let raw = read_output.await;
            Ok(truncate(raw, status.code()))
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(SandboxError::CommandTimedOut(program.to_string(), timeout))
        }
    }
}

fn truncate(raw: Vec<u8>, exit_code: Option<i32>) -> CommandOutput {
    let truncated = raw.len() > MAX_CAPTURED_OUTPUT_BYTES;
    let bytes = if truncated { &raw[..MAX_CAPTURED_OUTPUT_BYTES] } else { &raw[..] };
    CommandOutput {
        exit_code,
        combined_output: String::from_utf8_lossy(bytes).into_owned(),
        truncated,
    }
}

/// `write_file` tool contract (spec §4.6): refuses to clobber an
/// existing file unless `overwrite` is set, and creates parent
/// directories by default.
pub fn write_file(
    sandbox: &Sandbox,
    path: &Path,
    content: &str,
    create_directories: bool,
    overwrite: bool,
) -> Result<PathBuf, SandboxError> {
    let resolved = sandbox.resolve(path)?;
    if resolved.exists() && !overwrite {
        return Err(SandboxError::RefusingOverwrite(resolved));
    }
    if create_directories {
        if let Some(parent) = resolved.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    std::fs::write(&resolved, content)
        .map_err(|source| SandboxError::WriteFailed { path: resolved.clone(), source })?;
    Ok(resolved)
}
