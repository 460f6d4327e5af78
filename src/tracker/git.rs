//! Git-backed output-file extraction for completed tasks (spec §4.2).
//!
//! Shells out to the system `git` binary rather than linking libgit2 —
//! the tracker only ever needs a snapshot SHA and a diff summary against
//! it, both of which `git` prints on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// One file's change since a baseline SHA, including its full unified diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub diff_content: String,
}

/// Aggregate of every file touched since a baseline SHA (spec §4.2 `outputFiles`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
}

impl FileChangeSummary {
    pub fn total_files(&self) -> usize {
        self.files_added.len() + self.files_modified.len() + self.files_deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_files() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// Runs `git` against a project's workspace to recover which files a
/// worker actually touched while completing a task.
pub struct GitTracker {
    workspace_root: std::path::PathBuf,
}

impl GitTracker {
    pub fn new(workspace_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workspace_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Current `HEAD` SHA, or `None` for an unborn branch / non-repo.
    pub async fn head_sha(&self) -> Option<String> {
        self.run_git(&["rev-parse", "HEAD"]).await.ok().map(|s| s.trim().to_string())
    }

    /// Record the current tree as a baseline to diff a worker's changes
    /// against. Returns the baseline SHA (working-tree hash via
    /// `git stash create`-less snapshot: we just read HEAD, since
    /// workers commit nothing mid-task and the tracker diffs the
    /// worktree against it directly).
    pub async fn snapshot_before(&self) -> Option<String> {
        self.head_sha().await
    }

    /// Summarize files changed in the worktree relative to `before_sha`,
    /// including untracked files (spec §4.2 `outputFiles`).
    pub async fn compute_changes(&self, before_sha: &str) -> Result<FileChangeSummary> {
        let mut summary = FileChangeSummary::default();

        let status = self
            .run_git(&["diff", "--name-status", before_sha, "--"])
            .await?;
        for line in status.lines() {
            let mut parts = line.splitn(2, '\t');
            let Some(code) = parts.next() else { continue };
            let Some(path) = parts.next() else { continue };
            let path = Path::new(path).to_path_buf();
            match code.chars().next() {
                Some('A') => summary.files_added.push(path),
                Some('M') => summary.files_modified.push(path),
                Some('D') => summary.files_deleted.push(path),
                _ => {}
            }
        }

        let untracked = self
            .run_git(&["ls-files", "--others", "--exclude-standard"])
            .await?;
        for line in untracked.lines().filter(|l| !l.is_empty()) {
            summary.files_added.push(Path::new(line).to_path_buf());
        }

        let numstat = self
            .run_git(&["diff", "--numstat", before_sha, "--"])
            .await?;
        for line in numstat.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(added), Some(removed)) = (parts.next(), parts.next()) {
                summary.total_lines_added += added.parse().unwrap_or(0);
                summary.total_lines_removed += removed.parse().unwrap_or(0);
            }
        }

        Ok(summary)
    }

    /// Full unified diffs for every file that changed since `before_sha`,
    /// used to populate the worker's progress notes.
    pub async fn get_full_diffs(&self, before_sha: &str) -> Result<Vec<FileDiff>> {
        let raw = self
            .run_git(&["diff", "--unified=3", before_sha, "--"])
            .await?;
        Ok(parse_unified_diff(&raw))
    }

    /// Porcelain branch + working-tree status, for Sentinel's `git status`
    /// responses (spec §4.3 council).
    pub async fn status_porcelain(&self) -> Result<String> {
        self.run_git(&["status", "--porcelain=v1", "--branch"]).await
    }

    /// Merge `branch` into the current `HEAD` with no editor prompt.
    /// Conflicts surface as a non-zero exit, which `run_git` turns into
    /// an `Err` carrying git's own conflict message.
    pub async fn merge(&self, branch: &str) -> Result<String> {
        self.run_git(&["merge", "--no-edit", branch]).await
    }

    /// Paths the tracker should record as a task's `outputFiles`: every
    /// file touched since `before_sha`, tracked or not.
    pub async fn output_files(&self, before_sha: &str) -> Result<Vec<String>> {
        let summary = self.compute_changes(before_sha).await?;
        Ok(summary
            .files_added
            .into_iter()
            .chain(summary.files_modified)
            .map(|p| p.to_string_lossy().into_owned())
            .collect())
    }
}

/// Split a `git diff` unified-format blob into one [`FileDiff`] per file.
fn parse_unified_diff(raw: &str) -> Vec<FileDiff> {
    let mut diffs = Vec::new();
    let mut current_path: Option<std::path::PathBuf> = None;
    let mut current_type = ChangeType::Modified;
    let mut added = 0usize;
    let mut removed = 0usize;
    let mut body = String::new();

    let flush = |diffs: &mut Vec<FileDiff>,
                 path: &mut Option<std::path::PathBuf>,
                 change_type: ChangeType,
                 added: &mut usize,
                 removed: &mut usize,
                 body: &mut String| {
        if let Some(p) = path.take() {
            diffs.push(FileDiff {
                path: p,
                change_type,
                lines_added: *added,
                lines_removed: *removed,
                diff_content: std::mem::take(body),
            });
        }
        *added = 0;
        *removed = 0;
    };

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush(&mut diffs, &mut current_path, current_type, &mut added, &mut removed, &mut body);
            current_type = ChangeType::Modified;
            current_path = rest
                .split(" b/")
                .nth(1)
                .map(|p| std::path::PathBuf::from(p));
        } else if line.starts_with("new file mode") {
            current_type = ChangeType::Added;
        } else if line.starts_with("deleted file mode") {
            current_type = ChangeType::Deleted;
        } else if line.starts_with("rename to") {
            current_type = ChangeType::Renamed;
        } else {
            if let Some(stripped) = line.strip_prefix('+') {
                if !stripped.starts_with('+') || !line.starts_with("+++") {
                    added += 1;
                }
            } else if let Some(stripped) = line.strip_prefix('-') {
                if !stripped.starts_with('-') || !line.starts_with("---") {
                    removed += 1;
                }
            }
            body.push_str(line);
            body.push('\n');
        }
    }
    flush(&mut diffs, &mut current_path, current_type, &mut added, &mut removed, &mut body);

    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    async fn init_repo(dir: &Path) {
        Command::new("git").arg("init").current_dir(dir).output().await.unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "test"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    async fn commit_all(dir: &Path, msg: &str) {
        Command::new("git").args(["add", "-A"]).current_dir(dir).output().await.unwrap();
        Command::new("git")
            .args(["commit", "-m", msg])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn head_sha_is_none_before_first_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let tracker = GitTracker::new(dir.path());
        assert!(tracker.head_sha().await.is_none());
    }

    #[tokio::test]
    async fn compute_changes_detects_modified_and_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        commit_all(dir.path(), "init").await;

        let tracker = GitTracker::new(dir.path());
        let before = tracker.snapshot_before().await.unwrap();

        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();

        let summary = tracker.compute_changes(&before).await.unwrap();
        assert!(summary.files_modified.iter().any(|p| p.ends_with("a.txt")));
        assert!(summary.files_added.iter().any(|p| p.ends_with("b.txt")));
    }

    #[tokio::test]
    async fn status_porcelain_reports_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        commit_all(dir.path(), "init").await;
        std::fs::write(dir.path().join("b.txt"), "new\n").unwrap();

        let tracker = GitTracker::new(dir.path());
        let status = tracker.status_porcelain().await.unwrap();
        assert!(status.contains("b.txt"));
    }

    #[test]
    fn file_change_summary_counts_total_files() {
        let mut summary = FileChangeSummary::default();
        assert!(summary.is_empty());

        summary.files_added.push(PathBuf::from("new.rs"));
        summary.files_modified.push(PathBuf::from("old.rs"));
        assert_eq!(summary.total_files(), 2);
        assert!(!summary.is_empty());
    }

    #[tokio::test]
    async fn output_files_lists_touched_paths() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        commit_all(dir.path(), "init").await;

        let tracker = GitTracker::new(dir.path());
        let before = tracker.snapshot_before().await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();

        let files = tracker.output_files(&before).await.unwrap();
        assert_eq!(files, vec!["a.txt".to_string()]);
    }
}
