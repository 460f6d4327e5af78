//! Sentinel: git status / merge operations (spec §4.3).

use crate::tracker::git::GitTracker;

pub enum SentinelReply {
    Status(String),
    MergeOk(String),
    MergeFailed(String),
}

/// Report `git status` for a project's workspace.
pub async fn status(workspace_root: &std::path::Path) -> SentinelReply {
    let tracker = GitTracker::new(workspace_root);
    match tracker.status_porcelain().await {
        Ok(output) if output.trim().lines().count() <= 1 => {
            SentinelReply::Status("working tree clean".to_string())
        }
        Ok(output) => SentinelReply::Status(output),
        Err(e) => SentinelReply::Status(format!("not a git repository or status failed: {e}")),
    }
}

/// Merge `branch` into `HEAD` inside a project's workspace.
pub async fn merge(workspace_root: &std::path::Path, branch: &str) -> SentinelReply {
    let tracker = GitTracker::new(workspace_root);
    match tracker.merge(branch).await {
        Ok(output) => SentinelReply::MergeOk(output),
        Err(e) => SentinelReply::MergeFailed(e.to_string()),
    }
}

/// Parse `/git merge <branch>` or a free-text "merge <branch>" turn into
/// the branch name, if one is present.
pub fn parse_merge_target(text: &str) -> Option<&str> {
    let lower = text.to_lowercase();
    let idx = lower.find("merge")?;
    text[idx + "merge".len()..]
        .split_whitespace()
        .find(|tok| !tok.eq_ignore_ascii_case("branch") && !tok.eq_ignore_ascii_case("into"))
}
