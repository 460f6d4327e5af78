//! The Project aggregate and its state machine (spec §3 "Project", §4.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Where a project sits in the Wyrm → Wyvern → Supervisor pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    New,
    WyrmAssigned,
    Analyzed,
    InProgress,
    Done,
    Failed,
}

impl<'de> Deserialize<'de> for ProjectStatus {
    /// `wyvern_assigned` is a deprecated alias for `WyrmAssigned`, kept
    /// readable so registries written before the rename still load.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "new" => ProjectStatus::New,
            "wyrm_assigned" | "wyvern_assigned" => ProjectStatus::WyrmAssigned,
            "analyzed" => ProjectStatus::Analyzed,
            "in_progress" => ProjectStatus::InProgress,
            "done" => ProjectStatus::Done,
            "failed" => ProjectStatus::Failed,
            other => {
                return Err(serde::de::Error::custom(format!("unknown project status: {other}")));
            }
        })
    }
}

impl ProjectStatus {
    /// Legal forward transitions, per spec §4.1 invariant i. `Failed` is
    /// reachable from every non-terminal status and is not listed here;
    /// callers check for it separately.
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        if next == Failed {
            return !matches!(self, Done | Failed);
        }
        matches!(
            (self, next),
            (New, WyrmAssigned)
                | (WyrmAssigned, Analyzed)
                | (Analyzed, InProgress)
                | (InProgress, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProjectStatus::Done | ProjectStatus::Failed)
    }
}

/// Runtime control state, orthogonal to `ProjectStatus` (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Paused,
    Suspended,
    Cancelled,
}

impl Default for ExecutionState {
    fn default() -> Self {
        ExecutionState::Running
    }
}

impl ExecutionState {
    /// Spec §9 Open Question #1: Suspended never auto-resumes. Only
    /// `Running` and `Paused` are toggled by the operator; `Suspended`
    /// is set by Recovery and cleared only by an explicit operator
    /// command, and `Cancelled` is a one-way door.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match self {
            Cancelled => false,
            Running => matches!(next, Paused | Suspended | Cancelled),
            Paused => matches!(next, Running | Suspended | Cancelled),
            Suspended => matches!(next, Running | Cancelled),
        }
    }
}

/// Path-safety profile applied to every tool invocation (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Writes confined to the project workspace root.
    Workspace,
    /// Writes confined to the workspace root plus an explicit allow-list.
    Relaxed,
    /// Writes confined to the workspace root; symlinks that would
    /// escape it are rejected rather than followed.
    Strict,
}

impl Default for SandboxMode {
    fn default() -> Self {
        SandboxMode::Workspace
    }
}

/// Per-project policy knobs that gate tool execution and command use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub sandbox_mode: SandboxMode,
    /// Extra paths writable under `Relaxed` mode, relative to the
    /// workspace root.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    /// Command names Kobold workers may invoke. Empty means "no
    /// restriction beyond the agent type's tool-permission mask".
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            sandbox_mode: SandboxMode::default(),
            allowed_paths: Vec::new(),
            allowed_commands: Vec::new(),
        }
    }
}

/// A codebase being built or modified under orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub workspace_root: PathBuf,
    pub status: ProjectStatus,
    #[serde(default)]
    pub execution_state: ExecutionState,
    /// Raw specification text, as most recently accepted by Wyrm/Wyvern.
    pub specification: String,
    /// Monotonic counter bumped every time `specification` changes after
    /// analysis has begun (spec §4.1 invariant ii, §9 drift policy).
    #[serde(default)]
    pub specification_version: u64,
    /// SHA-256 hex digest of `specification`, used to detect drift
    /// cheaply without diffing (spec §4.7.1 uses the same hash scheme).
    #[serde(default)]
    pub specification_hash: Option<String>,
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    /// Most recent error recorded against this project via `recordError`,
    /// independent of any per-task error state.
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, workspace_root: PathBuf, specification: impl Into<String>) -> Self {
        let now = Utc::now();
        let specification = specification.into();
        let specification_hash = Some(hash_specification(&specification));
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            workspace_root,
            status: ProjectStatus::New,
            execution_state: ExecutionState::Running,
            specification,
            specification_version: 1,
            specification_hash,
            security_policy: SecurityPolicy::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Replace the specification, bumping the version and hash. Returns
    /// whether the text actually changed (a no-op write must not bump
    /// the version, per spec §4.1 invariant ii).
    pub fn update_specification(&mut self, specification: impl Into<String>) -> bool {
        let specification = specification.into();
        let hash = hash_specification(&specification);
        if self.specification_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }
        self.specification = specification;
        self.specification_hash = Some(hash);
        self.specification_version += 1;
        self.updated_at = Utc::now();
        true
    }

    pub fn set_status(&mut self, next: ProjectStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!("illegal project status transition {:?} -> {:?}", self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_execution_state(&mut self, next: ExecutionState) -> Result<(), String> {
        if !self.execution_state.can_transition_to(next) {
            return Err(format!(
                "illegal execution state transition {:?} -> {:?}",
                self.execution_state, next
            ));
        }
        self.execution_state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn hash_specification(spec: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(spec.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        Project::new("demo", PathBuf::from("/tmp/demo"), "build a thing")
    }

    #[test]
    fn status_transitions_follow_the_pipeline() {
        let mut p = project();
        assert!(p.set_status(ProjectStatus::WyrmAssigned).is_ok());
        assert!(p.set_status(ProjectStatus::Analyzed).is_ok());
        assert!(p.set_status(ProjectStatus::InProgress).is_ok());
        assert!(p.set_status(ProjectStatus::Done).is_ok());
        assert!(p.set_status(ProjectStatus::New).is_err());
    }

    #[test]
    fn failed_reachable_from_any_non_terminal_status() {
        let mut p = project();
        assert!(p.status.can_transition_to(ProjectStatus::Failed));
        p.set_status(ProjectStatus::Done).unwrap();
        assert!(!p.status.can_transition_to(ProjectStatus::Failed));
    }

    #[test]
    fn suspended_never_auto_resumes_only_operator_can_clear_it() {
        let mut p = project();
        p.set_execution_state(ExecutionState::Suspended).unwrap();
        assert!(p.execution_state.can_transition_to(ExecutionState::Running));
        assert!(!p.execution_state.can_transition_to(ExecutionState::Paused));
    }

    #[test]
    fn cancelled_is_one_way() {
        let mut p = project();
        p.set_execution_state(ExecutionState::Cancelled).unwrap();
        assert!(p.set_execution_state(ExecutionState::Running).is_err());
    }

    #[test]
    fn deprecated_wyvern_assigned_alias_reads_as_wyrm_assigned() {
        let status: ProjectStatus = serde_json::from_str("\"wyvern_assigned\"").unwrap();
        assert_eq!(status, ProjectStatus::WyrmAssigned);
    }

    #[test]
    fn record_error_sets_last_error() {
        let mut p = project();
        assert!(p.last_error.is_none());
        p.record_error("provider timed out");
        assert_eq!(p.last_error.as_deref(), Some("provider timed out"));
    }

    #[test]
    fn specification_update_bumps_version_only_on_real_change() {
        let mut p = project();
        let v0 = p.specification_version;
        assert!(!p.update_specification("build a thing"));
        assert_eq!(p.specification_version, v0);
        assert!(p.update_specification("build a different thing"));
        assert_eq!(p.specification_version, v0 + 1);
    }
}
