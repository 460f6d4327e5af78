//! Kobold worker identity, state machine, and file claims (spec §3
//! "Worker"/"FileClaim", §4.5.2, §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Newtype over a worker's id, distinguishing it from a task id at the
/// type level even though both are UUIDs on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Kobold worker's lifecycle (spec §4.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawned,
    Planning,
    Executing,
    Reflecting,
    Completed,
    Stuck,
    Failed,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match self {
            Spawned => matches!(next, Planning | Failed),
            Planning => matches!(next, Executing | Failed),
            Executing => matches!(next, Reflecting | Failed),
            // Reflecting loops back to Executing for the next step, or
            // escalates to Stuck/Completed per the reflection decision.
            Reflecting => matches!(next, Executing | Completed | Stuck | Failed),
            Stuck => matches!(next, Executing | Failed),
            Completed | Failed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Failed)
    }
}

/// A soft reservation on a file path, preventing two workers from
/// editing the same file concurrently (spec §4.6). Claims are advisory:
/// the sandbox enforces path safety, claims only enforce coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileClaim {
    pub path: PathBuf,
    pub worker_id: WorkerId,
    pub task_id: Uuid,
    pub claimed_at: DateTime<Utc>,
}

impl FileClaim {
    pub fn new(path: impl Into<PathBuf>, worker_id: WorkerId, task_id: Uuid) -> Self {
        Self {
            path: path.into(),
            worker_id,
            task_id,
            claimed_at: Utc::now(),
        }
    }

    pub fn conflicts_with(&self, path: &Path, worker_id: WorkerId) -> bool {
        self.path == path && self.worker_id != worker_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_happy_path() {
        let mut s = WorkerState::Spawned;
        for next in [
            WorkerState::Planning,
            WorkerState::Executing,
            WorkerState::Reflecting,
            WorkerState::Executing,
            WorkerState::Reflecting,
            WorkerState::Completed,
        ] {
            assert!(s.can_transition_to(next), "{s:?} -> {next:?} should be legal");
            s = next;
        }
    }

    #[test]
    fn terminal_states_have_no_way_out() {
        assert!(!WorkerState::Completed.can_transition_to(WorkerState::Executing));
        assert!(!WorkerState::Failed.can_transition_to(WorkerState::Executing));
    }

    #[test]
    fn stuck_can_recover_back_into_executing() {
        assert!(WorkerState::Stuck.can_transition_to(WorkerState::Executing));
    }

    #[test]
    fn claim_conflicts_only_for_a_different_worker_on_the_same_path() {
        let worker_a = WorkerId::new();
        let worker_b = WorkerId::new();
        let claim = FileClaim::new("src/lib.rs", worker_a, Uuid::new_v4());
        assert!(claim.conflicts_with(Path::new("src/lib.rs"), worker_b));
        assert!(!claim.conflicts_with(Path::new("src/lib.rs"), worker_a));
        assert!(!claim.conflicts_with(Path::new("src/main.rs"), worker_b));
    }
}
