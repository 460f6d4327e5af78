//! The scheduling unit (spec §3 "Task").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent_type::AgentType;

/// Where a task sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unassigned,
    Assigned,
    Working,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Scheduling priority. `Ord` follows declaration order so that
/// `Critical > High > Normal > Low` under a descending sort, matching
/// spec §4.5.1 step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// How a failed task's error has been classified (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Unknown,
}

/// A single scheduling unit within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub description: String,
    pub area: String,
    pub agent_type: AgentType,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Ordered list of task ids this task requires to be `Done`.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Specification version captured at creation time; never changes
    /// after (spec §4.2 invariant i).
    pub specification_version: u64,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub last_error_message: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        project_id: Uuid,
        description: impl Into<String>,
        area: impl Into<String>,
        agent_type: AgentType,
        specification_version: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            description: description.into(),
            area: area.into(),
            agent_type,
            status: TaskStatus::Unassigned,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            specification_version,
            output_files: Vec::new(),
            retry_count: 0,
            last_error_category: None,
            last_error_message: None,
            next_retry_at: None,
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Whether this task is eligible for the ready set, given the set of
    /// task ids the tracker already knows to be `Done` and the current
    /// instant (for `next_retry_at` gating). Spec §4.2 `listReady`.
    pub fn is_ready(&self, done: &std::collections::HashSet<Uuid>, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Unassigned {
            return false;
        }
        if !self.dependencies.iter().all(|d| done.contains(d)) {
            return false;
        }
        match self.next_retry_at {
            Some(t) => t <= now,
            None => true,
        }
    }

    /// Reset a `Done` task back to `Unassigned`, clearing retry state.
    /// The only legal way `status = Done` moves backwards (spec §4.2
    /// invariant iii).
    pub fn retry_from_done(&mut self) {
        self.status = TaskStatus::Unassigned;
        self.retry_count = 0;
        self.last_error_category = None;
        self.last_error_message = None;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, category: ErrorCategory, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.last_error_category = Some(category);
        self.last_error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_done(&mut self, output_files: Vec<String>) {
        self.status = TaskStatus::Done;
        self.output_files = output_files;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn task() -> Task {
        Task::new(Uuid::new_v4(), "do the thing", "backend", AgentType::Coding, 1)
    }

    #[test]
    fn priority_ord_matches_spec_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn ready_requires_unassigned_and_deps_done() {
        let dep_id = Uuid::new_v4();
        let mut t = task().with_dependencies(vec![dep_id]);
        let now = Utc::now();
        assert!(!t.is_ready(&HashSet::new(), now));

        let mut done = HashSet::new();
        done.insert(dep_id);
        assert!(t.is_ready(&done, now));

        t.status = TaskStatus::Working;
        assert!(!t.is_ready(&done, now));
    }

    #[test]
    fn ready_respects_next_retry_at() {
        let mut t = task();
        t.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!t.is_ready(&HashSet::new(), Utc::now()));
        t.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(t.is_ready(&HashSet::new(), Utc::now()));
    }

    #[test]
    fn retry_from_done_resets_state() {
        let mut t = task();
        t.mark_done(vec!["a.rs".into()]);
        t.retry_count = 3;
        t.retry_from_done();
        assert_eq!(t.status, TaskStatus::Unassigned);
        assert_eq!(t.retry_count, 0);
        assert!(t.last_error_category.is_none());
    }

    #[test]
    fn output_files_only_set_on_done() {
        let t = task();
        assert!(t.output_files.is_empty());
    }
}
