//! A worker's implementation plan and its steps (spec §3 "Plan", §4.5.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a single implementation step sits in its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }
}

/// One concrete action a Kobold worker intends to take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationStep {
    pub ordinal: u32,
    pub description: String,
    pub status: StepStatus,
    /// File paths this step expects to touch; used to populate file
    /// claims before execution begins (spec §4.6).
    #[serde(default)]
    pub target_files: Vec<String>,
}

impl ImplementationStep {
    pub fn new(ordinal: u32, description: impl Into<String>) -> Self {
        Self {
            ordinal,
            description: description.into(),
            status: StepStatus::Pending,
            target_files: Vec::new(),
        }
    }

    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }
}

/// The ordered plan a worker drafts during its Planning phase and
/// executes during Executing (spec §4.5.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: uuid::Uuid,
    pub steps: Vec<ImplementationStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(task_id: uuid::Uuid, steps: Vec<ImplementationStep>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            steps,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction of non-skipped steps that are `Done`, in `[0.0, 100.0]`.
    /// Mirrors the `progressPercent` a worker reports in its reflection
    /// (spec §4.5.2).
    pub fn progress_percent(&self) -> f64 {
        let counted: Vec<&ImplementationStep> = self
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Skipped)
            .collect();
        if counted.is_empty() {
            return 100.0;
        }
        let done = counted.iter().filter(|s| s.status == StepStatus::Done).count();
        (done as f64 / counted.len() as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn next_pending(&mut self) -> Option<&mut ImplementationStep> {
        self.steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Pending)
            .min_by_key(|s| s.ordinal)
    }

    pub fn all_target_files(&self) -> Vec<String> {
        self.steps.iter().flat_map(|s| s.target_files.clone()).collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
