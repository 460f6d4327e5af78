//! The reflection record a Kobold worker produces after each iteration of
//! its tool loop (spec §4.5.2), grounded on the teacher's progress/blocker
//! signal shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a worker decided to do after reflecting on its own progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Keep executing the next pending step.
    Continue,
    /// Plan is fully executed; report the task as done.
    Complete,
    /// Confidence too low or a blocker is unresolved; escalate to Stuck.
    Escalate,
}

/// A worker's self-assessment, recorded after every reflect step and
/// persisted alongside the task's progress notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub worker_id: uuid::Uuid,
    pub task_id: uuid::Uuid,
    /// `[0.0, 100.0]`, the worker's own estimate — distinct from
    /// `Plan::progress_percent`, which is derived mechanically from step
    /// statuses.
    pub progress_percent: f64,
    #[serde(default)]
    pub files_done: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    /// `[0.0, 1.0]`. Below the configured confidence floor, the
    /// scheduler treats the worker as `Stuck` regardless of `decision`
    /// (spec §4.5.3).
    pub confidence: f64,
    pub decision: Decision,
    #[serde(default)]
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Reflection {
    pub fn new(
        worker_id: uuid::Uuid,
        task_id: uuid::Uuid,
        progress_percent: f64,
        confidence: f64,
        decision: Decision,
    ) -> Self {
        Self {
            worker_id,
            task_id,
            progress_percent: progress_percent.clamp(0.0, 100.0),
            files_done: Vec::new(),
            blockers: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
            decision,
            notes: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn has_blockers(&self) -> bool {
        !self.blockers.is_empty()
    }

    /// Whether this reflection should push the worker to `Stuck`,
    /// independent of its stated `decision` (spec §4.5.3 confidence floor).
    pub fn indicates_stuck(&self, confidence_floor: f64) -> bool {
        self.decision == Decision::Escalate || self.confidence < confidence_floor || self.has_blockers()
    }
}
