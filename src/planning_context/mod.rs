//! Shared Planning Context (spec §4.6): the file-claim map and the
//! cross-project learning cache that every worker and planner consults.
//!
//! Claims are soft — an out-of-band write outside a worker's declared
//! plan is permitted, just logged, the same way the reference pattern
//! store tracks statistics without ever blocking a phase from running.

pub mod provider;
pub mod sandbox;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forge_common::{AgentType, FileClaim, WorkerId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

const INSIGHTS_CACHE_CAPACITY: usize = 50;

/// Aggregate statistics for one agent type within a single project's
/// history, the unit the learning cache keeps per project per type.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentTypeStats {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_duration_secs: f64,
    pub total_iterations: u32,
    pub recurring_blockers: Vec<String>,
}

impl AgentTypeStats {
    fn record(&mut self, success: bool, duration_secs: f64, iterations: u32, blockers: &[String]) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_duration_secs += duration_secs;
        self.total_iterations += iterations;
        for blocker in blockers {
            if !self.recurring_blockers.contains(blocker) {
                self.recurring_blockers.push(blocker.clone());
            }
        }
    }

    fn sample_count(&self) -> u32 {
        self.tasks_completed + self.tasks_failed
    }

    fn success_rate(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    fn avg_duration_secs(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            0.0
        } else {
            self.total_duration_secs / total as f64
        }
    }

    fn avg_iterations(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            0.0
        } else {
            self.total_iterations as f64 / total as f64
        }
    }
}

/// Advisory answer to [`SharedPlanningContext::get_similar_task_insights`].
/// `confidence` follows the reference pattern store's scheme: it climbs
/// toward 1.0 as more samples accumulate, capping out at 5.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInsights {
    pub agent_type: AgentType,
    pub success_rate: f64,
    pub avg_duration_secs: f64,
    pub avg_iterations_per_step: f64,
    pub recurring_blockers: Vec<String>,
    pub confidence: f64,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ProjectLearning {
    by_agent_type: HashMap<AgentType, AgentTypeStats>,
}

/// Capacity-bounded, project-id-keyed cache. No crate in the reference
/// stack provides an off-the-shelf LRU, so eviction order is tracked by
/// hand with a simple most-recently-used deque.
#[derive(Debug, Default)]
struct LruLearningCache {
    capacity: usize,
    entries: HashMap<Uuid, ProjectLearning>,
    recency: VecDeque<Uuid>,
}

impl LruLearningCache {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    fn touch(&mut self, project_id: Uuid) {
        self.recency.retain(|id| *id != project_id);
        self.recency.push_back(project_id);
    }

    fn get_or_insert_mut(&mut self, project_id: Uuid) -> &mut ProjectLearning {
        if !self.entries.contains_key(&project_id) {
            if self.entries.len() >= self.capacity {
                if let Some(evicted) = self.recency.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            self.entries.insert(project_id, ProjectLearning::default());
        }
        self.touch(project_id);
        self.entries.get_mut(&project_id).expect("just inserted")
    }

    fn get(&self, project_id: Uuid) -> Option<&ProjectLearning> {
        self.entries.get(&project_id)
    }
}

/// Outcome a worker or supervisor reports back into the learning cache
/// when a task reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub success: bool,
    pub duration_secs: f64,
    pub iterations: u32,
    pub blockers: Vec<String>,
}

/// Shared, cross-worker state for a running project: the file-claim map
/// and the learning cache. One instance is created per process and
/// handed to every supervisor and worker pool.
#[derive(Clone)]
pub struct SharedPlanningContext {
    claims: Arc<RwLock<HashMap<PathBuf, FileClaim>>>,
    learning: Arc<RwLock<LruLearningCache>>,
}

impl SharedPlanningContext {
    pub fn new() -> Self {
        Self::with_capacity(INSIGHTS_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            claims: Arc::new(RwLock::new(HashMap::new())),
            learning: Arc::new(RwLock::new(LruLearningCache::with_capacity(capacity))),
        }
    }

    /// Attempt to claim `path` for `worker_id`. Returns `(true, None)` on
    /// success, or `(false, Some(existing))` if another live worker
    /// already holds it. Re-claiming a path you already hold succeeds.
    #[instrument(skip(self))]
    pub async fn try_claim(
        &self,
        path: PathBuf,
        worker_id: WorkerId,
        task_id: Uuid,
    ) -> (bool, Option<FileClaim>) {
        let mut guard = self.claims.write().await;
        if let Some(existing) = guard.get(&path) {
            if !existing.conflicts_with(&path, worker_id) {
                return (true, None);
            }
            return (false, Some(existing.clone()));
        }
        guard.insert(path.clone(), FileClaim::new(path, worker_id, task_id));
        (true, None)
    }

    /// Release every claim held by `worker_id` — called on worker exit
    /// (completion, failure, or cancellation).
    #[instrument(skip(self))]
    pub async fn release_all(&self, worker_id: WorkerId) {
        let mut guard = self.claims.write().await;
        let before = guard.len();
        guard.retain(|_, claim| claim.worker_id != worker_id);
        let released = before - guard.len();
        if released > 0 {
            info!(%worker_id, released, "released file claims");
        }
    }

    pub async fn claimed_by(&self, worker_id: WorkerId) -> Vec<FileClaim> {
        self.claims
            .read()
            .await
            .values()
            .filter(|c| c.worker_id == worker_id)
            .cloned()
            .collect()
    }

    /// Record a tool write that happened outside the worker's declared
    /// plan. Claims are soft — this is logged, not rejected, because
    /// LLM-generated plans are routinely incomplete.
    pub fn log_out_of_band_write(&self, worker_id: WorkerId, path: &std::path::Path) {
        info!(%worker_id, path = %path.display(), "out-of-band write outside declared plan");
    }

    /// Fold a completed task's outcome into the project's per-agent-type
    /// statistics.
    #[instrument(skip(self, outcome))]
    pub async fn record_task_outcome(&self, project_id: Uuid, agent_type: AgentType, outcome: TaskOutcome) {
        let mut guard = self.learning.write().await;
        let project = guard.get_or_insert_mut(project_id);
        let stats = project.by_agent_type.entry(agent_type).or_default();
        stats.record(outcome.success, outcome.duration_secs, outcome.iterations, &outcome.blockers);
    }

    /// Advisory query a planner can use to seed its reasoning for a new
    /// task. Aggregates across every project currently resident in the
    /// cache (eviction means older projects silently drop out of the
    /// answer, which is acceptable for an advisory signal). `description`
    /// is accepted for forward compatibility with a future embedding-based
    /// similarity lookup; today the match key is only `agent_type`.
    pub async fn get_similar_task_insights(
        &self,
        _description: &str,
        agent_type: AgentType,
    ) -> Option<TaskInsights> {
        let guard = self.learning.read().await;
        let mut merged = AgentTypeStats::default();
        for project in guard.entries.values() {
            if let Some(stats) = project.by_agent_type.get(&agent_type) {
                merged.tasks_completed += stats.tasks_completed;
                merged.tasks_failed += stats.tasks_failed;
                merged.total_duration_secs += stats.total_duration_secs;
                merged.total_iterations += stats.total_iterations;
                for blocker in &stats.recurring_blockers {
                    if !merged.recurring_blockers.contains(blocker) {
                        merged.recurring_blockers.push(blocker.clone());
                    }
                }
            }
        }

        let sample_count = merged.sample_count();
        if sample_count == 0 {
            return None;
        }

        Some(TaskInsights {
            agent_type,
            success_rate: merged.success_rate(),
            avg_duration_secs: merged.avg_duration_secs(),
            avg_iterations_per_step: merged.avg_iterations(),
            recurring_blockers: merged.recurring_blockers,
            confidence: (sample_count as f64 / 5.0).min(1.0),
            sample_count,
        })
    }
}

impl Default for SharedPlanningContext {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk snapshot of the context, persisted to `planning-context.json`
/// (spec §6.3) so restarts don't lose claim/learning state.
#[derive(Debug, Serialize, Deserialize)]
struct PlanningContextSnapshot {
    saved_at: DateTime<Utc>,
    claims: Vec<FileClaim>,
}

impl SharedPlanningContext {
    /// Snapshot the live claim map (the learning cache is a process-local
    /// optimization and is not persisted; it rebuilds from task history).
    pub async fn snapshot(&self) -> PlanningContextSnapshot {
        PlanningContextSnapshot {
            saved_at: Utc::now(),
            claims: self.claims.read().await.values().cloned().collect(),
        }
    }

    pub async fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let snapshot = self.snapshot().await;
        crate::util::write_json_atomic(path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerId {
        WorkerId::new()
    }

    #[tokio::test]
    async fn try_claim_succeeds_on_fresh_path() {
        let ctx = SharedPlanningContext::new();
        let (ok, existing) = ctx.try_claim(PathBuf::from("a.rs"), worker(), Uuid::new_v4()).await;
        assert!(ok);
        assert!(existing.is_none());
    }

    #[tokio::test]
    async fn try_claim_conflicts_with_a_different_live_worker() {
        let ctx = SharedPlanningContext::new();
        let w1 = worker();
        let w2 = worker();
        ctx.try_claim(PathBuf::from("a.rs"), w1, Uuid::new_v4()).await;
        let (ok, existing) = ctx.try_claim(PathBuf::from("a.rs"), w2, Uuid::new_v4()).await;
        assert!(!ok);
        assert_eq!(existing.unwrap().worker_id, w1);
    }

    #[tokio::test]
    async fn try_claim_is_idempotent_for_the_same_worker() {
        let ctx = SharedPlanningContext::new();
        let w1 = worker();
        ctx.try_claim(PathBuf::from("a.rs"), w1, Uuid::new_v4()).await;
        let (ok, existing) = ctx.try_claim(PathBuf::from("a.rs"), w1, Uuid::new_v4()).await;
        assert!(ok);
        assert!(existing.is_none());
    }

    #[tokio::test]
    async fn release_all_frees_claims_for_new_claimants() {
        let ctx = SharedPlanningContext::new();
        let w1 = worker();
        let w2 = worker();
        ctx.try_claim(PathBuf::from("a.rs"), w1, Uuid::new_v4()).await;
        ctx.release_all(w1).await;
        let (ok, _) = ctx.try_claim(PathBuf::from("a.rs"), w2, Uuid::new_v4()).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn get_similar_task_insights_is_none_with_no_history() {
        let ctx = SharedPlanningContext::new();
        assert!(ctx.get_similar_task_insights("fix bug", AgentType::Coding).await.is_none());
    }

    #[tokio::test]
    async fn get_similar_task_insights_aggregates_recorded_outcomes() {
        let ctx = SharedPlanningContext::new();
        let project = Uuid::new_v4();
        ctx.record_task_outcome(
            project,
            AgentType::Coding,
            TaskOutcome { success: true, duration_secs: 100.0, iterations: 4, blockers: vec![] },
        )
        .await;
        ctx.record_task_outcome(
            project,
            AgentType::Coding,
            TaskOutcome {
                success: false,
                duration_secs: 200.0,
                iterations: 6,
                blockers: vec!["missing fixture".into()],
            },
        )
        .await;

        let insights = ctx.get_similar_task_insights("add a feature", AgentType::Coding).await.unwrap();
        assert_eq!(insights.sample_count, 2);
        assert!((insights.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(insights.recurring_blockers, vec!["missing fixture".to_string()]);
        assert!(insights.confidence < 1.0);
    }

    #[tokio::test]
    async fn learning_cache_evicts_least_recently_touched_project() {
        let ctx = SharedPlanningContext::with_capacity(1);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        ctx.record_task_outcome(
            p1,
            AgentType::Coding,
            TaskOutcome { success: true, duration_secs: 1.0, iterations: 1, blockers: vec![] },
        )
        .await;
        ctx.record_task_outcome(
            p2,
            AgentType::Coding,
            TaskOutcome { success: true, duration_secs: 1.0, iterations: 1, blockers: vec![] },
        )
        .await;

        let guard = ctx.learning.read().await;
        assert!(!guard.entries.contains_key(&p1));
        assert!(guard.entries.contains_key(&p2));
    }

    #[tokio::test]
    async fn save_and_reload_round_trips_claims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planning-context.json");
        let ctx = SharedPlanningContext::new();
        ctx.try_claim(PathBuf::from("a.rs"), worker(), Uuid::new_v4()).await;
        ctx.save(&path).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let snapshot: PlanningContextSnapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.claims.len(), 1);
    }
}
