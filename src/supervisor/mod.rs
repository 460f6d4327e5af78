//! The Supervisor — Drake's scheduling loop and worker lifecycle tracking
//! (spec §4.5). Two periodic ticks: `run_scheduling_tick` hands ready tasks
//! to Kobold workers bounded by per-agent-type parallelism, and
//! `run_stuck_monitor_tick` watches live workers for the stall signals in
//! §4.5.4 (folding in the reasoning monitor of §4.5.5), aborting and
//! requeuing whichever ones trip them. Mirrors the reference DAG
//! executor's semaphore-gated spawn + `mpsc`-channel result reporting
//! shape, adapted from phases to tasks.

pub mod kobold;
pub mod plan_store;
pub mod tools;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forge_common::{AgentType, Plan, Reflection, Task, WorkerId, WorkerState};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::planning_context::provider::Provider;
use crate::planning_context::sandbox::Sandbox;
use crate::planning_context::{SharedPlanningContext, TaskOutcome};
use crate::recovery::CircuitBreaker;
use crate::registry::ProjectRegistry;
use crate::tracker::TaskTracker;
use kobold::{KoboldConfig, KoboldContext, PlanPersistence, WorkerEvent, WorkerOutcome};
use plan_store::PlanStore;

const REFLECTION_HISTORY_CAPACITY: usize = 8;

/// Tunables for scheduling and stuck-worker detection (spec §4.5.1, §4.5.4).
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Max concurrently running Kobold workers per (project, agent type).
    pub max_parallel_per_agent_type: usize,
    /// A worker with no heartbeat for this long is considered stuck.
    pub heartbeat_timeout: ChronoDuration,
    /// Repeated writes to the same path at or beyond this count are stuck.
    pub max_repeated_file_writes: u32,
    /// Consecutive reflections with unchanged `progress_percent` before
    /// the worker is declared stalled.
    pub stalled_reflection_window: usize,
    /// Confidence drop across `stalled_reflection_window` checkpoints
    /// that flags degrading reasoning (spec §4.5.5), on the [0.0,1.0] scale.
    pub confidence_drop_threshold: f64,
    /// A single reflection naming this many blockers escalates immediately.
    pub max_blockers_per_reflection: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_parallel_per_agent_type: 3,
            heartbeat_timeout: ChronoDuration::minutes(30),
            max_repeated_file_writes: 5,
            stalled_reflection_window: 3,
            confidence_drop_threshold: 0.20,
            max_blockers_per_reflection: 3,
        }
    }
}

/// Per-active-worker bookkeeping the stuck monitor and scheduler both
/// consult.
struct WorkerTracking {
    task_id: Uuid,
    project_id: Uuid,
    agent_type: AgentType,
    state: WorkerState,
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    reflections: VecDeque<Reflection>,
    file_write_counts: HashMap<PathBuf, u32>,
    handle: JoinHandle<()>,
}

impl WorkerTracking {
    fn record_event(&mut self, event: WorkerEvent) {
        self.last_heartbeat = Utc::now();
        match event {
            WorkerEvent::Heartbeat => {}
            WorkerEvent::Reflected(reflection) => {
                self.state = WorkerState::Reflecting;
                if self.reflections.len() >= REFLECTION_HISTORY_CAPACITY {
                    self.reflections.pop_front();
                }
                self.reflections.push_back(reflection);
            }
            WorkerEvent::FileWritten(path) => {
                *self.file_write_counts.entry(path).or_insert(0) += 1;
            }
        }
    }

    /// spec §4.5.4 stuck signals, folding in the §4.5.5 reasoning monitor:
    /// heartbeat timeout, repeated writes, a flat-progress window,
    /// a confidence drop across that same window, or a reflection that
    /// already says so on its own terms.
    fn is_stuck(&self, config: &SupervisorConfig, confidence_floor: f64, now: DateTime<Utc>) -> Option<&'static str> {
        if now - self.last_heartbeat >= config.heartbeat_timeout {
            return Some("heartbeat timeout");
        }
        if self.file_write_counts.values().any(|&n| n >= config.max_repeated_file_writes) {
            return Some("repeated writes to the same file");
        }
        if let Some(latest) = self.reflections.back() {
            if latest.blockers.len() >= config.max_blockers_per_reflection {
                return Some("too many blockers in one reflection");
            }
            if latest.indicates_stuck(confidence_floor) {
                return Some("reflection indicates stuck");
            }
        }
        if self.reflections.len() >= config.stalled_reflection_window {
            let window: Vec<&Reflection> =
                self.reflections.iter().rev().take(config.stalled_reflection_window).collect();
            let flat_progress = window.windows(2).all(|w| (w[0].progress_percent - w[1].progress_percent).abs() < f64::EPSILON);
            if flat_progress {
                return Some("progress stalled across reflection window");
            }
            let oldest = window.last().unwrap().confidence;
            let newest = window.first().unwrap().confidence;
            if oldest - newest >= config.confidence_drop_threshold {
                return Some("confidence dropping across reflection window");
            }
        }
        None
    }
}

/// Drake: the per-process scheduler that owns the live worker pool and
/// ticks the scheduling and stuck-monitor passes. One instance shares a
/// single bound provider across every task it spawns — the project
/// aggregate carries no per-agent-type provider binding, so finer-grained
/// routing is out of scope here.
pub struct Supervisor {
    registry: ProjectRegistry,
    tracker: TaskTracker,
    planning_context: SharedPlanningContext,
    plan_store: PlanStore,
    circuit_breaker: Arc<CircuitBreaker>,
    provider: Arc<dyn Provider>,
    config: SupervisorConfig,
    kobold_config: KoboldConfig,
    workers: Arc<Mutex<HashMap<WorkerId, WorkerTracking>>>,
}

impl Supervisor {
    /// `projects_root` is the same root the Registry and Analyzer
    /// Pipeline use — plans are persisted alongside a project's other
    /// artifacts (spec §6.3 `kobold-plans/`).
    pub fn new(
        registry: ProjectRegistry,
        tracker: TaskTracker,
        planning_context: SharedPlanningContext,
        circuit_breaker: Arc<CircuitBreaker>,
        provider: Arc<dyn Provider>,
        projects_root: PathBuf,
    ) -> Self {
        Self {
            registry,
            tracker,
            planning_context,
            plan_store: PlanStore::new(projects_root),
            circuit_breaker,
            provider,
            config: SupervisorConfig::default(),
            kobold_config: KoboldConfig::default(),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_kobold_config(mut self, kobold_config: KoboldConfig) -> Self {
        self.kobold_config = kobold_config;
        self
    }

    async fn active_count_for(&self, project_id: Uuid, agent_type: AgentType) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| w.project_id == project_id && w.agent_type == agent_type)
            .count()
    }

    /// One scheduling tick (spec §4.5.1): for every `Running` project,
    /// pull its ready set, sort by priority then by longest
    /// dependency-chain depth ascending, then for each task under the
    /// per-agent-type capacity, draft or load its plan and attempt to
    /// claim its anticipated files before ever spawning a worker —
    /// provided the shared provider's circuit is closed. Returns the
    /// number of workers spawned.
    #[instrument(skip(self))]
    pub async fn run_scheduling_tick(&self, now: DateTime<Utc>) -> usize {
        if !self.circuit_breaker.allow_request(self.provider.name(), now).await {
            warn!(provider = self.provider.name(), "circuit open, skipping scheduling tick");
            return 0;
        }

        let mut spawned = 0;
        for project in self.registry.list_active().await {
            let by_id: HashMap<Uuid, Task> =
                self.tracker.list_all(project.id).await.into_iter().map(|t| (t.id, t)).collect();
            let mut depth_memo = HashMap::new();
            let mut ready = self.tracker.list_ready(project.id, now).await;
            let depths: HashMap<Uuid, u32> =
                ready.iter().map(|t| (t.id, dependency_chain_depth(t.id, &by_id, &mut depth_memo))).collect();
            ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| depths[&a.id].cmp(&depths[&b.id])));

            for task in ready {
                let active = self.active_count_for(project.id, task.agent_type).await;
                if active >= self.config.max_parallel_per_agent_type {
                    continue;
                }

                let Some(plan) = self.plan_for_task(&project, &task).await else {
                    continue;
                };

                let worker_id = WorkerId::new();
                if !self.claim_anticipated_files(&plan, worker_id, task.id).await {
                    info!(task_id = %task.id, "deferred: anticipated files already claimed this round");
                    continue;
                }

                if let Err(err) = self.plan_store.save(&project.name, &plan) {
                    warn!(task_id = %task.id, error = %err, "failed to persist plan");
                }

                self.spawn_worker(&project, task, worker_id, plan).await;
                spawned += 1;
            }
        }
        spawned
    }

    /// Load a previously persisted plan for `task` (the resume path,
    /// spec §3), or draft a fresh one against the bound provider if
    /// none exists yet. Returns `None` — leaving the task for a later
    /// tick — if drafting fails.
    async fn plan_for_task(&self, project: &forge_common::Project, task: &Task) -> Option<Plan> {
        if let Some(plan) = self.plan_store.load(&project.name, task.id) {
            return Some(plan);
        }
        let insights = self.planning_context.get_similar_task_insights(&task.description, task.agent_type).await;
        match kobold::draft_plan(&*self.provider, task, &project.specification, insights.as_ref()).await {
            Ok(plan) => Some(plan),
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "failed to draft plan at scheduling time");
                None
            }
        }
    }

    /// Attempt to claim every file this plan's unfinished steps
    /// anticipate touching, all under `worker_id` (spec §4.5.1 step 5).
    /// Rolls back its own partial claims on the first conflict, so a
    /// task never holds some-but-not-all of its anticipated files.
    async fn claim_anticipated_files(&self, plan: &Plan, worker_id: WorkerId, task_id: Uuid) -> bool {
        let anticipated: Vec<PathBuf> = plan
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .flat_map(|s| s.target_files.iter().map(PathBuf::from))
            .collect();

        for path in &anticipated {
            let (granted, _existing) = self.planning_context.try_claim(path.clone(), worker_id, task_id).await;
            if !granted {
                self.planning_context.release_all(worker_id).await;
                return false;
            }
        }
        true
    }

    async fn spawn_worker(&self, project: &forge_common::Project, task: Task, worker_id: WorkerId, plan: Plan) {
        let task_id = task.id;
        let project_id = project.id;
        let agent_type = task.agent_type;

        let mut dependency_output_files = HashMap::new();
        for dep_id in &task.dependencies {
            if let Some(dep) = self.tracker.get(project_id, *dep_id).await {
                dependency_output_files.insert(*dep_id, dep.output_files.clone());
            }
        }

        let insights = self
            .planning_context
            .get_similar_task_insights(&task.description, agent_type)
            .await;

        let sandbox = Sandbox::new(
            project.security_policy.sandbox_mode,
            project.workspace_root.clone(),
            project.security_policy.allowed_paths.clone(),
        );

        let ctx = KoboldContext {
            worker_id,
            task,
            specification: project.specification.clone(),
            current_specification_version: project.specification_version,
            dependency_output_files,
            provider: self.provider.clone(),
            sandbox,
            insights,
            config: self.kobold_config,
            planning_context: self.planning_context.clone(),
            initial_plan: Some(plan),
            plan_persistence: Some(PlanPersistence { store: self.plan_store.clone(), project_name: project.name.clone() }),
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);

        let workers_for_consumer = self.workers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut guard = workers_for_consumer.lock().await;
                if let Some(tracking) = guard.get_mut(&worker_id) {
                    tracking.record_event(event);
                }
            }
        });

        let tracker = self.tracker.clone();
        let planning_context = self.planning_context.clone();
        let circuit_breaker = self.circuit_breaker.clone();
        let provider_name = self.provider.name().to_string();
        let workers_for_finalize = self.workers.clone();
        let started_at = Utc::now();

        let handle = tokio::spawn(async move {
            let outcome = kobold::run_worker(ctx, tx).await;
            finalize_worker(
                &tracker,
                &planning_context,
                &circuit_breaker,
                &provider_name,
                project_id,
                task_id,
                agent_type,
                started_at,
                outcome,
            )
            .await;
            planning_context.release_all(worker_id).await;
            workers_for_finalize.lock().await.remove(&worker_id);
        });

        self.workers.lock().await.insert(
            worker_id,
            WorkerTracking {
                task_id,
                project_id,
                agent_type,
                state: WorkerState::Spawned,
                started_at,
                last_heartbeat: Utc::now(),
                reflections: VecDeque::new(),
                file_write_counts: HashMap::new(),
                handle,
            },
        );
        info!(%worker_id, task_id = %task_id, project_id = %project_id, "spawned kobold worker");
    }

    /// One stuck-monitor tick (spec §4.5.4, folding in the §4.5.5
    /// reasoning monitor): abort and requeue every tracked worker that
    /// trips a stall signal. Returns the number requeued.
    #[instrument(skip(self))]
    pub async fn run_stuck_monitor_tick(&self, now: DateTime<Utc>) -> usize {
        let confidence_floor = self.kobold_config.low_confidence_threshold;
        let stuck: Vec<(WorkerId, Uuid, Uuid, &'static str)> = {
            let guard = self.workers.lock().await;
            guard
                .iter()
                .filter_map(|(id, w)| {
                    w.is_stuck(&self.config, confidence_floor, now).map(|reason| (*id, w.project_id, w.task_id, reason))
                })
                .collect()
        };

        for (worker_id, project_id, task_id, reason) in &stuck {
            warn!(%worker_id, task_id = %task_id, reason, "worker stuck, requeuing");
            if let Some(tracking) = self.workers.lock().await.remove(worker_id) {
                tracking.handle.abort();
            }
            self.planning_context.release_all(*worker_id).await;
            let _ = self
                .tracker
                .update(*project_id, *task_id, |t| {
                    t.status = forge_common::TaskStatus::Unassigned;
                    t.retry_count += 1;
                })
                .await;
        }
        stuck.len()
    }

    pub async fn active_worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

/// Longest chain of transitive dependencies beneath `task_id`, walking
/// the full task graph (not just the ready set) so two ready tasks with
/// the same number of *direct* dependencies but different depths of
/// already-finished ancestors still sort correctly (spec §4.5.1 step 3).
fn dependency_chain_depth(task_id: Uuid, by_id: &HashMap<Uuid, Task>, memo: &mut HashMap<Uuid, u32>) -> u32 {
    if let Some(&depth) = memo.get(&task_id) {
        return depth;
    }
    let depth = by_id
        .get(&task_id)
        .map(|t| t.dependencies.iter().map(|d| dependency_chain_depth(*d, by_id, memo)).max().map_or(0, |m| m + 1))
        .unwrap_or(0);
    memo.insert(task_id, depth);
    depth
}

#[allow(clippy::too_many_arguments)]
async fn finalize_worker(
    tracker: &TaskTracker,
    planning_context: &SharedPlanningContext,
    circuit_breaker: &CircuitBreaker,
    provider_name: &str,
    project_id: Uuid,
    task_id: Uuid,
    agent_type: AgentType,
    started_at: DateTime<Utc>,
    outcome: WorkerOutcome,
) {
    let duration_secs = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
    match outcome {
        WorkerOutcome::Done { output_files, plan } => {
            circuit_breaker.record_success(provider_name).await;
            if let Err(err) = tracker.mark_done(project_id, task_id, output_files).await {
                warn!(task_id = %task_id, error = %err, "failed to record task completion");
            }
            planning_context
                .record_task_outcome(
                    project_id,
                    agent_type,
                    TaskOutcome { success: true, duration_secs, iterations: plan.steps.len() as u32, blockers: vec![] },
                )
                .await;
        }
        WorkerOutcome::Failed { category, message } => {
            circuit_breaker.record_failure(provider_name, category, Utc::now()).await;
            if let Err(err) = crate::recovery::record_failure(tracker, project_id, task_id, category, message.clone(), Utc::now()).await
            {
                warn!(task_id = %task_id, error = %err, "failed to record task failure");
            }
            planning_context
                .record_task_outcome(
                    project_id,
                    agent_type,
                    TaskOutcome { success: false, duration_secs, iterations: 0, blockers: vec![message] },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning_context::provider::ScriptedProvider;
    use forge_common::{AgentType, Task};
    use std::path::PathBuf;

    async fn setup() -> (Supervisor, tempfile::TempDir, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::load(dir.path()).await.unwrap();
        let project = registry.create("demo", dir.path().to_path_buf(), "spec").await.unwrap();
        registry.set_status(project.id, forge_common::ProjectStatus::WyrmAssigned).await.unwrap();
        registry.set_status(project.id, forge_common::ProjectStatus::Analyzed).await.unwrap();
        registry.set_status(project.id, forge_common::ProjectStatus::InProgress).await.unwrap();

        let tracker = TaskTracker::new();
        tracker.register_project(project.id, dir.path()).await.unwrap();

        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(
            "scripted",
            vec![
                ScriptedProvider::text_response(r#"{"steps": [{"description": "x"}]}"#),
                ScriptedProvider::tool_use_response("call-1", tools::COMPLETE_STEP, serde_json::json!({})),
            ],
        ));

        let supervisor = Supervisor::new(
            registry.clone(),
            tracker.clone(),
            SharedPlanningContext::new(),
            Arc::new(CircuitBreaker::new()),
            provider,
            dir.path().to_path_buf(),
        );
        (supervisor, dir, project.id)
    }

    #[tokio::test]
    async fn scheduling_tick_spawns_a_worker_for_a_ready_task() {
        let (supervisor, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "do it", "backend", AgentType::Coding, 1);
        supervisor.tracker.add(task).await.unwrap();

        let spawned = supervisor.run_scheduling_tick(Utc::now()).await;
        assert_eq!(spawned, 1);
        assert_eq!(supervisor.active_worker_count().await, 1);
    }

    #[tokio::test]
    async fn scheduling_tick_respects_per_agent_type_capacity() {
        let (supervisor, _dir, project_id) = setup().await;
        let supervisor = supervisor.with_config(SupervisorConfig {
            max_parallel_per_agent_type: 1,
            ..SupervisorConfig::default()
        });
        for i in 0..3 {
            let task = Task::new(project_id, format!("task {i}"), "backend", AgentType::Coding, 1);
            supervisor.tracker.add(task).await.unwrap();
        }

        let spawned = supervisor.run_scheduling_tick(Utc::now()).await;
        assert_eq!(spawned, 1);
    }

    #[tokio::test]
    async fn scheduling_tick_skips_everything_when_circuit_is_open() {
        let (supervisor, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "do it", "backend", AgentType::Coding, 1);
        supervisor.tracker.add(task).await.unwrap();

        let now = Utc::now();
        for _ in 0..3 {
            supervisor.circuit_breaker.record_failure("scripted", forge_common::ErrorCategory::Transient, now).await;
        }

        assert_eq!(supervisor.run_scheduling_tick(now).await, 0);
    }

    #[tokio::test]
    async fn stuck_monitor_requeues_a_worker_past_its_heartbeat_timeout() {
        let (supervisor, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "slow one", "backend", AgentType::Coding, 1);
        let task_id = task.id;
        supervisor.tracker.update(project_id, task_id, |_| {}).await.ok();
        supervisor.tracker.add(task).await.unwrap();

        let worker_id = WorkerId::new();
        let handle = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        supervisor.workers.lock().await.insert(
            worker_id,
            WorkerTracking {
                task_id,
                project_id,
                agent_type: AgentType::Coding,
                state: WorkerState::Executing,
                started_at: Utc::now() - ChronoDuration::hours(1),
                last_heartbeat: Utc::now() - ChronoDuration::hours(1),
                reflections: VecDeque::new(),
                file_write_counts: HashMap::new(),
                handle,
            },
        );

        let requeued = supervisor.run_stuck_monitor_tick(Utc::now()).await;
        assert_eq!(requeued, 1);
        assert_eq!(supervisor.active_worker_count().await, 0);
        let reset = supervisor.tracker.get(project_id, task_id).await.unwrap();
        assert_eq!(reset.status, forge_common::TaskStatus::Unassigned);
        assert_eq!(reset.retry_count, 1);
    }

    #[tokio::test]
    async fn stuck_monitor_flags_a_reflection_naming_too_many_blockers() {
        let (supervisor, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "blocked one", "backend", AgentType::Coding, 1);
        let task_id = task.id;
        supervisor.tracker.add(task).await.unwrap();

        let mut reflection = Reflection::new(Uuid::new_v4(), task_id, 10.0, 0.9, forge_common::Decision::Continue);
        reflection.blockers = vec!["a".into(), "b".into(), "c".into()];

        let worker_id = WorkerId::new();
        let handle = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        let mut reflections = VecDeque::new();
        reflections.push_back(reflection);
        supervisor.workers.lock().await.insert(
            worker_id,
            WorkerTracking {
                task_id,
                project_id,
                agent_type: AgentType::Coding,
                state: WorkerState::Reflecting,
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                reflections,
                file_write_counts: HashMap::new(),
                handle,
            },
        );

        assert_eq!(supervisor.run_stuck_monitor_tick(Utc::now()).await, 1);
    }

    #[tokio::test]
    async fn stuck_monitor_flags_repeated_writes_to_the_same_file() {
        let (supervisor, _dir, project_id) = setup().await;
        let task = Task::new(project_id, "thrashing", "backend", AgentType::Coding, 1);
        let task_id = task.id;
        supervisor.tracker.add(task).await.unwrap();

        let worker_id = WorkerId::new();
        let handle = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        let mut file_write_counts = HashMap::new();
        file_write_counts.insert(PathBuf::from("src/lib.rs"), 5);
        supervisor.workers.lock().await.insert(
            worker_id,
            WorkerTracking {
                task_id,
                project_id,
                agent_type: AgentType::Coding,
                state: WorkerState::Executing,
                started_at: Utc::now(),
                last_heartbeat: Utc::now(),
                reflections: VecDeque::new(),
                file_write_counts,
                handle,
            },
        );

        assert_eq!(supervisor.run_stuck_monitor_tick(Utc::now()).await, 1);
    }
}
