//! The Analyzer Pipeline — Wyrm (pre-analysis) then Wyvern (detailed
//! analysis), spec §4.4. Two independent periodic schedulers, each
//! bounding concurrent project analyses with a counting semaphore and
//! guarding against double pick-up with an in-flight set, mirroring the
//! reference DAG executor's `Semaphore`-gated wave scheduling.

pub mod wyrm;
pub mod wyvern;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_common::{Project, ProjectStatus};
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::planning_context::provider::Provider;
use crate::registry::ProjectRegistry;
use crate::tracker::TaskTracker;
use crate::util::write_json_atomic;

const MAX_CONCURRENT_ANALYSES: usize = 5;
const WYRM_RECOMMENDATION_FILE: &str = "wyrm-recommendation.json";
const ANALYSIS_FILE: &str = "analysis.json";

fn project_dir(projects_root: &Path, project: &Project) -> PathBuf {
    crate::util::project_dir(projects_root, &project.name)
}

/// Bounds concurrent Wyrm/Wyvern passes and prevents the same project
/// from being picked up twice while its analysis is still in flight.
pub struct AnalyzerScheduler {
    registry: ProjectRegistry,
    tracker: TaskTracker,
    projects_root: PathBuf,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl AnalyzerScheduler {
    pub fn new(registry: ProjectRegistry, tracker: TaskTracker, projects_root: PathBuf) -> Self {
        Self {
            registry,
            tracker,
            projects_root,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_ANALYSES)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn claim(&self, project_id: Uuid) -> bool {
        self.in_flight.lock().await.insert(project_id)
    }

    async fn release(&self, project_id: Uuid) {
        self.in_flight.lock().await.remove(&project_id);
    }

    /// One Wyrm scheduler tick: every project in `New` status gets a
    /// pre-analysis pass, bounded to `MAX_CONCURRENT_ANALYSES` at once.
    #[instrument(skip(self, provider))]
    pub async fn run_wyrm_tick(&self, provider: Arc<dyn Provider>) -> usize {
        let candidates: Vec<Project> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|p| p.status == ProjectStatus::New)
            .collect();

        let mut started = 0;
        let mut handles = Vec::new();
        for project in candidates {
            if !self.claim(project.id).await {
                continue;
            }
            started += 1;
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let registry = self.registry.clone();
            let dir = project_dir(&self.projects_root, &project);
            let provider = provider.clone();
            let in_flight = self.in_flight.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = run_wyrm_for_project(&*provider, &registry, &project, &dir).await {
                    warn!(project_id = %project.id, error = %err, "wyrm pass failed");
                    let _ = registry.record_error(project.id, err.to_string()).await;
                }
                in_flight.lock().await.remove(&project.id);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        started
    }

    /// One Wyvern scheduler tick: every project in `WyrmAssigned` status
    /// gets a detailed-analysis pass.
    #[instrument(skip(self, provider))]
    pub async fn run_wyvern_tick(&self, provider: Arc<dyn Provider>) -> usize {
        let candidates: Vec<Project> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|p| p.status == ProjectStatus::WyrmAssigned)
            .collect();

        let mut started = 0;
        let mut handles = Vec::new();
        for project in candidates {
            if !self.claim(project.id).await {
                continue;
            }
            started += 1;
            let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let registry = self.registry.clone();
            let tracker = self.tracker.clone();
            let dir = project_dir(&self.projects_root, &project);
            let provider = provider.clone();
            let in_flight = self.in_flight.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = run_wyvern_for_project(&*provider, &registry, &tracker, &project, &dir).await {
                    error!(project_id = %project.id, error = %err, "wyvern pass failed");
                    let _ = registry.record_error(project.id, err.to_string()).await;
                }
                in_flight.lock().await.remove(&project.id);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        started
    }
}

/// On success: write `wyrm-recommendation.json`, advance status to
/// `WyrmAssigned`. On failure, leave status as `New` so next cycle
/// retries — the caller records the error on the project.
async fn run_wyrm_for_project(
    provider: &dyn Provider,
    registry: &ProjectRegistry,
    project: &Project,
    dir: &Path,
) -> anyhow::Result<()> {
    let recommendation = wyrm::analyze(provider, &project.specification).await?;
    write_json_atomic(&dir.join(WYRM_RECOMMENDATION_FILE), &recommendation)?;
    registry.set_status(project.id, ProjectStatus::WyrmAssigned).await?;
    info!(project_id = %project.id, "wyrm pass complete");
    Ok(())
}

/// On success: register every task with the Tracker, flush it to disk
/// (tasks.json + per-area markdown), write `analysis.json`, and advance
/// status to `Analyzed`.
async fn run_wyvern_for_project(
    provider: &dyn Provider,
    registry: &ProjectRegistry,
    tracker: &TaskTracker,
    project: &Project,
    dir: &Path,
) -> anyhow::Result<()> {
    let recommendation_path = dir.join(WYRM_RECOMMENDATION_FILE);
    let recommendation: Option<wyrm::WyrmRecommendation> = if recommendation_path.exists() {
        let content = std::fs::read_to_string(&recommendation_path)?;
        serde_json::from_str(&content).ok()
    } else {
        None
    };

    let tasks = wyvern::analyze(
        provider,
        &project.specification,
        recommendation.as_ref(),
        project.id,
        project.specification_version,
    )
    .await?;

    tracker.register_project(project.id, dir).await?;
    for task in &tasks {
        tracker.add(task.clone()).await?;
    }
    tracker.flush(project.id).await?;
    write_json_atomic(&dir.join(ANALYSIS_FILE), &tasks)?;

    registry.set_status(project.id, ProjectStatus::Analyzed).await?;
    info!(project_id = %project.id, task_count = tasks.len(), "wyvern pass complete");
    Ok(())
}
