//! `OrchestratorService`: the single process-level owner of every
//! periodic pass (spec §4 overview). It wires together the Registry,
//! Tracker, Analyzer Scheduler, Supervisor, Recovery service, and
//! Dragon, then spawns one independent `tokio::time::interval` loop per
//! pass. Mirrors the reference DAG executor's "one task per wave,
//! `tokio::spawn` and move on" shape, generalized from a single
//! sequential run to five indefinitely repeating ticks.

pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::analyzer::AnalyzerScheduler;
use crate::dragon::Dragon;
use crate::dragon::sessions::SessionStore;
use crate::planning_context::SharedPlanningContext;
use crate::planning_context::provider::Provider;
use crate::recovery::{CircuitBreaker, RecoveryService};
use crate::registry::ProjectRegistry;
use crate::supervisor::Supervisor;
use crate::tracker::TaskTracker;

/// Tick cadences, spec §2. Each one drives its own independent interval
/// loop — a slow recovery sweep never blocks a fast execution tick.
pub const PRE_ANALYSIS_INTERVAL_SECS: u64 = 60;
pub const DETAILED_ANALYSIS_INTERVAL_SECS: u64 = 60;
pub const EXECUTION_INTERVAL_SECS: u64 = 30;
pub const STUCK_WORKER_INTERVAL_SECS: u64 = 60;
pub const RECOVERY_INTERVAL_SECS: u64 = 300;

/// Cadence overrides for the five loops, resolved from `forge.toml`'s
/// `[orchestrator]` section at startup. Falls back to the spec's
/// defaults above when a project doesn't set one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub pre_analysis_secs: u64,
    pub detailed_analysis_secs: u64,
    pub execution_secs: u64,
    pub stuck_worker_secs: u64,
    pub recovery_secs: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            pre_analysis_secs: PRE_ANALYSIS_INTERVAL_SECS,
            detailed_analysis_secs: DETAILED_ANALYSIS_INTERVAL_SECS,
            execution_secs: EXECUTION_INTERVAL_SECS,
            stuck_worker_secs: STUCK_WORKER_INTERVAL_SECS,
            recovery_secs: RECOVERY_INTERVAL_SECS,
        }
    }
}

/// Everything a running server needs, assembled once at process startup
/// and cloned (cheaply — every field is `Arc`-backed) into each
/// spawned loop.
#[derive(Clone)]
pub struct OrchestratorService {
    pub registry: ProjectRegistry,
    pub tracker: TaskTracker,
    pub sessions: SessionStore,
    pub analyzer: Arc<AnalyzerScheduler>,
    pub supervisor: Arc<Supervisor>,
    pub recovery: Arc<RecoveryService>,
    pub dragon: Arc<Dragon>,
    pub provider: Arc<dyn Provider>,
    pub cadence: CadenceConfig,
}

impl OrchestratorService {
    /// Load every persisted component from `forge_dir` and wire them
    /// together against a single bound provider, using the spec's
    /// default cadences.
    pub async fn load(forge_dir: impl AsRef<std::path::Path>, provider: Arc<dyn Provider>) -> anyhow::Result<Self> {
        Self::load_with_cadence(forge_dir, provider, CadenceConfig::default()).await
    }

    /// Load every persisted component from `forge_dir`, wiring them
    /// together against a single bound provider and a cadence config
    /// resolved from `forge.toml` (or the CLI, or the defaults above).
    #[instrument(skip(forge_dir, provider), fields(forge_dir = %forge_dir.as_ref().display()))]
    pub async fn load_with_cadence(
        forge_dir: impl AsRef<std::path::Path>,
        provider: Arc<dyn Provider>,
        cadence: CadenceConfig,
    ) -> anyhow::Result<Self> {
        let forge_dir = forge_dir.as_ref();
        let registry = ProjectRegistry::load(forge_dir).await?;
        let tracker = TaskTracker::new();
        let sessions = SessionStore::load(forge_dir).await?;
        let planning_context = SharedPlanningContext::new();
        let circuit_breaker = Arc::new(CircuitBreaker::new());

        let analyzer = Arc::new(AnalyzerScheduler::new(registry.clone(), tracker.clone(), forge_dir.to_path_buf()));
        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            tracker.clone(),
            planning_context,
            circuit_breaker,
            provider.clone(),
            forge_dir.to_path_buf(),
        ));
        let recovery = Arc::new(RecoveryService::new(tracker.clone(), registry.clone()));
        let dragon = Arc::new(Dragon::new(sessions.clone(), registry.clone(), tracker.clone(), provider.clone()));

        Ok(Self { registry, tracker, sessions, analyzer, supervisor, recovery, dragon, provider, cadence })
    }

    /// Spawn the five independent interval loops. Returns their join
    /// handles so a caller (or `serve`'s shutdown path) can await or
    /// abort them; none of them return on their own.
    pub fn spawn_background_loops(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_pre_analysis_loop(),
            self.spawn_detailed_analysis_loop(),
            self.spawn_execution_loop(),
            self.spawn_stuck_worker_loop(),
            self.spawn_recovery_loop(),
        ]
    }

    fn spawn_pre_analysis_loop(&self) -> JoinHandle<()> {
        let analyzer = self.analyzer.clone();
        let provider = self.provider.clone();
        let secs = self.cadence.pre_analysis_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                let started = analyzer.run_wyrm_tick(provider.clone()).await;
                if started > 0 {
                    info!(started, "pre-analysis tick");
                }
            }
        })
    }

    fn spawn_detailed_analysis_loop(&self) -> JoinHandle<()> {
        let analyzer = self.analyzer.clone();
        let provider = self.provider.clone();
        let secs = self.cadence.detailed_analysis_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                let started = analyzer.run_wyvern_tick(provider.clone()).await;
                if started > 0 {
                    info!(started, "detailed analysis tick");
                }
            }
        })
    }

    fn spawn_execution_loop(&self) -> JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let secs = self.cadence.execution_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                let spawned = supervisor.run_scheduling_tick(chrono::Utc::now()).await;
                if spawned > 0 {
                    info!(spawned, "execution tick");
                }
            }
        })
    }

    fn spawn_stuck_worker_loop(&self) -> JoinHandle<()> {
        let supervisor = self.supervisor.clone();
        let secs = self.cadence.stuck_worker_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                let requeued = supervisor.run_stuck_monitor_tick(chrono::Utc::now()).await;
                if requeued > 0 {
                    warn!(requeued, "stuck-worker tick requeued workers");
                }
            }
        })
    }

    fn spawn_recovery_loop(&self) -> JoinHandle<()> {
        let recovery = self.recovery.clone();
        let secs = self.cadence.recovery_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));
            loop {
                interval.tick().await;
                match recovery.run_once(chrono::Utc::now()).await {
                    Ok(recovered) if recovered > 0 => info!(recovered, "recovery tick"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "recovery tick failed"),
                }
            }
        })
    }
}

/// Where a freshly initialized project's `.forge` directory lives,
/// relative to the project's own root.
pub fn default_forge_dir(project_dir: &std::path::Path) -> PathBuf {
    project_dir.join(".forge")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning_context::provider::NullProvider;

    #[tokio::test]
    async fn load_wires_every_component_against_an_empty_forge_dir() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(NullProvider);
        let service = OrchestratorService::load(dir.path(), provider).await.unwrap();
        assert!(service.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn load_with_cadence_overrides_the_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(NullProvider);
        let cadence = CadenceConfig { execution_secs: 5, ..CadenceConfig::default() };
        let service = OrchestratorService::load_with_cadence(dir.path(), provider, cadence).await.unwrap();
        assert_eq!(service.cadence.execution_secs, 5);
        assert_eq!(service.cadence.recovery_secs, RECOVERY_INTERVAL_SECS);
    }

    #[tokio::test]
    async fn spawned_loops_run_without_panicking_briefly() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(NullProvider);
        let service = OrchestratorService::load(dir.path(), provider).await.unwrap();
        let handles = service.spawn_background_loops();
        assert_eq!(handles.len(), 5);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        for handle in handles {
            assert!(!handle.is_finished());
            handle.abort();
        }
    }
}
