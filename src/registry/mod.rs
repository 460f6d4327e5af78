//! The Project Registry (spec §4.1).
//!
//! Persists every [`Project`] to a single `projects.json` document and
//! maintains an in-memory index keyed by id. Every mutating operation
//! holds the registry-wide lock across both the index update and the
//! atomic disk write, so two concurrent mutations can never interleave
//! and the file on disk always reflects a consistent snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use forge_common::{ExecutionState, Project, ProjectStatus};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::errors::RegistryError;
use crate::util::write_json_atomic;

const PROJECTS_FILE: &str = "projects.json";

/// Thread-safe, disk-backed store of every project under orchestration.
///
/// Cloning a `ProjectRegistry` is cheap and shares the same underlying
/// index — the five periodic schedulers (spec §4.8) each hold a clone.
#[derive(Clone)]
pub struct ProjectRegistry {
    path: PathBuf,
    index: Arc<RwLock<HashMap<Uuid, Project>>>,
}

impl ProjectRegistry {
    /// Load `<forge_dir>/projects.json`, or start empty if it doesn't
    /// exist yet — a fresh forge directory has zero projects.
    #[instrument(skip(forge_dir), fields(forge_dir = %forge_dir.as_ref().display()))]
    pub async fn load(forge_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let forge_dir = forge_dir.as_ref();
        std::fs::create_dir_all(forge_dir)
            .with_context(|| format!("failed to create {}", forge_dir.display()))?;
        let path = forge_dir.join(PROJECTS_FILE);

        let projects: Vec<Project> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Vec::new()
        };
        info!(count = projects.len(), "loaded project registry");

        let index = projects.into_iter().map(|p| (p.id, p)).collect();
        Ok(Self {
            path,
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Write the full project slice to disk. Caller must hold the write
    /// lock on `index` for the duration.
    fn persist_locked(&self, index: &HashMap<Uuid, Project>) -> Result<(), RegistryError> {
        let mut projects: Vec<&Project> = index.values().collect();
        projects.sort_by_key(|p| p.created_at);
        write_json_atomic(&self.path, &projects).map_err(|source| RegistryError::PersistFailed {
            path: self.path.clone(),
            source,
        })
    }

    #[instrument(skip(self, specification), fields(project_name = %name.as_ref()))]
    pub async fn create(
        &self,
        name: impl AsRef<str>,
        workspace_root: PathBuf,
        specification: impl Into<String>,
    ) -> Result<Project, RegistryError> {
        let project = Project::new(name.as_ref(), workspace_root, specification);
        let mut guard = self.index.write().await;
        guard.insert(project.id, project.clone());
        self.persist_locked(&guard)?;
        info!(project_id = %project.id, "registered new project");
        Ok(project)
    }

    pub async fn get(&self, id: Uuid) -> Result<Project, RegistryError> {
        self.index
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound { id })
    }

    pub async fn list(&self) -> Vec<Project> {
        self.index.read().await.values().cloned().collect()
    }

    /// List projects whose `execution_state` is `Running` — the set the
    /// five schedulers (spec §4.8) iterate over on every tick.
    pub async fn list_active(&self) -> Vec<Project> {
        self.index
            .read()
            .await
            .values()
            .filter(|p| p.execution_state == ExecutionState::Running)
            .cloned()
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        let mut guard = self.index.write().await;
        guard.remove(&id).ok_or(RegistryError::NotFound { id })?;
        self.persist_locked(&guard)?;
        Ok(())
    }

    /// Apply `mutate` to the project under the write lock, then persist
    /// the whole index. `mutate` returns an error to abort without
    /// touching disk (e.g. an illegal state transition).
    async fn update<F, E>(&self, id: Uuid, mutate: F) -> Result<Project, RegistryError>
    where
        F: FnOnce(&mut Project) -> Result<(), E>,
        E: Into<RegistryError>,
    {
        let mut guard = self.index.write().await;
        let project = guard.get_mut(&id).ok_or(RegistryError::NotFound { id })?;
        mutate(project).map_err(Into::into)?;
        let snapshot = project.clone();
        self.persist_locked(&guard)?;
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    pub async fn set_status(&self, id: Uuid, status: ProjectStatus) -> Result<Project, RegistryError> {
        self.update(id, |p| {
            p.set_status(status).map_err(RegistryError::IllegalStatusTransition)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_execution_state(
        &self,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<Project, RegistryError> {
        self.update(id, |p| {
            p.set_execution_state(state)
                .map_err(RegistryError::IllegalExecutionStateTransition)
        })
        .await
    }

    #[instrument(skip(self, message))]
    pub async fn record_error(&self, id: Uuid, message: impl Into<String>) -> Result<Project, RegistryError> {
        let message = message.into();
        self.update(id, move |p| -> Result<(), RegistryError> {
            p.record_error(message);
            Ok(())
        })
        .await
    }

    /// Replace a project's specification text. Returns `true` if the
    /// content actually changed (drives the drift-detection policy in
    /// spec §9).
    #[instrument(skip(self, specification))]
    pub async fn update_specification(
        &self,
        id: Uuid,
        specification: impl Into<String>,
    ) -> Result<(Project, bool), RegistryError> {
        let specification = specification.into();
        let mut guard = self.index.write().await;
        let project = guard.get_mut(&id).ok_or(RegistryError::NotFound { id })?;
        let changed = project.update_specification(specification);
        let snapshot = project.clone();
        if changed {
            self.persist_locked(&guard)?;
        }
        Ok((snapshot, changed))
    }
}
