//! The Task Tracker (spec §4.2).
//!
//! Holds tasks per project in memory, mirrors them to one markdown file
//! per work area plus a machine-readable JSON sidecar, and debounces
//! writes through a 2-second coalescing window so a burst of worker
//! activity produces a single flush. Critical transitions (a task
//! reaching `Done`, a plan step completing) are appended synchronously
//! to a write-ahead log first, mirroring the reference audit logger's
//! discipline of always having a durable record of in-flight state
//! before the debounced consolidation catches up (§4.7.1).

pub mod git;
pub mod wal;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forge_common::{ErrorCategory, Priority, Task, TaskStatus};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::util::write_json_atomic;
pub use wal::{Transition, WalEntry};

/// Coalescing window for debounced writes (spec §4.2).
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

const TASKS_SIDECAR_FILE: &str = "tasks.json";
const TASKS_SUBDIR: &str = "tasks";

struct ProjectTasks {
    dir: PathBuf,
    tasks: HashMap<Uuid, Task>,
    dirty_since: Option<Instant>,
}

/// In-memory index of every project's tasks, with disk mirroring.
#[derive(Clone)]
pub struct TaskTracker {
    projects: Arc<RwLock<HashMap<Uuid, ProjectTasks>>>,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            projects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a project's task storage directory (`{project}/`, which
    /// holds `tasks.json` and `tasks/{area}-tasks.md`), loading any tasks
    /// already persisted there.
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()))]
    pub async fn register_project(&self, project_id: Uuid, dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let dir = dir.as_ref().to_path_buf();
        let sidecar = dir.join(TASKS_SIDECAR_FILE);
        let tasks: Vec<Task> = if sidecar.exists() {
            let content = std::fs::read_to_string(&sidecar)?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };
        let wal_tail = wal::replay_if_newer(&dir, &tasks).await?;

        let mut tasks: HashMap<Uuid, Task> = tasks.into_iter().map(|t| (t.id, t)).collect();
        for entry in wal_tail {
            if let Transition::TaskDone { task_id, output_files } = entry.transition {
                if let Some(task) = tasks.get_mut(&task_id) {
                    task.mark_done(output_files);
                }
            }
        }

        info!(project_id = %project_id, count = tasks.len(), "registered project with tracker");
        self.projects.write().await.insert(
            project_id,
            ProjectTasks {
                dir,
                tasks,
                dirty_since: None,
            },
        );
        Ok(())
    }

    async fn mark_dirty(&self, project_id: Uuid) {
        if let Some(p) = self.projects.write().await.get_mut(&project_id) {
            p.dirty_since = Some(Instant::now());
        }
    }

    pub async fn add(&self, task: Task) -> anyhow::Result<()> {
        let project_id = task.project_id;
        {
            let mut guard = self.projects.write().await;
            let p = guard
                .get_mut(&project_id)
                .ok_or_else(|| anyhow::anyhow!("project {project_id} not registered with tracker"))?;
            p.tasks.insert(task.id, task);
        }
        self.mark_dirty(project_id).await;
        Ok(())
    }

    pub async fn get(&self, project_id: Uuid, task_id: Uuid) -> Option<Task> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .and_then(|p| p.tasks.get(&task_id).cloned())
    }

    /// Apply `mutate` to a task and mark the project dirty for the next
    /// debounced flush.
    pub async fn update<F>(&self, project_id: Uuid, task_id: Uuid, mutate: F) -> anyhow::Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let updated = {
            let mut guard = self.projects.write().await;
            let p = guard
                .get_mut(&project_id)
                .ok_or_else(|| anyhow::anyhow!("project {project_id} not registered with tracker"))?;
            let task = p
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
            mutate(task);
            task.clone()
        };
        self.mark_dirty(project_id).await;
        Ok(updated)
    }

    /// Mark a task `Done`, appending to the write-ahead log synchronously
    /// before the debounced consolidation picks it up (spec §4.7.1).
    #[instrument(skip(self, output_files))]
    pub async fn mark_done(&self, project_id: Uuid, task_id: Uuid, output_files: Vec<String>) -> anyhow::Result<Task> {
        let dir = {
            let guard = self.projects.read().await;
            guard
                .get(&project_id)
                .ok_or_else(|| anyhow::anyhow!("project {project_id} not registered with tracker"))?
                .dir
                .clone()
        };
        wal::append(
            &dir,
            project_id,
            Transition::TaskDone {
                task_id,
                output_files: output_files.clone(),
            },
        )
        .await?;
        self.update(project_id, task_id, move |t| t.mark_done(output_files)).await
    }

    /// The ordered ready set (spec §4.2, tie-break chain in §4.5.1):
    /// `Unassigned`, all dependencies `Done`, `nextRetryAt` elapsed.
    pub async fn list_ready(&self, project_id: Uuid, now: DateTime<Utc>) -> Vec<Task> {
        let guard = self.projects.read().await;
        let Some(p) = guard.get(&project_id) else {
            return Vec::new();
        };
        let done: HashSet<Uuid> = p
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id)
            .collect();
        p.tasks
            .values()
            .filter(|t| t.is_ready(&done, now))
            .cloned()
            .collect()
    }

    pub async fn list_failed(&self, project_id: Uuid) -> Vec<Task> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .map(|p| p.tasks.values().filter(|t| t.status == TaskStatus::Failed).cloned().collect())
            .unwrap_or_default()
    }

    /// Tasks stuck `Working` for longer than `threshold` without an
    /// update — the Tracker-level building block the stuck-worker
    /// monitor (§4.5.4) layers heartbeat/reflection heuristics on top of.
    pub async fn list_stuck(&self, project_id: Uuid, threshold: chrono::Duration, now: DateTime<Utc>) -> Vec<Task> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .map(|p| {
                p.tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Working && now - t.updated_at >= threshold)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn list_all(&self, project_id: Uuid) -> Vec<Task> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .map(|p| p.tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Reset a `Done` task back to `Unassigned` (explicit user retry,
    /// spec §4.2 invariant iii) or a `Failed` task after backoff elapses
    /// (spec §4.7).
    pub async fn retry(&self, project_id: Uuid, task_id: Uuid) -> anyhow::Result<Task> {
        self.update(project_id, task_id, |t| {
            if t.status == TaskStatus::Done {
                t.retry_from_done();
            } else {
                t.status = TaskStatus::Unassigned;
            }
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        project_id: Uuid,
        task_id: Uuid,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> anyhow::Result<Task> {
        let message = message.into();
        self.update(project_id, task_id, move |t| t.mark_failed(category, message)).await
    }

    pub async fn set_priority(&self, project_id: Uuid, task_id: Uuid, priority: Priority) -> anyhow::Result<Task> {
        self.update(project_id, task_id, move |t| t.priority = priority).await
    }

    /// Flush every project whose dirty window has elapsed. Intended to
    /// be called from a periodic background loop.
    pub async fn flush_elapsed(&self) -> anyhow::Result<usize> {
        let due: Vec<Uuid> = {
            let guard = self.projects.read().await;
            guard
                .iter()
                .filter(|(_, p)| p.dirty_since.is_some_and(|since| since.elapsed() >= DEBOUNCE_WINDOW))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &due {
            self.flush(*id).await?;
        }
        Ok(due.len())
    }

    /// Force an immediate, synchronous flush of one project — used on
    /// shutdown and by tests that don't want to wait out the coalescing
    /// window.
    #[instrument(skip(self))]
    pub async fn flush(&self, project_id: Uuid) -> anyhow::Result<()> {
        let (dir, tasks) = {
            let mut guard = self.projects.write().await;
            let Some(p) = guard.get_mut(&project_id) else {
                return Ok(());
            };
            p.dirty_since = None;
            (p.dir.clone(), p.tasks.values().cloned().collect::<Vec<_>>())
        };
        write_sidecar(&dir, &tasks)?;
        write_area_markdown(&dir, &tasks)?;
        debug!(project_id = %project_id, count = tasks.len(), "flushed tracker state");
        Ok(())
    }

    /// Flush every registered project synchronously, regardless of its
    /// dirty window — called on orchestrator shutdown.
    pub async fn flush_all(&self) -> anyhow::Result<()> {
        let ids: Vec<Uuid> = self.projects.read().await.keys().copied().collect();
        for id in ids {
            self.flush(id).await?;
        }
        Ok(())
    }
}

fn write_sidecar(dir: &Path, tasks: &[Task]) -> anyhow::Result<()> {
    let mut sorted = tasks.to_vec();
    sorted.sort_by_key(|t| t.created_at);
    write_json_atomic(&dir.join(TASKS_SIDECAR_FILE), &sorted)
}

fn write_area_markdown(dir: &Path, tasks: &[Task]) -> anyhow::Result<()> {
    let mut by_area: HashMap<&str, Vec<&Task>> = HashMap::new();
    for task in tasks {
        by_area.entry(task.area.as_str()).or_default().push(task);
    }

    let tasks_dir = dir.join(TASKS_SUBDIR);
    std::fs::create_dir_all(&tasks_dir)?;

    for (area, mut area_tasks) in by_area {
        area_tasks.sort_by_key(|t| t.created_at);
        let mut out = format!("# Tasks: {area}\n\n");
        for task in area_tasks {
            out.push_str(&format!(
                "- [{}] **{}** ({:?}, {:?}) — {}\n",
                if task.status == TaskStatus::Done { "x" } else { " " },
                task.description,
                task.status,
                task.priority,
                task.agent_type,
            ));
        }
        let safe_area: String = area
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        let path = tasks_dir.join(format!("{safe_area}-tasks.md"));
        let tmp = tasks_dir.join(format!(".{safe_area}-tasks.md.tmp-{}", std::process::id()));
        std::fs::write(&tmp, &out)?;
        std::fs::rename(&tmp, &path)?;
    }
    Ok(())
}
