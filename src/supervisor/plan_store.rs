//! Persisted Kobold plans (spec §3 "Plan", §6.3 `kobold-plans/`).
//!
//! A plan is drafted once per task — either by the scheduler before it
//! ever spawns a worker, or by the worker itself if none is cached yet
//! — and written to disk so a later worker resuming the same task picks
//! up the same plan (including completed-step state) instead of
//! redrafting it from scratch.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use forge_common::Plan;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::write_json_atomic;

const PLANS_SUBDIR: &str = "kobold-plans";
const PLAN_INDEX_FILE: &str = "plan-index.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PlanIndex {
    entries: HashMap<Uuid, PlanIndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanIndexEntry {
    json_file: String,
    markdown_file: String,
    updated_at: DateTime<Utc>,
}

/// One instance per process, rooted at the same `projectsRoot` the
/// Registry and Analyzer Pipeline use.
#[derive(Clone)]
pub struct PlanStore {
    projects_root: PathBuf,
}

impl PlanStore {
    pub fn new(projects_root: PathBuf) -> Self {
        Self { projects_root }
    }

    fn plans_dir(&self, project_name: &str) -> PathBuf {
        crate::util::project_dir(&self.projects_root, project_name).join(PLANS_SUBDIR)
    }

    /// Load a previously persisted plan for `task_id`, if one exists —
    /// the resume path a later worker takes instead of redrafting.
    pub fn load(&self, project_name: &str, task_id: Uuid) -> Option<Plan> {
        let path = self.plans_dir(project_name).join(format!("{task_id}-plan.json"));
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Persist `plan`'s JSON, a human-readable markdown rendering, and
    /// update the project's plan index. Called at scheduling time right
    /// after claims are granted, and again whenever the worker advances
    /// a step, so a crash never loses more progress than the last step.
    pub fn save(&self, project_name: &str, plan: &Plan) -> Result<()> {
        let dir = self.plans_dir(project_name);
        let json_file = format!("{}-plan.json", plan.task_id);
        let markdown_file = format!("{}-plan.md", plan.task_id);

        write_json_atomic(&dir.join(&json_file), plan)?;
        std::fs::write(dir.join(&markdown_file), render_markdown(plan))?;

        let index_path = dir.join(PLAN_INDEX_FILE);
        let mut index: PlanIndex = std::fs::read_to_string(&index_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        index.entries.insert(plan.task_id, PlanIndexEntry { json_file, markdown_file, updated_at: plan.updated_at });
        write_json_atomic(&index_path, &index)?;
        Ok(())
    }
}

fn render_markdown(plan: &Plan) -> String {
    let mut out = format!("# Plan for task {}\n\n", plan.task_id);
    for step in &plan.steps {
        out.push_str(&format!("- [{:?}] step {}: {}\n", step.status, step.ordinal, step.description));
        if !step.target_files.is_empty() {
            out.push_str(&format!("  - files: {:?}\n", step.target_files));
        }
    }
    out
}
