//! Detailed analysis (Wyvern), spec §4.4. Partitions a specification
//! into an area-organized task list and registers it with the Tracker.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use forge_common::{AgentType, Priority, Task};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analyzer::wyrm::WyrmRecommendation;
use crate::planning_context::provider::{Message, Provider, SendOptions};
use crate::util::extract_json_object;

/// One task as Wyvern emits it, before dependency ids are resolved
/// against the batch. `id` is a local, provider-chosen string (e.g.
/// `"task-1"`), scoped only to this analysis pass.
#[derive(Debug, Clone, Deserialize)]
struct RawTaskDraft {
    id: String,
    description: String,
    area: String,
    agent_type: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWyvernOutput {
    tasks: Vec<RawTaskDraft>,
}

fn parse_priority(s: &str) -> Priority {
    match s.to_lowercase().as_str() {
        "critical" => Priority::Critical,
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Normal,
    }
}

pub fn build_prompt(specification: &str, recommendation: Option<&WyrmRecommendation>) -> String {
    let hint = recommendation
        .map(|r| {
            format!(
                "A pre-analysis pass suggested these hints (advisory, not binding): \
                 languages={:?}, agent types={:?}, stack={:?}, work areas={:?}, \
                 complexity={:?}.\n",
                r.languages, r.recommended_agent_types, r.technical_stack, r.suggested_work_areas, r.complexity
            )
        })
        .unwrap_or_default();

    format!(
        "You are Wyvern, a detailed task-decomposition agent. {hint}\
         Partition the specification below into an area-organized task list. \
         Respond with a single JSON object: {{\"tasks\": [{{\"id\": string, \
         \"description\": string, \"area\": string, \"agent_type\": string (one \
         of the closed agent-type catalog), \"depends_on\": [string] (ids of \
         other tasks in this same list), \"priority\": \"critical\"|\"high\"|\
         \"normal\"|\"low\" (optional, defaults to normal)}}]}}.\n\n---\n{specification}\n---"
    )
}

/// A fully resolved task list: local string ids replaced by real task
/// ids, ready to hand to the Tracker.
pub fn parse_response(text: &str, project_id: Uuid, specification_version: u64) -> Result<Vec<Task>> {
    let json = extract_json_object(text).context("wyvern response did not contain a JSON object")?;
    let raw: RawWyvernOutput = serde_json::from_str(&json).context("failed to parse wyvern task list JSON")?;

    if raw.tasks.is_empty() {
        bail!("wyvern produced an empty task list");
    }

    let mut id_map: HashMap<String, Uuid> = HashMap::new();
    let mut drafts = Vec::with_capacity(raw.tasks.len());
    for draft in raw.tasks {
        let Some(agent_type) = AgentType::parse(&draft.agent_type) else {
            bail!("wyvern assigned unknown agent type '{}' to task '{}'", draft.agent_type, draft.id);
        };
        let task_id = Uuid::new_v4();
        id_map.insert(draft.id.clone(), task_id);
        drafts.push((task_id, draft, agent_type));
    }

    let mut tasks = Vec::with_capacity(drafts.len());
    for (task_id, draft, agent_type) in drafts {
        let mut dependencies = Vec::with_capacity(draft.depends_on.len());
        for dep in &draft.depends_on {
            match id_map.get(dep) {
                Some(id) => dependencies.push(*id),
                None => bail!("task '{}' depends on unknown local id '{}'", draft.id, dep),
            }
        }

        let priority = draft.priority.as_deref().map(parse_priority).unwrap_or_default();
        let mut task = Task::new(project_id, draft.description, draft.area, agent_type, specification_version)
            .with_dependencies(dependencies)
            .with_priority(priority);
        task.id = task_id;
        tasks.push(task);
    }

    Ok(tasks)
}

/// Run one Wyvern pass, returning the resolved task list. Callers are
/// responsible for registering the tasks with the Tracker and flipping
/// the project's status.
pub async fn analyze(
    provider: &dyn Provider,
    specification: &str,
    recommendation: Option<&WyrmRecommendation>,
    project_id: Uuid,
    specification_version: u64,
) -> Result<Vec<Task>> {
    let prompt = build_prompt(specification, recommendation);
    let response = provider
        .send(&[Message::User { content: prompt }], &[], &SendOptions::default())
        .await
        .context("wyvern provider call failed")?;

    let text = response
        .content
        .iter()
        .find_map(|block| match block {
            crate::planning_context::provider::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .context("wyvern response contained no text block")?;

    parse_response(text, project_id, specification_version)
}
