//! A Kobold worker: the plan-then-execute loop a single task runs
//! through (spec §4.5.2, §4.5.3). One worker owns one task end to end —
//! planning, the iterative tool loop, periodic reflection, and the
//! final outcome the Supervisor folds back into the Tracker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use forge_common::{
    Decision, ErrorCategory, ImplementationStep, Plan, Reflection, StepStatus, Task, WorkerId,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::planning_context::SharedPlanningContext;
use crate::planning_context::TaskInsights;
use crate::planning_context::provider::{ContentBlock, Message, Provider, ProviderError, SendOptions, StopReason};
use crate::planning_context::sandbox::Sandbox;
use crate::supervisor::plan_store::PlanStore;
use crate::supervisor::tools::{self, catalog_for};
use crate::util::extract_json_object;

#[derive(Debug, Clone, Copy)]
pub struct KoboldConfig {
    /// Total iteration budget across the whole task (spec `MaxIterations`).
    pub max_iterations: u32,
    /// Per-step ceiling (spec `MaxIterationsPerStep`).
    pub max_iterations_per_step: u32,
    /// Reflection cadence in iterations (spec default 3).
    pub reflect_every: u32,
    /// `[0.0, 1.0]`; below this a reflection forces `Stuck` (spec default 30/100).
    pub low_confidence_threshold: f64,
}

impl Default for KoboldConfig {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            max_iterations_per_step: 10,
            reflect_every: 3,
            low_confidence_threshold: 0.30,
        }
    }
}

/// Where (and whether) to persist this worker's evolving plan as steps
/// complete, so a worker that resumes this task later loads the same
/// plan back in rather than redrafting it (spec §3 "a later worker can
/// resume").
#[derive(Clone)]
pub struct PlanPersistence {
    pub store: PlanStore,
    pub project_name: String,
}

/// Everything a worker needs to run its task to completion, gathered by
/// the Supervisor before spawning.
pub struct KoboldContext {
    pub worker_id: WorkerId,
    pub task: Task,
    pub specification: String,
    /// The project's current specification version, possibly newer than
    /// `task.specification_version` (spec §4.5.3 drift check).
    pub current_specification_version: u64,
    /// Output-file manifests of this task's `Done` dependencies, keyed
    /// by dependency task id.
    pub dependency_output_files: HashMap<Uuid, Vec<String>>,
    pub provider: Arc<dyn Provider>,
    pub sandbox: Sandbox,
    pub insights: Option<TaskInsights>,
    pub config: KoboldConfig,
    /// The file-claim map every worker in this project shares (spec
    /// §4.6) — consulted before any `write_file` lands on disk.
    pub planning_context: SharedPlanningContext,
    /// A plan the Supervisor already drafted (or loaded from disk) and
    /// claimed files against before spawning this worker. When present,
    /// the worker executes it directly instead of drafting its own.
    pub initial_plan: Option<Plan>,
    pub plan_persistence: Option<PlanPersistence>,
}

/// Events a running worker emits for the Supervisor's stuck-detection
/// heuristics (spec §4.5.4) and the reasoning monitor (spec §4.5.5).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Heartbeat,
    Reflected(Reflection),
    FileWritten(PathBuf),
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Done { output_files: Vec<String>, plan: Plan },
    Failed { category: ErrorCategory, message: String },
}

#[derive(Debug, Deserialize)]
struct RawStepDraft {
    description: String,
    #[serde(default)]
    target_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawStepDraft>,
}

pub fn build_planning_prompt(task: &Task, specification: &str, insights: Option<&TaskInsights>) -> String {
    let insight_hint = insights
        .map(|i| {
            format!(
                "\nHistorical performance for this agent type on similar work: success rate {:.0}%, \
                 average {:.0} iterations per step, recurring blockers: {:?}.\n",
                i.success_rate * 100.0,
                i.avg_iterations_per_step,
                i.recurring_blockers
            )
        })
        .unwrap_or_default();

    format!(
        "You are planning the implementation of one task. Task: {}\nArea: {}\n{insight_hint}\
         Respond with a single JSON object: {{\"steps\": [{{\"description\": string, \
         \"target_files\": [string]}}]}}. Emit at least one step.\n\n---\n{specification}\n---",
        task.description, task.area
    )
}

pub fn parse_plan_response(text: &str, task_id: Uuid) -> Result<Plan> {
    let json = extract_json_object(text).context("planner response did not contain a JSON object")?;
    let raw: RawPlan = serde_json::from_str(&json).context("failed to parse planner JSON")?;
    if raw.steps.is_empty() {
        bail!("planner produced an empty plan");
    }
    let steps = raw
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, d)| ImplementationStep::new((i + 1) as u32, d.description).with_target_files(d.target_files))
        .collect();
    Ok(Plan::new(task_id, steps))
}

/// Draft a plan against `provider` for one task. Called either by the
/// Supervisor at scheduling time (so it can claim the plan's
/// anticipated files before spawning a worker, spec §4.5.1 step 5) or
/// by the worker itself as a fallback when no plan was handed to it.
pub async fn draft_plan(
    provider: &dyn Provider,
    task: &Task,
    specification: &str,
    insights: Option<&TaskInsights>,
) -> Result<Plan> {
    let prompt = build_planning_prompt(task, specification, insights);
    let response = provider
        .send(&[Message::User { content: prompt }], &[], &SendOptions::default())
        .await
        .context("planner provider call failed")?;
    let text = response
        .content
        .iter()
        .find_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .context("planner response contained no text block")?;
    parse_plan_response(text, task.id)
}

async fn plan_task(ctx: &KoboldContext) -> Result<Plan> {
    draft_plan(&*ctx.provider, &ctx.task, &ctx.specification, ctx.insights.as_ref()).await
}

/// Progressive detail reveal (spec §4.5.3): full detail on the current
/// step, title+description for the next two, titles only beyond that.
fn build_step_prompt(ctx: &KoboldContext, plan: &Plan, step_idx: usize) -> String {
    let mut out = format!(
        "Task: {}\nCurrent step ({}/{}): {}\nTarget files: {:?}\n",
        ctx.task.description,
        step_idx + 1,
        plan.steps.len(),
        plan.steps[step_idx].description,
        plan.steps[step_idx].target_files,
    );

    for step in plan.steps.iter().skip(step_idx + 1).take(2) {
        out.push_str(&format!("Upcoming step {}: {}\n", step.ordinal, step.description));
    }
    for step in plan.steps.iter().skip(step_idx + 3) {
        out.push_str(&format!("Later step {}\n", step.ordinal));
    }

    if !ctx.dependency_output_files.is_empty() {
        out.push_str("Files produced by completed dependencies:\n");
        for (dep_id, files) in &ctx.dependency_output_files {
            out.push_str(&format!("  {dep_id}: {files:?}\n"));
        }
    }

    out.push_str(
        "Use the available tools to make progress. Call `reflect` roughly every few actions to \
         report a checkpoint, and call `complete_step` once this step is fully done.\n",
    );
    out
}

fn parse_reflection(ctx: &KoboldContext, worker_id: WorkerId, task_id: Uuid, input: &serde_json::Value) -> Reflection {
    let progress_percent = input.get("progress_percent").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let confidence_raw = input.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5);
    // Accept either a [0,1] or [0,100] confidence scale from the model.
    let confidence = if confidence_raw > 1.0 { confidence_raw / 100.0 } else { confidence_raw };
    let decision = match input.get("decision").and_then(|v| v.as_str()) {
        Some("complete") => Decision::Complete,
        Some("escalate") => Decision::Escalate,
        _ => Decision::Continue,
    };
    let mut reflection = Reflection::new(worker_id.0, task_id, progress_percent, confidence, decision);
    reflection.files_done = input
        .get("files_done")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    reflection.blockers = input
        .get("blockers")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    reflection.notes = input.get("notes").and_then(|v| v.as_str()).map(str::to_string);
    let _ = ctx;
    reflection
}

/// Claim the target path for this worker before it touches disk, so two
/// workers racing on the same file never both succeed (spec §4.6,
/// testable property #2). A path already held by a different live
/// worker is reported back to the model as a tool error rather than
/// aborting the task — it can reflect, pick different work, or retry
/// once the step loop revisits it.
async fn claim_then_write(ctx: &KoboldContext, input: &serde_json::Value) -> Result<PathBuf> {
    let path = input
        .get("path")
        .and_then(|v| v.as_str())
        .context("write_file call missing 'path'")?;
    let (granted, existing) = ctx.planning_context.try_claim(PathBuf::from(path), ctx.worker_id, ctx.task.id).await;
    if !granted {
        let holder = existing.map(|c| c.task_id).unwrap_or(ctx.task.id);
        bail!("'{path}' is already claimed by task {holder}; defer this write and try a different step");
    }
    let written = tools::dispatch_fs_tool(&ctx.sandbox, tools::WRITE_FILE, input).await?;
    let _ = written;
    Ok(PathBuf::from(path))
}

/// Translate a provider failure into the error category Recovery uses
/// to decide retry eligibility (spec §4.7).
fn category_from_provider_error(err: &ProviderError) -> ErrorCategory {
    match err {
        ProviderError::RequestFailed { category, .. } => *category,
        ProviderError::NoProviderBound(_) | ProviderError::NotRegistered(_) => ErrorCategory::Permanent,
    }
}

/// Run one task to completion (or failure). The Supervisor is
/// responsible for folding the outcome back into the Tracker and the
/// Shared Planning Context; this function only emits progress events.
pub async fn run_worker(ctx: KoboldContext, events: mpsc::Sender<WorkerEvent>) -> WorkerOutcome {
    if ctx.task.specification_version < ctx.current_specification_version {
        warn!(
            task_id = %ctx.task.id,
            captured = ctx.task.specification_version,
            current = ctx.current_specification_version,
            "specification drifted since task creation; reloading and continuing"
        );
    }

    let mut plan = match ctx.initial_plan.clone() {
        Some(p) => p,
        None => match plan_task(&ctx).await {
            Ok(p) => p,
            Err(e) => return WorkerOutcome::Failed { category: ErrorCategory::Unknown, message: e.to_string() },
        },
    };

    let total_steps = (plan.steps.len() as u32).max(1);
    let per_step_budget = (ctx.config.max_iterations / total_steps + 2).min(ctx.config.max_iterations_per_step);

    let mask = ctx.task.agent_type.permission_mask();
    let tool_catalog = catalog_for(mask);

    loop {
        let Some(step_idx) = plan
            .steps
            .iter()
            .position(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
        else {
            break;
        };
        plan.steps[step_idx].status = StepStatus::InProgress;

        let mut messages = vec![Message::User { content: build_step_prompt(&ctx, &plan, step_idx) }];
        let mut step_done = false;
        let mut iterations_used = 0u32;
        let mut iterations_since_reflect = 0u32;

        while iterations_used < per_step_budget {
            iterations_used += 1;
            let _ = events.send(WorkerEvent::Heartbeat).await;

            let response = match ctx.provider.send(&messages, &tool_catalog, &SendOptions::default()).await {
                Ok(r) => r,
                Err(e) => {
                    return WorkerOutcome::Failed { category: category_from_provider_error(&e), message: e.to_string() };
                }
            };

            messages.push(Message::Assistant { content: response.content.clone() });

            let mut dispatched_any = false;
            for block in &response.content {
                let ContentBlock::ToolUse { id, name, input } = block else { continue };
                dispatched_any = true;

                let result_text = match name.as_str() {
                    tools::REFLECT => {
                        iterations_since_reflect = 0;
                        let reflection = parse_reflection(&ctx, ctx.worker_id, ctx.task.id, input);
                        if reflection.decision == Decision::Complete {
                            step_done = true;
                        }
                        let _ = events.send(WorkerEvent::Reflected(reflection)).await;
                        "reflection recorded".to_string()
                    }
                    tools::COMPLETE_STEP => {
                        step_done = true;
                        "step marked complete".to_string()
                    }
                    tools::WRITE_FILE => match claim_then_write(&ctx, input).await {
                        Ok(written) => {
                            let _ = events.send(WorkerEvent::FileWritten(written)).await;
                            "wrote file".to_string()
                        }
                        Err(e) => format!("error: {e}"),
                    },
                    other => match tools::dispatch_fs_tool(&ctx.sandbox, other, input).await {
                        Ok(out) => out,
                        Err(e) => format!("error: {e}"),
                    },
                };
                messages.push(Message::ToolResult { tool_use_id: id.clone(), content: result_text });
            }

            iterations_since_reflect += 1;
            if !dispatched_any && response.stop_reason == StopReason::EndTurn {
                step_done = true;
            }
            if step_done {
                break;
            }
            let _ = iterations_since_reflect; // cadence is advisory; the model decides when to reflect
        }

        let targets_exist = plan.steps[step_idx]
            .target_files
            .iter()
            .all(|f| ctx.sandbox.resolve(Path::new(f)).map(|p| p.exists()).unwrap_or(false));

        if step_done || targets_exist {
            plan.steps[step_idx].status = StepStatus::Done;
            plan.touch();
            if let Some(persistence) = &ctx.plan_persistence {
                if let Err(e) = persistence.store.save(&persistence.project_name, &plan) {
                    warn!(task_id = %ctx.task.id, error = %e, "failed to persist plan progress");
                }
            }
        } else {
            return WorkerOutcome::Failed {
                category: ErrorCategory::Unknown,
                message: format!(
                    "step {} ('{}') exhausted its {}-iteration budget without completing",
                    step_idx + 1,
                    plan.steps[step_idx].description,
                    per_step_budget
                ),
            };
        }
    }

    WorkerOutcome::Done { output_files: plan.all_target_files(), plan }
}
