//! Warden: configuration, execution control, and retry dispatch (spec §4.3).

use forge_common::ExecutionState;
use uuid::Uuid;

use crate::errors::RegistryError;
use crate::registry::ProjectRegistry;
use crate::tracker::TaskTracker;

pub enum WardenReply {
    ExecutionStateChanged(ExecutionState),
    TaskRetried,
    Declined(&'static str),
}

/// The execution-control intent a user turn asks for, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardenIntent {
    Pause,
    Resume,
    Suspend,
    Cancel,
    Retry,
}

/// Parse a `/pause` style slash command or a free-text equivalent into
/// an execution-control intent.
pub fn parse_intent(text: &str) -> Option<WardenIntent> {
    let lower = text.trim().trim_start_matches('/').to_lowercase();
    let first_word = lower.split_whitespace().next()?;
    match first_word {
        "pause" => Some(WardenIntent::Pause),
        "resume" => Some(WardenIntent::Resume),
        "suspend" => Some(WardenIntent::Suspend),
        "cancel" => Some(WardenIntent::Cancel),
        "retry" => Some(WardenIntent::Retry),
        _ if lower.contains("pause") => Some(WardenIntent::Pause),
        _ if lower.contains("resume") => Some(WardenIntent::Resume),
        _ if lower.contains("suspend") => Some(WardenIntent::Suspend),
        _ if lower.contains("cancel") => Some(WardenIntent::Cancel),
        _ if lower.contains("retry") => Some(WardenIntent::Retry),
        _ => None,
    }
}

/// Apply an execution-control intent to a project, or retry a specific
/// task. `task_id` is only consulted for [`WardenIntent::Retry`].
pub async fn apply(
    registry: &ProjectRegistry,
    tracker: &TaskTracker,
    project_id: Uuid,
    task_id: Option<Uuid>,
    intent: WardenIntent,
) -> Result<WardenReply, RegistryError> {
    let target_state = match intent {
        WardenIntent::Pause => ExecutionState::Paused,
        WardenIntent::Resume => ExecutionState::Running,
        WardenIntent::Suspend => ExecutionState::Suspended,
        WardenIntent::Cancel => ExecutionState::Cancelled,
        WardenIntent::Retry => {
            return match task_id {
                Some(task_id) => match tracker.retry(project_id, task_id).await {
                    Ok(_) => Ok(WardenReply::TaskRetried),
                    Err(_) => Ok(WardenReply::Declined("that task isn't eligible for retry")),
                },
                None => Ok(WardenReply::Declined("no task id given to retry")),
            };
        }
    };

    let updated = registry.set_execution_state(project_id, target_state).await?;
    Ok(WardenReply::ExecutionStateChanged(updated.execution_state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_intent_recognizes_slash_and_free_text() {
        assert_eq!(parse_intent("/pause"), Some(WardenIntent::Pause));
        assert_eq!(parse_intent("can you resume the project"), Some(WardenIntent::Resume));
        assert_eq!(parse_intent("hello there"), None);
    }

    #[tokio::test]
    async fn pause_transitions_a_running_project() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::load(dir.path()).await.unwrap();
        let tracker = TaskTracker::new();
        let project = registry.create("demo", PathBuf::from("/tmp/demo"), "spec").await.unwrap();

        let reply = apply(&registry, &tracker, project.id, None, WardenIntent::Pause).await.unwrap();
        assert!(matches!(reply, WardenReply::ExecutionStateChanged(ExecutionState::Paused)));
    }

    #[tokio::test]
    async fn retry_without_a_task_id_declines() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProjectRegistry::load(dir.path()).await.unwrap();
        let tracker = TaskTracker::new();
        let project = registry.create("demo", PathBuf::from("/tmp/demo"), "spec").await.unwrap();

        let reply = apply(&registry, &tracker, project.id, None, WardenIntent::Retry).await.unwrap();
        assert!(matches!(reply, WardenReply::Declined(_)));
    }
}
