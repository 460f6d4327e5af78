//! Dragon, the interactive session agent, and its council (spec §4.3).
//!
//! Dragon classifies each user turn into one of four sub-agents — Sage,
//! Seeker, Sentinel, Warden — dispatches to it, and falls back to Sage
//! if the chosen member declines. Conversation state lives in
//! [`SessionStore`], bounded and persisted the way the project registry
//! persists projects.

pub mod council;
pub mod sage;
pub mod seeker;
pub mod sentinel;
pub mod sessions;
pub mod warden;

use std::sync::Arc;

use forge_common::{Session, SessionMessage, SessionRole};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::errors::DragonError;
use crate::planning_context::provider::Provider;
use crate::registry::ProjectRegistry;
use crate::tracker::TaskTracker;
use council::CouncilMember;
use sessions::SessionStore;

/// How many recent messages Dragon folds into the prompt it hands a
/// council member — enough for short-term context without re-sending
/// the entire bounded history on every turn.
const PROMPT_HISTORY_WINDOW: usize = 10;

pub struct Dragon {
    sessions: SessionStore,
    registry: ProjectRegistry,
    tracker: TaskTracker,
    provider: Arc<dyn Provider>,
}

/// The outcome of one user turn: which member answered and what they
/// said, plus whether the client's session id was recognized (spec §4.3
/// reconnect handling — the caller sends `session_not_found` plus this
/// session's fresh id when `session_known` is `false` and a
/// `session_id` was supplied).
pub struct TurnOutcome {
    pub session_id: Uuid,
    pub session_known: bool,
    pub council_member: CouncilMember,
    pub reply: String,
}

impl Dragon {
    pub fn new(
        sessions: SessionStore,
        registry: ProjectRegistry,
        tracker: TaskTracker,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self { sessions, registry, tracker, provider }
    }

    #[instrument(skip(self, text), fields(session_id = ?session_id, project_id = ?project_id))]
    pub async fn handle_turn(
        &self,
        session_id: Option<Uuid>,
        project_id: Option<Uuid>,
        text: &str,
    ) -> Result<TurnOutcome, DragonError> {
        let resolved = self.sessions.resolve(session_id, project_id).await?;
        let session = resolved.session;

        self.sessions.append(session.id, SessionMessage::new(SessionRole::User, text)).await?;

        let history = render_history(&session);
        let first_choice = council::classify_intent(text);
        let (member, reply) = self.dispatch(first_choice, project_id, &history, text).await?;

        self.sessions
            .append(session.id, SessionMessage::from_council(member.as_str(), reply.clone()))
            .await?;

        info!(session_id = %session.id, council_member = %member, "dragon turn handled");
        Ok(TurnOutcome { session_id: session.id, session_known: resolved.known, council_member: member, reply })
    }

    async fn dispatch(
        &self,
        first_choice: CouncilMember,
        project_id: Option<Uuid>,
        history: &str,
        text: &str,
    ) -> Result<(CouncilMember, String), DragonError> {
        match first_choice {
            CouncilMember::Seeker => {
                if let Some(reply) = self.try_seeker(project_id, text).await {
                    return Ok((CouncilMember::Seeker, reply));
                }
            }
            CouncilMember::Sentinel => {
                if let Some(reply) = self.try_sentinel(project_id, text).await {
                    return Ok((CouncilMember::Sentinel, reply));
                }
            }
            CouncilMember::Warden => {
                if let Some(reply) = self.try_warden(project_id, text).await {
                    return Ok((CouncilMember::Warden, reply));
                }
            }
            CouncilMember::Sage => {}
        }

        let sage_reply = sage::respond(&self.provider, &self.registry, project_id, history, text)
            .await
            .map_err(|e| DragonError::Other(e.into()))?;
        Ok((CouncilMember::Sage, sage_reply.text))
    }

    async fn try_seeker(&self, project_id: Option<Uuid>, text: &str) -> Option<String> {
        let path = match seeker::extract_path_arg(text) {
            Some(path) => path,
            None => {
                let project = self.registry.get(project_id?).await.ok()?;
                project.workspace_root
            }
        };
        let summary = seeker::scan_directory(&path).ok()?;
        Some(seeker::draft_specification(&path, &summary))
    }

    async fn try_sentinel(&self, project_id: Option<Uuid>, text: &str) -> Option<String> {
        let project = self.registry.get(project_id?).await.ok()?;
        let reply = if let Some(branch) = sentinel::parse_merge_target(text) {
            sentinel::merge(&project.workspace_root, branch).await
        } else {
            sentinel::status(&project.workspace_root).await
        };
        Some(match reply {
            sentinel::SentinelReply::Status(s) => s,
            sentinel::SentinelReply::MergeOk(s) => format!("merge succeeded: {s}"),
            sentinel::SentinelReply::MergeFailed(s) => format!("merge failed: {s}"),
        })
    }

    async fn try_warden(&self, project_id: Option<Uuid>, text: &str) -> Option<String> {
        let intent = warden::parse_intent(text)?;
        let project_id = project_id?;
        let task_id = extract_uuid_arg(text);
        let reply = warden::apply(&self.registry, &self.tracker, project_id, task_id, intent).await.ok()?;
        match reply {
            warden::WardenReply::ExecutionStateChanged(state) => Some(format!("execution state is now {state:?}")),
            warden::WardenReply::TaskRetried => Some("task requeued for retry".to_string()),
            warden::WardenReply::Declined(_) => None,
        }
    }
}

fn extract_uuid_arg(text: &str) -> Option<Uuid> {
    text.split_whitespace().find_map(|tok| Uuid::parse_str(tok.trim_matches(|c: char| !c.is_alphanumeric() && c != '-')).ok())
}

fn render_history(session: &Session) -> String {
    session
        .history
        .iter()
        .rev()
        .take(PROMPT_HISTORY_WINDOW)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|m| match m.role {
            SessionRole::User => format!("User: {}", m.content),
            SessionRole::Dragon => format!("Dragon: {}", m.content),
            SessionRole::Council => {
                format!("{}: {}", m.council_member.as_deref().unwrap_or("council"), m.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning_context::provider::ScriptedProvider;
    use std::path::PathBuf;

    async fn dragon(dir: &std::path::Path, script: Vec<Result<crate::planning_context::provider::ProviderResponse, crate::planning_context::provider::ProviderError>>) -> Dragon {
        let sessions = SessionStore::load(dir).await.unwrap();
        let registry = ProjectRegistry::load(dir).await.unwrap();
        let tracker = TaskTracker::new();
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new("scripted", script));
        Dragon::new(sessions, registry, tracker, provider)
    }

    #[tokio::test]
    async fn unrecognized_turn_falls_through_to_sage() {
        let dir = tempfile::tempdir().unwrap();
        let d = dragon(dir.path(), vec![ScriptedProvider::text_response("let's talk about your app")]).await;

        let outcome = d.handle_turn(None, None, "I want to build a todo app").await.unwrap();
        assert_eq!(outcome.council_member, CouncilMember::Sage);
        assert!(!outcome.session_known);
    }

    #[tokio::test]
    async fn reconnecting_with_the_returned_session_id_is_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let d = dragon(
            dir.path(),
            vec![ScriptedProvider::text_response("first"), ScriptedProvider::text_response("second")],
        )
        .await;

        let first = d.handle_turn(None, None, "hello").await.unwrap();
        let second = d.handle_turn(Some(first.session_id), None, "hello again").await.unwrap();
        assert!(second.session_known);
        assert_eq!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn pause_turn_with_a_bound_project_is_handled_by_warden() {
        let dir = tempfile::tempdir().unwrap();
        let d = dragon(dir.path(), vec![]).await;
        let project = d.registry.create("demo", PathBuf::from("/tmp/demo"), "spec").await.unwrap();

        let outcome = d.handle_turn(None, Some(project.id), "/pause").await.unwrap();
        assert_eq!(outcome.council_member, CouncilMember::Warden);
        assert!(outcome.reply.contains("Paused"));
    }

    #[tokio::test]
    async fn pause_turn_without_a_bound_project_declines_to_sage() {
        let dir = tempfile::tempdir().unwrap();
        let d = dragon(dir.path(), vec![ScriptedProvider::text_response("no project is bound yet")]).await;

        let outcome = d.handle_turn(None, None, "/pause").await.unwrap();
        assert_eq!(outcome.council_member, CouncilMember::Sage);
    }

    #[tokio::test]
    async fn import_turn_with_an_explicit_path_is_handled_by_seeker() {
        let dir = tempfile::tempdir().unwrap();
        let scan_target = tempfile::tempdir().unwrap();
        std::fs::write(scan_target.path().join("main.rs"), "").unwrap();
        let d = dragon(dir.path(), vec![]).await;

        let turn = format!("/import {}", scan_target.path().display());
        let outcome = d.handle_turn(None, None, &turn).await.unwrap();
        assert_eq!(outcome.council_member, CouncilMember::Seeker);
        assert!(outcome.reply.contains("rust"));
    }
}
