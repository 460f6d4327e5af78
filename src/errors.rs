//! Typed error hierarchy for the Forge orchestrator.
//!
//! One enum per subsystem:
//! - `RegistryError` — project registry failures
//! - `RecoveryError` — retry scheduling and circuit-breaker failures
//! - `DragonError` — interactive session and council dispatch failures

use thiserror::Error;

/// Errors from the project registry (spec §4.1).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("project {id} not found")]
    NotFound { id: uuid::Uuid },

    #[error("illegal project status transition: {0}")]
    IllegalStatusTransition(String),

    #[error("illegal execution state transition: {0}")]
    IllegalExecutionStateTransition(String),

    #[error("failed to persist project registry to {path}: {source}")]
    PersistFailed {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from the recovery service and provider circuit breaker (spec §4.7).
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("task {task_id} not found in project {project_id}")]
    TaskNotFound { project_id: uuid::Uuid, task_id: uuid::Uuid },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from Dragon, the interactive session agent (spec §4.3).
#[derive(Debug, Error)]
pub enum DragonError {
    #[error("session {id} not found")]
    SessionNotFound { id: uuid::Uuid },

    #[error("failed to persist session store to {path}: {source}")]
    PersistFailed {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("every council member declined to handle the turn")]
    NoCouncilMemberAccepted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
