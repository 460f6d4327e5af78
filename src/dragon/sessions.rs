//! Disk-backed store of Dragon conversations (spec §4.3).
//!
//! Mirrors the project registry: one JSON document, one lock held
//! across both the mutation and the atomic write so the file on disk
//! never reflects a half-applied append.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forge_common::{Session, SessionMessage};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::errors::DragonError;
use crate::util::write_json_atomic;

const SESSIONS_FILE: &str = "sessions.json";

/// Thread-safe, disk-backed store of every interactive session.
#[derive(Clone)]
pub struct SessionStore {
    path: PathBuf,
    index: Arc<RwLock<HashMap<Uuid, Session>>>,
}

/// Result of resolving a client-supplied session id (spec §4.3
/// "`session_not_found`" reconnect handling).
pub struct Resolved {
    pub session: Session,
    /// `false` when the client asked to resume a session id the server
    /// has no record of — the caller sends `session_not_found` and a
    /// fresh id, and the client chooses replay/fresh/keep-local.
    pub known: bool,
}

impl SessionStore {
    #[instrument(skip(forge_dir), fields(forge_dir = %forge_dir.as_ref().display()))]
    pub async fn load(forge_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let forge_dir = forge_dir.as_ref();
        std::fs::create_dir_all(forge_dir)?;
        let path = forge_dir.join(SESSIONS_FILE);

        let sessions: Vec<Session> = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };
        info!(count = sessions.len(), "loaded session store");

        let index = sessions.into_iter().map(|s| (s.id, s)).collect();
        Ok(Self { path, index: Arc::new(RwLock::new(index)) })
    }

    fn persist_locked(&self, index: &HashMap<Uuid, Session>) -> Result<(), DragonError> {
        let mut sessions: Vec<&Session> = index.values().collect();
        sessions.sort_by_key(|s| s.created_at);
        write_json_atomic(&self.path, &sessions).map_err(|source| DragonError::PersistFailed {
            path: self.path.clone(),
            source,
        })
    }

    /// Resolve an incoming turn's session id: reuse it if known, start a
    /// fresh session bound to `project_id` otherwise.
    pub async fn resolve(
        &self,
        session_id: Option<Uuid>,
        project_id: Option<Uuid>,
    ) -> Result<Resolved, DragonError> {
        let mut guard = self.index.write().await;

        if let Some(id) = session_id {
            if let Some(session) = guard.get(&id) {
                return Ok(Resolved { session: session.clone(), known: true });
            }
        }

        let session = Session::new(project_id);
        guard.insert(session.id, session.clone());
        self.persist_locked(&guard)?;
        Ok(Resolved { session, known: session_id.is_none() })
    }

    #[instrument(skip(self, message))]
    pub async fn append(&self, session_id: Uuid, message: SessionMessage) -> Result<Session, DragonError> {
        let mut guard = self.index.write().await;
        let session = guard.get_mut(&session_id).ok_or(DragonError::SessionNotFound { id: session_id })?;
        session.push(message);
        let snapshot = session.clone();
        self.persist_locked(&guard)?;
        Ok(snapshot)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Session, DragonError> {
        self.index
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(DragonError::SessionNotFound { id: session_id })
    }

    /// Reset a session's history to empty without losing its id or
    /// project binding (the ws transport's `clear_context` frame).
    pub async fn clear(&self, session_id: Uuid) -> Result<Session, DragonError> {
        let mut guard = self.index.write().await;
        let session = guard.get_mut(&session_id).ok_or(DragonError::SessionNotFound { id: session_id })?;
        session.history.clear();
        let snapshot = session.clone();
        self.persist_locked(&guard)?;
        Ok(snapshot)
    }

    /// Drop every session idle past `SESSION_IDLE_TIMEOUT_SECS`, returning
    /// how many were evicted.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> Result<usize, DragonError> {
        let mut guard = self.index.write().await;
        let before = guard.len();
        guard.retain(|_, s| !s.is_idle(now));
        let evicted = before - guard.len();
        if evicted > 0 {
            self.persist_locked(&guard)?;
        }
        Ok(evicted)
    }
}
