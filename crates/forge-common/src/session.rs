//! Dragon's interactive conversation state (spec §3 "Session", §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Idle timeout after which a session is eligible for eviction (spec §4.3).
pub const SESSION_IDLE_TIMEOUT_SECS: i64 = 10 * 60;

/// How many messages a session retains before the oldest are dropped
/// (spec §4.3 "bounded history").
pub const SESSION_HISTORY_CAPACITY: usize = 100;

/// Who authored a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    User,
    Dragon,
    /// A council sub-agent spoke; `council_member` on the message
    /// records which one (Sage/Seeker/Sentinel/Warden).
    Council,
}

/// A single turn in a Dragon conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: Uuid,
    pub role: SessionRole,
    #[serde(default)]
    pub council_member: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(role: SessionRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            council_member: None,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn from_council(member: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: SessionRole::Council,
            council_member: Some(member.into()),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// One interactive Dragon conversation, scoped to an optional project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub history: VecDeque<SessionMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(project_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            history: VecDeque::new(),
            created_at: now,
            last_active_at: now,
        }
    }

    /// Append a message, evicting the oldest entry once the bounded
    /// history capacity is exceeded.
    pub fn push(&mut self, message: SessionMessage) {
        self.last_active_at = Utc::now();
        self.history.push_back(message);
        while self.history.len() > SESSION_HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_active_at).num_seconds() >= SESSION_IDLE_TIMEOUT_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut s = Session::new(None);
        for i in 0..(SESSION_HISTORY_CAPACITY + 10) {
            s.push(SessionMessage::new(SessionRole::User, format!("msg {i}")));
        }
        assert_eq!(s.history.len(), SESSION_HISTORY_CAPACITY);
        assert_eq!(s.history.front().unwrap().content, "msg 10");
    }

    #[test]
    fn idle_detection_uses_configured_timeout() {
        let mut s = Session::new(None);
        s.last_active_at = Utc::now() - chrono::Duration::seconds(SESSION_IDLE_TIMEOUT_SECS + 1);
        assert!(s.is_idle(Utc::now()));
        s.last_active_at = Utc::now();
        assert!(!s.is_idle(Utc::now()));
    }

    #[test]
    fn council_messages_record_the_member() {
        let m = SessionMessage::from_council("sage", "drafted a specification");
        assert_eq!(m.role, SessionRole::Council);
        assert_eq!(m.council_member.as_deref(), Some("sage"));
    }
}
