//! Session data models.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Directory created, segmentation in progress.
    Processing,
    /// Result on disk, not downloaded yet.
    Pending,
    /// Result downloaded at least once.
    Delivered,
    /// Directory removed.
    Reaped,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Processing, Pending)
                | (Pending, Delivered)
                | (Delivered, Delivered)
                | (Processing, Reaped)
                | (Pending, Reaped)
                | (Delivered, Reaped)
        )
    }

    /// Whether the reaper may remove a session in this state.
    pub fn is_reapable(self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Delivered)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Processing => "processing",
            SessionState::Pending => "pending",
            SessionState::Delivered => "delivered",
            SessionState::Reaped => "reaped",
        };
        f.write_str(name)
    }
}

/// Handle returned when a session is created.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub dir: PathBuf,
}

/// Registry entry for a live session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub dir: PathBuf,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// When the result was written.
    pub ready_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            state: SessionState::Processing,
            created_at: Utc::now(),
            ready_at: None,
            delivered_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_round_trips_through_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_session_id_rejects_paths() {
        assert!("../etc".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_transitions() {
        use SessionState::*;
        assert!(Processing.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Delivered));
        assert!(Processing.can_transition_to(Reaped));
        assert!(!Pending.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Delivered));
        assert!(!Reaped.can_transition_to(Pending));
    }

    #[test]
    fn test_processing_is_not_reapable() {
        assert!(!SessionState::Processing.is_reapable());
        assert!(SessionState::Pending.is_reapable());
        assert!(SessionState::Delivered.is_reapable());
    }
}
