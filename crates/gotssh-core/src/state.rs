//! Session lifecycle state machine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport; the initial and the post-disconnect state
    Disconnected,
    /// Dialing and running the key exchange
    Connecting,
    /// Credentials accepted, forwards not yet restored
    Authenticated,
    /// Ready; forwards are running
    Active,
    /// The transport failed; the error is recorded on the session
    Failed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticated)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Authenticated, Active)
                | (Authenticated, Failed)
                | (Authenticated, Disconnected)
                | (Active, Failed)
                | (Active, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }

    /// Validate and perform a transition, returning the new state.
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SessionError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Forward rules may only be added in these states
    pub fn accepts_forwards(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Active)
    }

    /// No usable transport
    pub fn is_down(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Active => write!(f, "active"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}
