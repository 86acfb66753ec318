//! The Voice Session state machine's states and legal transitions (§4.6). Kept separate
//! from [`crate::db::models::CallState`]: that enum is the persisted projection, this one
//! is the in-memory actor state and additionally rejects illegal transitions at the type
//! level instead of silently clamping them.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Greeting,
    Idle,
    Listening,
    Thinking,
    Speaking,
    Ending,
    Ended,
}

#[derive(Debug, Error)]
#[error("illegal session transition from {from:?} to {to:?}")]
pub struct StateTransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Validate `self -> to` against the diagram in §4.6:
    /// `Connecting -> Greeting -> Idle -> Listening -> Thinking -> Speaking -> {Idle|Ending} -> Ended`,
    /// plus the barge-in shortcut `Speaking -> Listening`.
    pub fn validate_transition(&self, to: SessionState) -> Result<(), StateTransitionError> {
        let legal = matches!(
            (self, to),
            (SessionState::Connecting, SessionState::Greeting)
                | (SessionState::Greeting, SessionState::Idle)
                | (SessionState::Idle, SessionState::Listening)
                | (SessionState::Listening, SessionState::Thinking)
                | (SessionState::Thinking, SessionState::Speaking)
                | (SessionState::Thinking, SessionState::Ending)
                | (SessionState::Speaking, SessionState::Idle)
                | (SessionState::Speaking, SessionState::Listening)
                | (SessionState::Speaking, SessionState::Ending)
                | (SessionState::Idle, SessionState::Ending)
                | (SessionState::Listening, SessionState::Ending)
                | (SessionState::Ending, SessionState::Ended)
                | (_, SessionState::Ended)
        );
        if legal {
            Ok(())
        } else {
            Err(StateTransitionError { from: *self, to })
        }
    }
}
