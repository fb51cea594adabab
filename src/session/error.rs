use crate::session_id::SessionId;
use crate::state_machine::session::{SessionInput, SessionState};

/// Indicates that a session refused a state transition because of its current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session {session_id} cannot apply {input:?} while {state}")]
pub struct InvalidTransition {
    pub session_id: SessionId,
    pub state: SessionState,
    pub input: SessionInput,
}
