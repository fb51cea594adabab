use crate::session::SessionState;
use crate::session_id::SessionId;

/// Errors raised by the [`SessionRegistry`](super::SessionRegistry). They are invariant
/// violations and are always surfaced to the caller, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session {session_id} already exists")]
    DuplicateSession { session_id: SessionId },

    #[error("session limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("session {session_id} could not be found")]
    NotFound { session_id: SessionId },

    #[error("session {session_id} is still {state} and cannot be removed")]
    SessionStillActive {
        session_id: SessionId,
        state: SessionState,
    },
}
