use crate::session_id::SessionId;

/// Indicates that a weakly held session is gone because the registry removed it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the session ({session_id}) is no longer valid")]
pub struct SessionGone {
    pub session_id: SessionId,
}
