use std::time::SystemTime;

use crate::session_id::SessionId;

/// Advisory lifecycle notification for a session. Nothing in the engine depends on delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub session_id: SessionId,
    pub kind: LifecycleKind,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Created,
    Closed,
    Cancelled,
    TimedOut,
}

impl LifecycleEvent {
    pub fn now(session_id: SessionId, kind: LifecycleKind) -> Self {
        Self {
            session_id,
            kind,
            timestamp: SystemTime::now(),
        }
    }
}
