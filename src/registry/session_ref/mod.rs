use std::sync::{Arc, Weak};
use std::{convert::Infallible, fmt};

use self::error::SessionGone;
use crate::session::StreamSession;
use crate::session_id::SessionId;

pub mod error;

/// A weak reference to a registry-owned [`StreamSession`] that provides a scoped
/// [`view`](Self::view).
///
/// The registry stays the only owner. The dispatcher and the multiplexer hold `SessionRef`s and
/// upgrade them only for the duration of a single operation, so removal from the registry is what
/// ends a session's life.
pub struct SessionRef {
    session_id: SessionId,
    weak_session: Weak<StreamSession>,
}

impl SessionRef {
    pub(super) fn new(session_id: SessionId, weak_session: Weak<StreamSession>) -> SessionRef {
        Self {
            session_id,
            weak_session,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Scoped access via a `view_fn` to the session.
    ///
    /// If the session still exists returns the value `R` computed from the `view_fn`, else
    /// returns a [`SessionGone`] error.
    pub fn view<F: FnOnce(&StreamSession) -> R, R>(&self, view_fn: F) -> Result<R, SessionGone> {
        Weak::upgrade(&self.weak_session)
            .map(|session| view_fn(&session))
            .ok_or_else(|| self.gone())
    }

    /// Temporarily upgrade for an operation that has to await, such as a queue hand-off.
    ///
    /// Callers must drop the returned handle as soon as the operation completes.
    pub(crate) fn upgrade(&self) -> Result<Arc<StreamSession>, SessionGone> {
        Weak::upgrade(&self.weak_session).ok_or_else(|| self.gone())
    }

    pub fn is_alive(&self) -> bool {
        self.weak_session.strong_count() > 0
    }

    fn gone(&self) -> SessionGone {
        SessionGone {
            session_id: self.session_id.clone(),
        }
    }
}

#[expect(clippy::missing_fields_in_debug, reason = "custom weak handling")]
impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view(|session| {
            f.debug_struct("SessionRef")
                .field("session_id", &self.session_id)
                .field("session", &Ok::<_, Infallible>(session))
                .finish()
        })
        .unwrap_or_else(|err| {
            f.debug_struct("SessionRef")
                .field("session_id", &self.session_id)
                .field("session", &Err::<Infallible, _>(err))
                .finish()
        })
    }
}

impl Clone for SessionRef {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            weak_session: self.weak_session.clone(),
        }
    }
}

/// A [`SessionRef`] is defined only by the underlying [`SessionId`] matching.
impl PartialEq<SessionId> for SessionRef {
    fn eq(&self, other: &SessionId) -> bool {
        self.session_id == *other
    }
}

/// A [`SessionRef`] is defined only by the underlying [`SessionId`] matching.
impl PartialEq<SessionRef> for SessionId {
    fn eq(&self, other: &SessionRef) -> bool {
        *self == other.session_id
    }
}
