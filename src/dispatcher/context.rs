use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::registry::SessionRef;
use crate::session::SessionState;
use crate::session_id::SessionId;

/// What a handler knows about the call it is serving.
///
/// Handlers that loop without touching their inbound stream must poll
/// [`is_cancelled`](Self::is_cancelled) or race [`cancelled`](Self::cancelled) so they notice
/// cancellation and idle timeouts.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: SessionRef,
    operation: Arc<str>,
    cancel_token: CancellationToken,
}

impl SessionContext {
    pub(crate) fn new(
        session: SessionRef,
        operation: Arc<str>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            session,
            operation,
            cancel_token,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.session_id()
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Current session state, or `None` if the session is already gone.
    pub fn state(&self) -> Option<SessionState> {
        self.session.view(|session| session.state()).ok()
    }
}
