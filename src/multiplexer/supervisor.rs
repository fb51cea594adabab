use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{SessionRef, SessionRegistry};
use crate::session::CancelReason;

/// Watch over one session until it can be dropped from the registry.
///
/// While the session is live, it is cancelled with [`CancelReason::IdleTimeout`] once
/// `idle_timeout` passes without inbound or outbound activity. Once it is terminal and `flushed`
/// fires (the pump delivered its end of stream, or the connection went away), it is removed.
pub(crate) async fn supervise(
    registry: Arc<SessionRegistry>,
    session: SessionRef,
    idle_timeout: Option<Duration>,
    flushed: CancellationToken,
) {
    let Ok(mut state) = session.view(|s| s.subscribe_state()) else {
        return;
    };

    loop {
        let deadline = match idle_timeout {
            Some(timeout) => match session.view(|s| s.last_activity().checked_add(timeout)) {
                Ok(deadline) => deadline,
                Err(_) => return,
            },
            None => None,
        };

        tokio::select! {
            _ = state.wait_for(|state| state.is_terminal()) => break,
            _ = idle(deadline) => {}
        }

        let Some(timeout) = idle_timeout else {
            continue;
        };
        let expired = session.view(|s| {
            s.last_activity()
                .checked_add(timeout)
                .is_some_and(|deadline| deadline <= Instant::now())
                && s.cancel(CancelReason::IdleTimeout).is_ok()
        });
        match expired {
            Ok(true) => info!(
                session_id = %session.session_id(),
                idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Session idle timeout"
            ),
            Ok(false) => {}
            Err(_) => return,
        }
    }

    flushed.cancelled().await;

    match registry.remove(session.session_id()) {
        Ok(()) => debug!(session_id = %session.session_id(), "Session retired"),
        Err(e) => warn!(session_id = %session.session_id(), error = %e, "Failed to retire session"),
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
