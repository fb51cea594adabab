use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::error::InvalidTransition;
use crate::activity::Activity;
use crate::frame_queue::FrameQueue;
use crate::lifecycle::{LifecycleEvent, LifecycleKind};
use crate::session_id::SessionId;
use crate::state_machine::StateMachine;
use crate::state_machine::session::{SessionInput, SessionOutput, SessionStateMachine};

pub use crate::state_machine::session::{CancelReason, SessionState};

pub mod error;
pub(crate) mod forwarder;

/// One bidirectional RPC call: an inbound and an outbound [`FrameQueue`] plus the half-close
/// state machine and the cancellation token shared with the handler.
///
/// The two half-closes are independent events. [`close_inbound`](Self::close_inbound) records that
/// the peer stopped sending; [`close_outbound`](Self::close_outbound) records that the handler
/// stopped producing. The session is `Closed` only once both happened.
pub struct StreamSession {
    id: SessionId,
    inbound: FrameQueue,
    outbound: FrameQueue,
    machine: Mutex<SessionStateMachine>,
    state_tx: watch::Sender<SessionState>,
    cancel_token: CancellationToken,
    activity: Arc<Activity>,
    dispatched: AtomicBool,
    events: Option<broadcast::Sender<LifecycleEvent>>,
}

impl StreamSession {
    /// Open a new session with both queues bounded to `queue_capacity`.
    pub fn open(id: SessionId, queue_capacity: usize) -> Self {
        let activity = Arc::new(Activity::new());
        let (state_tx, _) = watch::channel(SessionState::Open);

        Self {
            id,
            inbound: FrameQueue::with_activity(queue_capacity, Arc::clone(&activity)),
            outbound: FrameQueue::with_activity(queue_capacity, Arc::clone(&activity)),
            machine: Mutex::new(SessionStateMachine::new()),
            state_tx,
            cancel_token: CancellationToken::new(),
            activity,
            dispatched: AtomicBool::new(false),
            events: None,
        }
    }

    /// Like [`open`](Self::open), but terminal transitions are published on `events`.
    pub(crate) fn open_with_events(
        id: SessionId,
        queue_capacity: usize,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            events: Some(events),
            ..Self::open(id, queue_capacity)
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Messages from the peer, consumed by the handler.
    pub fn inbound(&self) -> &FrameQueue {
        &self.inbound
    }

    /// Messages from the handler, consumed by the multiplexer.
    pub fn outbound(&self) -> &FrameQueue {
        &self.outbound
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.machine
            .lock()
            .expect("session machine lock poisoned")
            .cancel_reason()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Token fired when the session is cancelled.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Instant of the last successful enqueue or dequeue on either queue.
    pub fn last_activity(&self) -> Instant {
        self.activity.last()
    }

    /// The peer is done sending. Buffered inbound messages remain readable.
    pub fn close_inbound(&self) -> Result<SessionState, InvalidTransition> {
        let state = self.transition(SessionInput::CloseInbound)?;
        self.inbound.close();
        Ok(state)
    }

    /// The handler is done producing. Buffered outbound messages remain flushable.
    pub fn close_outbound(&self) -> Result<SessionState, InvalidTransition> {
        let state = self.transition(SessionInput::CloseOutbound)?;
        self.outbound.close();
        Ok(state)
    }

    /// Cancel the session from any non-terminal state.
    ///
    /// Both queues are closed and emptied, and the cancel token fires so the handler unwinds at
    /// its next queue operation or token poll.
    pub fn cancel(&self, reason: CancelReason) -> Result<SessionState, InvalidTransition> {
        let state = self.transition(SessionInput::Cancel(reason))?;

        let dropped_inbound = self.inbound.close_and_discard();
        let dropped_outbound = self.outbound.close_and_discard();
        self.cancel_token.cancel();

        debug!(
            session_id = %self.id,
            reason = %reason,
            dropped_inbound,
            dropped_outbound,
            "Session cancelled"
        );
        Ok(state)
    }

    /// Stop accepting inbound messages without recording a half-close.
    ///
    /// Used once the handler has finished, so the multiplexer never blocks on a queue nobody
    /// reads anymore.
    pub(crate) fn abandon_inbound(&self) -> usize {
        self.inbound.close_and_discard()
    }

    /// Claim the session for a handler. Returns `false` if it was already claimed.
    pub(crate) fn mark_dispatched(&self) -> bool {
        !self.dispatched.swap(true, Ordering::AcqRel)
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::Acquire)
    }

    fn transition(&self, input: SessionInput) -> Result<SessionState, InvalidTransition> {
        let mut machine = self.machine.lock().expect("session machine lock poisoned");
        machine.process_input(input);

        match machine.poll_output() {
            Some(SessionOutput::Transition { from, to }) => {
                // Published under the lock so observers see transitions in order.
                self.state_tx.send_replace(to);
                drop(machine);

                debug!(session_id = %self.id, from = %from, to = %to, "Session transition");
                self.emit_terminal(to, input);
                Ok(to)
            }
            Some(SessionOutput::Rejected { state, input }) => Err(InvalidTransition {
                session_id: self.id.clone(),
                state,
                input,
            }),
            None => Err(InvalidTransition {
                session_id: self.id.clone(),
                state: machine.state(),
                input,
            }),
        }
    }

    fn emit_terminal(&self, state: SessionState, input: SessionInput) {
        let kind = match (state, input) {
            (SessionState::Closed, _) => LifecycleKind::Closed,
            (SessionState::Cancelled, SessionInput::Cancel(CancelReason::IdleTimeout)) => {
                LifecycleKind::TimedOut
            }
            (SessionState::Cancelled, _) => LifecycleKind::Cancelled,
            _ => return,
        };

        if let Some(events) = &self.events {
            // No subscribers is fine; events are advisory.
            let _ = events.send(LifecycleEvent::now(self.id.clone(), kind));
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::session_id::ConnectionId;

    fn session() -> StreamSession {
        StreamSession::open(SessionId::new(ConnectionId::generate(), 1), 4)
    }

    fn msg(body: &'static str) -> Message {
        Message::new("test.Echo/Echo", body)
    }

    #[tokio::test]
    async fn test_client_half_close_then_handler_completion() {
        let session = session();
        session.inbound().enqueue(msg("a")).await.unwrap();

        assert_eq!(session.close_inbound().unwrap(), SessionState::HalfClosedInbound);
        // Buffered inbound data survives the half-close.
        assert_eq!(session.inbound().dequeue().await, Some(msg("a")));
        assert_eq!(session.inbound().dequeue().await, None);

        session.outbound().enqueue(msg("reply")).await.unwrap();
        assert_eq!(session.close_outbound().unwrap(), SessionState::Closed);
        assert_eq!(session.outbound().dequeue().await, Some(msg("reply")));
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_discards_and_closes_both_queues() {
        for setup in [None, Some(SessionInput::CloseInbound), Some(SessionInput::CloseOutbound)] {
            let session = session();
            session.outbound().enqueue(msg("unsent")).await.unwrap();
            match setup {
                Some(SessionInput::CloseInbound) => {
                    session.close_inbound().unwrap();
                }
                Some(SessionInput::CloseOutbound) => {
                    session.close_outbound().unwrap();
                }
                _ => {}
            }

            assert_eq!(
                session.cancel(CancelReason::Requested).unwrap(),
                SessionState::Cancelled
            );
            assert!(session.cancel_token().is_cancelled());
            assert_eq!(session.outbound().dequeue().await, None);
            assert_eq!(session.inbound().dequeue().await, None);
            assert!(session.inbound().enqueue(msg("late")).await.is_err());
            assert!(session.outbound().enqueue(msg("late")).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_transitions() {
        let session = session();
        session.cancel(CancelReason::Shutdown).unwrap();

        let err = session.close_inbound().unwrap_err();
        assert_eq!(err.state, SessionState::Cancelled);
        assert!(session.cancel(CancelReason::Requested).is_err());
        assert_eq!(session.cancel_reason(), Some(CancelReason::Shutdown));
    }

    #[tokio::test]
    async fn test_state_watch_follows_transitions() {
        let session = session();
        let mut state = session.subscribe_state();

        session.close_outbound().unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), SessionState::HalfClosedOutbound);

        session.close_inbound().unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_terminal_transitions_publish_lifecycle_events() {
        let (tx, mut rx) = broadcast::channel(8);
        let id = SessionId::new(ConnectionId::generate(), 9);
        let session = StreamSession::open_with_events(id.clone(), 1, tx);

        session.cancel(CancelReason::IdleTimeout).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, id);
        assert_eq!(event.kind, LifecycleKind::TimedOut);
    }

    #[test]
    fn test_dispatch_claim_is_exclusive() {
        let session = session();
        assert!(session.mark_dispatched());
        assert!(!session.mark_dispatched());
        assert!(session.is_dispatched());
    }
}
