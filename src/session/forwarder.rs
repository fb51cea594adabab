//! Delivery of peer input into sessions.
//!
//! A connection has a single read loop, so it never waits on a session's inbound queue itself.
//! Each session gets a forwarding task fed through a bounded channel, and only that task suspends
//! while the session's handler is not reading. A peer that sends past the backlog overflows its own
//! session and nobody else's.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::message::Message;
use crate::registry::SessionRef;
use crate::session::{CancelReason, StreamSession};
use crate::session_id::StreamId;

/// Peer input for one session, in arrival order.
#[derive(Debug)]
enum Input {
    Frame(Message),
    HalfClosed,
}

/// What happened to input handed to [`Forwarders`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forwarded {
    Queued,
    /// The session already has `inbound_backlog` frames waiting.
    Overflow,
    /// No forwarder is running for the stream any more.
    Missing,
}

/// The forwarding tasks of one connection, by stream.
pub(crate) struct Forwarders {
    senders: DashMap<StreamId, mpsc::Sender<Input>, ahash::RandomState>,
    backlog: usize,
}

impl Forwarders {
    pub(crate) fn new(backlog: usize) -> Self {
        Self {
            senders: DashMap::with_hasher(ahash::RandomState::new()),
            backlog: backlog.max(1),
        }
    }

    /// Start forwarding peer input into `session`. The task ends once the session is terminal.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(self: &Arc<Self>, session: SessionRef) {
        let stream = session.session_id().stream();
        // The spare slot keeps room for a half-close behind a full backlog.
        let (tx, rx) = mpsc::channel(self.backlog + 1);
        self.senders.insert(stream, tx);
        tokio::spawn(forward(Arc::clone(self), session, rx));
    }

    /// Queue one frame without waiting.
    pub(crate) fn frame(&self, stream: StreamId, message: Message) -> Forwarded {
        let Some(tx) = self.senders.get(&stream) else {
            return Forwarded::Missing;
        };
        if tx.capacity() <= 1 {
            return Forwarded::Overflow;
        }
        match tx.try_send(Input::Frame(message)) {
            Ok(()) => Forwarded::Queued,
            Err(TrySendError::Full(_)) => Forwarded::Overflow,
            Err(TrySendError::Closed(_)) => Forwarded::Missing,
        }
    }

    /// Queue the peer's half-close behind the frames already waiting.
    pub(crate) fn half_close(&self, stream: StreamId) -> Forwarded {
        let Some(tx) = self.senders.get(&stream) else {
            return Forwarded::Missing;
        };
        match tx.try_send(Input::HalfClosed) {
            Ok(()) => Forwarded::Queued,
            Err(TrySendError::Full(_)) => Forwarded::Overflow,
            Err(TrySendError::Closed(_)) => Forwarded::Missing,
        }
    }

    /// Number of forwarding tasks still running.
    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    fn retire(&self, stream: StreamId) {
        self.senders.remove(&stream);
    }
}

impl std::fmt::Debug for Forwarders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarders")
            .field("running", &self.senders.len())
            .field("backlog", &self.backlog)
            .finish()
    }
}

async fn forward(forwarders: Arc<Forwarders>, session: SessionRef, mut rx: mpsc::Receiver<Input>) {
    if let Ok(live) = session.upgrade() {
        deliver(&live, &mut rx).await;
    }
    forwarders.retire(session.session_id().stream());
}

async fn deliver(live: &StreamSession, rx: &mut mpsc::Receiver<Input>) {
    let mut state = live.subscribe_state();

    loop {
        let input = tokio::select! {
            biased;
            _ = state.wait_for(|state| state.is_terminal()) => return,
            input = rx.recv() => input,
        };

        match input {
            None => return,
            Some(Input::Frame(message)) => {
                if live.inbound().enqueue(message).await.is_err() {
                    reject_late_frame(live);
                    return;
                }
            }
            Some(Input::HalfClosed) => match live.close_inbound() {
                Ok(state) => trace!(session_id = %live.id(), state = %state, "Peer half-closed"),
                Err(e) => debug!(session_id = %live.id(), error = %e, "Half-close ignored"),
            },
        }
    }
}

/// Handle a frame that arrived after the session stopped accepting input.
///
/// Dropped if the session is cancelled or its handler already finished. A frame after the peer's
/// own half-close is a protocol violation and cancels the session.
pub(crate) fn reject_late_frame(live: &StreamSession) {
    if live.is_cancelled() || !live.state().outbound_open() {
        trace!(session_id = %live.id(), "Dropping frame for a finished session");
    } else {
        warn!(session_id = %live.id(), "Frame received after the peer half-closed");
        let _ = live.cancel(CancelReason::MalformedPayload);
    }
}
