//! One connection's worth of sessions on top of a shared [`Transport`].
//!
//! The read side turns [`TransportEvent`]s into session operations: a frame on an unseen stream
//! opens a session and dispatches its handler, later frames are enqueued on the session's inbound
//! queue, half-closes and resets become `close_inbound` and `cancel`. The write side (the pump)
//! drains outbound queues across sessions according to the configured [`FairnessPolicy`] and
//! writes them to the transport.
//!
//! The read side never waits on a single session. Inbound frames go through a per-session
//! forwarding task, so a handler that stops reading stalls only its own stream; a peer that keeps
//! sending into it past `inbound_backlog` gets that stream reset. The pump waits on a saturated
//! transport, and handlers wait on a full outbound queue in the meantime.
//!
//! [`FairnessPolicy`]: crate::config::FairnessPolicy

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use self::pump::{Scheduler, Visit};
use self::streams::StreamLedger;
use crate::codec::Codec;
use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, Router};
use crate::error::SessionError;
use crate::frame_queue::TryDequeue;
use crate::message::Message;
use crate::registry::{SessionRef, SessionRegistry};
use crate::session::CancelReason;
use crate::session::forwarder::{self, Forwarded, Forwarders};
use crate::session_id::{ConnectionId, SessionId, StreamId};
use crate::transport::{ResetReason, Transport, TransportError, TransportEvent};

mod pump;
mod streams;
mod supervisor;

/// A session the pump still has to flush.
#[derive(Debug, Clone)]
struct Outbound {
    session: SessionRef,
    flushed: CancellationToken,
}

#[derive(Debug)]
struct PumpState {
    scheduler: Scheduler,
    outbound: HashMap<StreamId, Outbound>,
}

/// Demultiplexes one connection's inbound frames onto sessions and multiplexes their outbound
/// messages back onto the transport.
pub struct ConnectionMultiplexer {
    transport: Arc<dyn Transport>,
    connection: ConnectionId,
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    config: SessionConfig,
    dispatcher: Dispatcher,
    pump: Mutex<PumpState>,
    /// Stream ids already used on this connection. Late frames for these are dropped.
    streams: Mutex<StreamLedger>,
    forwarders: Arc<Forwarders>,
    ready: Arc<Notify>,
    shutdown: CancellationToken,
    closing: CancellationToken,
    shut_down: AtomicBool,
}

impl ConnectionMultiplexer {
    /// Create a multiplexer for `transport`. Cancelling `shutdown` stops it.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        router: Arc<Router>,
        codec: Arc<dyn Codec>,
        config: SessionConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let scheduler = Scheduler::new(config.fairness_policy, config.max_batch);
        let forwarders = Arc::new(Forwarders::new(config.inbound_backlog));

        Self {
            connection: transport.connection_id(),
            transport,
            registry,
            router,
            codec,
            config,
            dispatcher: Dispatcher::new(),
            pump: Mutex::new(PumpState {
                scheduler,
                outbound: HashMap::new(),
            }),
            streams: Mutex::new(StreamLedger::new()),
            forwarders,
            ready: Arc::new(Notify::new()),
            shutdown: shutdown.clone(),
            closing: shutdown.child_token(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Drive the connection until the transport closes or the multiplexer is shut down.
    ///
    /// On exit every session still living on the connection is cancelled and the transport is
    /// closed.
    pub async fn run(&self, events: mpsc::Receiver<TransportEvent>) -> Result<(), SessionError> {
        info!(connection = %self.connection, "Connection multiplexer started");

        let (_, pumped) = tokio::join!(self.read_side(events), self.pump());

        let reason = if self.shut_down.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
            CancelReason::Shutdown
        } else {
            CancelReason::ConnectionClosed
        };
        let cancelled = self.registry.cancel_connection(self.connection, reason);
        self.closing.cancel();
        self.transport.close().await;

        info!(connection = %self.connection, cancelled, reason = %reason, "Connection multiplexer stopped");
        pumped.map_err(SessionError::from)
    }

    /// Stop the multiplexer, cancelling every session on the connection.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry
            .cancel_connection(self.connection, CancelReason::Shutdown);
        self.closing.cancel();
    }

    async fn read_side(&self, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                event = events.recv() => event.unwrap_or(TransportEvent::ConnectionClosed),
                _ = self.transport.closed() => TransportEvent::ConnectionClosed,
            };

            if event == TransportEvent::ConnectionClosed {
                debug!(connection = %self.connection, "Peer closed the connection");
                break;
            }

            let handled = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                _ = self.transport.closed() => break,
                handled = self.handle_event(event) => handled,
            };
            if let Err(e) = handled {
                debug!(connection = %self.connection, error = %e, "Inbound event rejected");
            }
        }

        self.closing.cancel();
    }

    /// Apply one transport event to the sessions of this connection.
    pub async fn handle_event(&self, event: TransportEvent) -> Result<(), SessionError> {
        match event {
            TransportEvent::Frame { stream, frame } => self.on_inbound_frame(stream, frame).await,

            TransportEvent::HalfClosed { stream } => {
                let session = self.registry.lookup(&self.session_id(stream))?;
                if self.forwarders.half_close(stream) == Forwarded::Queued {
                    return Ok(());
                }
                let state = session.view(|s| s.close_inbound())??;
                trace!(session_id = %session.session_id(), state = %state, "Peer half-closed");
                Ok(())
            }

            TransportEvent::StreamReset { stream, code } => {
                let session = self.registry.lookup(&self.session_id(stream))?;
                session.view(|s| s.cancel(CancelReason::StreamReset(code)))??;
                debug!(session_id = %session.session_id(), code, "Peer reset stream");
                Ok(())
            }

            TransportEvent::ConnectionClosed => {
                self.shutdown_connection();
                Ok(())
            }
        }
    }

    fn shutdown_connection(&self) {
        self.registry
            .cancel_connection(self.connection, CancelReason::ConnectionClosed);
        self.closing.cancel();
    }

    /// Route one inbound frame.
    ///
    /// The first frame on a stream opens the session and dispatches its handler. A frame that
    /// cannot be decoded, names an unknown operation, or does not fit under the session ceiling
    /// resets the stream; only that stream is affected.
    ///
    /// Frames are handed to the session's forwarder without waiting for room in its inbound queue.
    /// A session that already has `inbound_backlog` frames waiting is reset with a flow control
    /// error.
    pub async fn on_inbound_frame(&self, stream: StreamId, frame: Bytes) -> Result<(), SessionError> {
        let session_id = self.session_id(stream);

        let message = match self.codec.decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Malformed inbound frame");
                match self.registry.lookup(&session_id) {
                    Ok(session) => {
                        let _ = session.view(|s| s.cancel(CancelReason::MalformedPayload));
                    }
                    Err(_) => {
                        self.claim_stream(stream);
                        self.reset(stream, ResetReason::ProtocolError).await;
                    }
                }
                return Err(e.into());
            }
        };

        let session = match self.registry.lookup(&session_id) {
            Ok(session) => session,
            Err(_) => {
                if !self.claim_stream(stream) {
                    trace!(session_id = %session_id, "Dropping frame for a retired stream");
                    return Ok(());
                }
                match self.open_session(session_id, &message).await? {
                    Some(session) => session,
                    None => return Ok(()),
                }
            }
        };

        match self.forwarders.frame(stream, message) {
            Forwarded::Queued => {}
            Forwarded::Overflow => {
                warn!(session_id = %session.session_id(), "Inbound backlog overflowed, resetting stream");
                let _ = session.view(|s| s.cancel(CancelReason::InboundOverflow));
            }
            Forwarded::Missing => {
                let _ = session.view(forwarder::reject_late_frame);
            }
        }
        Ok(())
    }

    async fn open_session(
        &self,
        session_id: SessionId,
        message: &Message,
    ) -> Result<Option<SessionRef>, SessionError> {
        let stream = session_id.stream();

        let Some(operation) = message.operation() else {
            warn!(session_id = %session_id, "Stream opened with a status record");
            self.reset(stream, ResetReason::ProtocolError).await;
            return Ok(None);
        };

        let Some(handler) = self.router.get(operation).cloned() else {
            warn!(session_id = %session_id, operation = %operation, "No handler registered for operation");
            self.reset(stream, ResetReason::RefusedStream).await;
            return Err(SessionError::NoHandler(operation.to_string()));
        };

        let session = match self.registry.create(session_id.clone(), &self.config) {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Refusing stream");
                self.reset(stream, ResetReason::RefusedStream).await;
                return Err(e.into());
            }
        };

        if session
            .view(|s| s.outbound().set_ready_signal(Arc::clone(&self.ready)))?
            .is_err()
        {
            warn!(session_id = %session_id, "Outbound queue already drained by another pump");
        }

        let flushed = self.closing.child_token();
        {
            let mut pump = self.pump.lock().expect("pump state lock poisoned");
            pump.scheduler.insert(stream);
            pump.outbound.insert(
                stream,
                Outbound {
                    session: session.clone(),
                    flushed: flushed.clone(),
                },
            );
        }

        self.forwarders.spawn(session.clone());
        tokio::spawn(supervisor::supervise(
            Arc::clone(&self.registry),
            session.clone(),
            self.config.idle_timeout,
            flushed,
        ));

        info!(session_id = %session_id, operation = %operation, "Session opened");
        self.dispatcher
            .dispatch(session.clone(), Arc::from(operation), handler)?;

        Ok(Some(session))
    }

    /// Drain outbound queues onto the transport until the multiplexer stops.
    ///
    /// Sleeps while no session has output. A saturated transport suspends the pump, which in turn
    /// leaves handlers suspended on their full outbound queues; nothing is dropped.
    pub async fn pump(&self) -> Result<(), TransportError> {
        let result = loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let progressed = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break Ok(()),
                round = self.pump_round() => round,
            };

            match progressed {
                Ok(true) => continue,
                Ok(false) => {}
                Err(TransportError::Closed) => break Ok(()),
            }

            tokio::select! {
                biased;
                _ = self.closing.cancelled() => break Ok(()),
                _ = &mut ready => {}
            }
        };

        self.closing.cancel();
        result
    }

    /// Run one fairness round. Returns whether anything was written or finished.
    async fn pump_round(&self) -> Result<bool, TransportError> {
        let visits: Vec<(Visit, Outbound)> = {
            let mut guard = self.pump.lock().expect("pump state lock poisoned");
            let pump = &mut *guard;

            let ready: Vec<(StreamId, usize)> = pump
                .scheduler
                .streams()
                .filter_map(|stream| {
                    let entry = pump.outbound.get(&stream)?;
                    let (backlog, closed) = entry
                        .session
                        .view(|s| (s.outbound().len(), s.outbound().is_closed()))
                        .unwrap_or((0, true));
                    (backlog > 0 || closed).then_some((stream, backlog))
                })
                .collect();

            pump.scheduler
                .plan(&ready)
                .into_iter()
                .filter_map(|visit| {
                    pump.outbound
                        .get(&visit.stream)
                        .map(|entry| (visit, entry.clone()))
                })
                .collect()
        };

        let mut progressed = false;
        for (visit, entry) in visits {
            for _ in 0..visit.quota {
                let next = entry
                    .session
                    .view(|s| s.outbound().try_dequeue())
                    .unwrap_or(TryDequeue::EndOfStream);

                match next {
                    TryDequeue::Item(message) => {
                        self.transport
                            .send(visit.stream, self.codec.encode(&message))
                            .await?;
                        progressed = true;
                    }
                    TryDequeue::EndOfStream => {
                        self.end_stream(visit.stream, &entry).await?;
                        progressed = true;
                        break;
                    }
                    TryDequeue::Empty => break,
                }
            }
        }

        Ok(progressed)
    }

    /// Deliver a session's end of stream: finish on a clean close, reset on cancellation.
    async fn end_stream(&self, stream: StreamId, entry: &Outbound) -> Result<(), TransportError> {
        let reason = entry.session.view(|s| s.cancel_reason()).ok().flatten();
        let reset = match reason {
            None => None,
            // The peer already knows.
            Some(CancelReason::StreamReset(_) | CancelReason::ConnectionClosed) => Some(None),
            Some(CancelReason::MalformedPayload) => Some(Some(ResetReason::ProtocolError)),
            Some(CancelReason::InboundOverflow) => Some(Some(ResetReason::FlowControlError)),
            Some(_) => Some(Some(ResetReason::Cancel)),
        };

        {
            let mut pump = self.pump.lock().expect("pump state lock poisoned");
            pump.scheduler.remove(stream);
            pump.outbound.remove(&stream);
        }

        let sent = match reset {
            None => self.transport.finish(stream).await,
            Some(Some(reason)) => self.transport.reset(stream, reason).await,
            Some(None) => Ok(()),
        };
        entry.flushed.cancel();

        debug!(session_id = %entry.session.session_id(), reason = ?reason, "Stream flushed");
        sent
    }

    async fn reset(&self, stream: StreamId, reason: ResetReason) {
        if let Err(e) = self.transport.reset(stream, reason).await {
            debug!(connection = %self.connection, stream, error = %e, "Failed to reset stream");
        }
    }

    /// Claim `stream` for a new session. Returns `false` if it was used before.
    fn claim_stream(&self, stream: StreamId) -> bool {
        self.streams
            .lock()
            .expect("stream ledger lock poisoned")
            .claim(stream)
    }

    fn session_id(&self, stream: StreamId) -> SessionId {
        SessionId::new(self.connection, stream)
    }

    /// Number of sessions the pump still has to flush.
    pub fn pending_streams(&self) -> usize {
        self.pump.lock().expect("pump state lock poisoned").scheduler.len()
    }
}

impl std::fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMultiplexer")
            .field("connection", &self.connection)
            .field("pending_streams", &self.pending_streams())
            .field("closing", &self.closing.is_cancelled())
            .finish_non_exhaustive()
    }
}
