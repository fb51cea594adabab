use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::call::RpcCall;
use crate::client::config::RpcClientConfig;
use crate::codec::{Codec, ProstCodec};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::session::CancelReason;
use crate::session::forwarder::{self, Forwarded, Forwarders};
use crate::session_id::{ConnectionId, SessionId, StreamId};
use crate::transport::{ResetReason, Transport, TransportEvent};

/// Everything calls share with the client.
pub(crate) struct ClientShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) registry: SessionRegistry,
    forwarders: Arc<Forwarders>,
    session_config: SessionConfig,
    next_stream: AtomicU64,
    closed: CancellationToken,
}

impl ClientShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn connection_id(&self) -> ConnectionId {
        self.transport.connection_id()
    }
}

/// An RPC client that opens calls over a [`Transport`].
///
/// The client handles:
/// - Allocating a stream per call
/// - Routing response frames into the right call
/// - Encoding/decoding protobuf messages
///
/// # Example
///
/// ```ignore
/// let ((transport, events), server_end) = MemoryTransport::pair(64);
/// let client = RpcClient::new(Arc::new(transport), events, RpcClientConfig::default());
///
/// let mut call = client
///     .server_streaming::<UserRequest, UserReply>("users.Users/GetUserStreamReply", &request)
///     .await?;
/// while let Some(reply) = call.message().await? {
///     println!("Got: {}", reply.message);
/// }
/// ```
pub struct RpcClient {
    shared: Arc<ClientShared>,
    config: RpcClientConfig,
}

impl RpcClient {
    /// Create a new RPC client and start routing `events` to its calls.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        config: RpcClientConfig,
    ) -> Self {
        let session_config = config.session_config();
        let shared = Arc::new(ClientShared {
            transport,
            codec: Arc::new(ProstCodec),
            registry: SessionRegistry::new(session_config.event_capacity),
            forwarders: Arc::new(Forwarders::new(session_config.inbound_backlog)),
            session_config,
            // Client-initiated streams are odd, as in HTTP/2.
            next_stream: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        info!(connection = %shared.connection_id(), "RPC client started");
        tokio::spawn(read_events(Arc::clone(&shared), events));

        Self { shared, config }
    }

    /// Open a call without sending anything yet. This is the entry point for bidirectional
    /// streaming.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The client is closed
    /// * `max_concurrent_calls` calls are already open
    pub fn open<Req, Resp>(
        &self,
        operation: impl Into<Arc<str>>,
    ) -> Result<RpcCall<Req, Resp>, SessionError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        if self.shared.is_closed() {
            return Err(SessionError::ConnectionClosed);
        }

        let operation = operation.into();
        let stream: StreamId = self.shared.next_stream.fetch_add(2, Ordering::Relaxed);
        let session_id = SessionId::new(self.shared.connection_id(), stream);
        let session = self
            .shared
            .registry
            .create(session_id.clone(), &self.shared.session_config)?;
        self.shared.forwarders.spawn(session.clone());

        debug!(session_id = %session_id, operation = %operation, "Call opened");
        Ok(RpcCall::new(Arc::clone(&self.shared), session, operation))
    }

    /// Send one request and wait (up to the configured timeout) for its single response.
    pub async fn unary<Req, Resp>(
        &self,
        operation: impl Into<Arc<str>>,
        request: &Req,
    ) -> Result<Resp, SessionError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let mut call = self.open::<Req, Resp>(operation)?;
        call.send(request).await?;
        call.close_send().await?;

        let response = tokio::time::timeout(self.config.timeout, call.message())
            .await??
            .ok_or_else(|| tonic::Status::internal("stream finished without a response"))?;

        // Let the server's end of stream arrive so the call completes cleanly.
        let _ = tokio::time::timeout(self.config.timeout, call.message()).await;
        Ok(response)
    }

    /// Send one request and return the call carrying the response stream.
    pub async fn server_streaming<Req, Resp>(
        &self,
        operation: impl Into<Arc<str>>,
        request: &Req,
    ) -> Result<RpcCall<Req, Resp>, SessionError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let call = self.open::<Req, Resp>(operation)?;
        call.send(request).await?;
        call.close_send().await?;
        Ok(call)
    }

    /// Close the connection. Open calls fail with `Unavailable`.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.transport.close().await;
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id()
    }

    /// Number of calls currently open.
    pub fn open_calls(&self) -> usize {
        self.shared.registry.len()
    }

    /// Get the client configuration.
    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("connection", &self.shared.connection_id())
            .field("open_calls", &self.open_calls())
            .field("config", &self.config)
            .finish()
    }
}

async fn read_events(shared: Arc<ClientShared>, mut events: mpsc::Receiver<TransportEvent>) {
    let connection = shared.connection_id();

    loop {
        let event = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            event = events.recv() => event.unwrap_or(TransportEvent::ConnectionClosed),
            _ = shared.transport.closed() => TransportEvent::ConnectionClosed,
        };

        match event {
            TransportEvent::Frame { stream, frame } => {
                let Ok(session) = shared.registry.lookup(&SessionId::new(connection, stream)) else {
                    trace!(connection = %connection, stream, "Dropping frame for a finished call");
                    continue;
                };

                let message = match shared.codec.decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(session_id = %session.session_id(), error = %e, "Malformed response frame");
                        let _ = session.view(|s| s.cancel(CancelReason::MalformedPayload));
                        let _ = shared.transport.reset(stream, ResetReason::ProtocolError).await;
                        continue;
                    }
                };

                match shared.forwarders.frame(stream, message) {
                    Forwarded::Queued => {}
                    Forwarded::Overflow => {
                        warn!(session_id = %session.session_id(), "Response backlog overflowed, resetting call");
                        let _ = session.view(|s| s.cancel(CancelReason::InboundOverflow));
                        let _ = shared.transport.reset(stream, ResetReason::FlowControlError).await;
                    }
                    Forwarded::Missing => {
                        let _ = session.view(forwarder::reject_late_frame);
                    }
                }
            }

            TransportEvent::HalfClosed { stream } => {
                if let Ok(session) = shared.registry.lookup(&SessionId::new(connection, stream)) {
                    if shared.forwarders.half_close(stream) != Forwarded::Queued {
                        let _ = session.view(|s| s.close_inbound());
                    }
                }
            }

            TransportEvent::StreamReset { stream, code } => {
                if let Ok(session) = shared.registry.lookup(&SessionId::new(connection, stream)) {
                    debug!(session_id = %session.session_id(), code, "Server reset call");
                    let _ = session.view(|s| s.cancel(CancelReason::StreamReset(code)));
                }
            }

            TransportEvent::ConnectionClosed => break,
        }
    }

    let cancelled = shared
        .registry
        .cancel_connection(connection, CancelReason::ConnectionClosed);
    shared.closed.cancel();
    info!(connection = %connection, cancelled, "RPC client stopped");
}
