//! The server side of the engine: one registry, one router and one configuration shared by every
//! connection.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::codec::{Codec, ProstCodec};
use crate::config::SessionConfig;
use crate::dispatcher::Router;
use crate::error::SessionError;
use crate::lifecycle::LifecycleEvent;
use crate::multiplexer::ConnectionMultiplexer;
use crate::registry::SessionRegistry;
use crate::session::CancelReason;
use crate::transport::{Transport, TransportEvent};

/// Serves any number of connections against a shared [`SessionRegistry`].
///
/// Cheap to clone; clones share the registry, the router and the shutdown signal.
///
/// # Example
///
/// ```ignore
/// let mut router = Router::new();
/// services::register(&mut router)?;
///
/// let server = Server::new(router, SessionConfig::default());
/// let ((client, client_events), (transport, events)) = MemoryTransport::pair(64);
///
/// tokio::spawn({
///     let server = server.clone();
///     async move { server.serve(Arc::new(transport), events).await }
/// });
/// ```
#[derive(Clone)]
pub struct Server {
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(router: Router, config: SessionConfig) -> Self {
        Self::with_codec(router, config, Arc::new(ProstCodec))
    }

    pub fn with_codec(router: Router, config: SessionConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.event_capacity)),
            router: Arc::new(router),
            codec,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Serve one connection until it closes or the server shuts down.
    pub async fn serve(
        &self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<(), SessionError> {
        if self.shutdown.is_cancelled() {
            transport.close().await;
            return Err(SessionError::ConnectionClosed);
        }

        let multiplexer = ConnectionMultiplexer::new(
            transport,
            Arc::clone(&self.registry),
            Arc::clone(&self.router),
            Arc::clone(&self.codec),
            self.config.clone(),
            &self.shutdown,
        );

        info!(
            connection = %multiplexer.connection_id(),
            operations = self.router.operations().count(),
            "Serving connection"
        );
        multiplexer.run(events).await
    }

    /// Cancel every session and stop every connection.
    pub fn shutdown(&self) {
        let cancelled = self.registry.cancel_all(CancelReason::Shutdown);
        self.shutdown.cancel();
        info!(cancelled, "Server shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Observe session lifecycle events across all connections.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.registry.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.registry.len())
            .field("router", &self.router)
            .field("config", &self.config)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
