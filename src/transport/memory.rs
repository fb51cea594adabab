use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::session_id::{ConnectionId, StreamId};
use crate::transport::{ResetReason, Transport, TransportError, TransportEvent};

/// One end of an in-process connection.
///
/// Events travel over a bounded channel, so a peer that stops reading eventually suspends
/// [`send`](Transport::send) on this side, the same way a saturated socket would.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    id: ConnectionId,
    peer: mpsc::Sender<TransportEvent>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Create a connected pair. Each end comes with the receiver of the events its peer produces.
    ///
    /// `buffer` bounds the number of in-flight events per direction.
    pub fn pair(
        buffer: usize,
    ) -> (
        (MemoryTransport, mpsc::Receiver<TransportEvent>),
        (MemoryTransport, mpsc::Receiver<TransportEvent>),
    ) {
        let (a_tx, a_rx) = mpsc::channel(buffer.max(1));
        let (b_tx, b_rx) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();

        let a = MemoryTransport {
            id: ConnectionId::generate(),
            peer: b_tx,
            closed: closed.clone(),
        };
        let b = MemoryTransport {
            id: ConnectionId::generate(),
            peer: a_tx,
            closed,
        };

        ((a, a_rx), (b, b_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn deliver(&self, event: TransportEvent) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            sent = self.peer.send(event) => sent.map_err(|_| TransportError::Closed),
        }
    }
}

#[tonic::async_trait]
impl Transport for MemoryTransport {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, stream: StreamId, frame: Bytes) -> Result<(), TransportError> {
        trace!(connection = %self.id, stream, len = frame.len(), "Sending frame");
        self.deliver(TransportEvent::Frame { stream, frame }).await
    }

    async fn finish(&self, stream: StreamId) -> Result<(), TransportError> {
        trace!(connection = %self.id, stream, "Finishing stream");
        self.deliver(TransportEvent::HalfClosed { stream }).await
    }

    async fn reset(&self, stream: StreamId, reason: ResetReason) -> Result<(), TransportError> {
        debug!(connection = %self.id, stream, reason = %reason, "Resetting stream");
        self.deliver(TransportEvent::StreamReset {
            stream,
            code: reason.code(),
        })
        .await
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!(connection = %self.id, "Closing connection");
        self.closed.cancel();
        // Best effort; the peer also observes `closed()`.
        let _ = self.peer.try_send(TransportEvent::ConnectionClosed);
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_events_reach_the_peer_in_order() {
        let ((client, _client_rx), (_server, mut server_rx)) = MemoryTransport::pair(8);

        client.send(1, Bytes::from_static(b"a")).await.unwrap();
        client.send(1, Bytes::from_static(b"b")).await.unwrap();
        client.finish(1).await.unwrap();
        client.reset(3, ResetReason::Cancel).await.unwrap();

        assert_eq!(
            server_rx.recv().await,
            Some(TransportEvent::Frame {
                stream: 1,
                frame: Bytes::from_static(b"a")
            })
        );
        assert_eq!(
            server_rx.recv().await,
            Some(TransportEvent::Frame {
                stream: 1,
                frame: Bytes::from_static(b"b")
            })
        );
        assert_eq!(server_rx.recv().await, Some(TransportEvent::HalfClosed { stream: 1 }));
        assert_eq!(
            server_rx.recv().await,
            Some(TransportEvent::StreamReset { stream: 3, code: 0x8 })
        );
    }

    #[tokio::test]
    async fn test_send_suspends_when_peer_stops_reading() {
        let ((client, _client_rx), (_server, mut server_rx)) = MemoryTransport::pair(1);

        client.send(1, Bytes::from_static(b"a")).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            client.send(1, Bytes::from_static(b"b")),
        )
        .await;
        assert!(blocked.is_err());

        server_rx.recv().await.unwrap();
        client.send(1, Bytes::from_static(b"c")).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_ends() {
        let ((client, _client_rx), (server, mut server_rx)) = MemoryTransport::pair(4);

        client.close().await;
        server.closed().await;

        assert_eq!(server_rx.recv().await, Some(TransportEvent::ConnectionClosed));
        assert!(matches!(
            server.send(1, Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(client.is_closed());
    }

    #[test]
    fn test_reset_codes_round_trip() {
        for reason in [
            ResetReason::ProtocolError,
            ResetReason::InternalError,
            ResetReason::FlowControlError,
            ResetReason::RefusedStream,
            ResetReason::Cancel,
        ] {
            assert_eq!(ResetReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(ResetReason::from_code(0xff), None);
    }
}
