//! The byte-level collaborator underneath a connection.
//!
//! A transport carries ordered, reliable, framed byte sequences per logical stream. Outgoing work
//! goes through the [`Transport`] trait; everything the peer does arrives as a [`TransportEvent`]
//! on a `tokio::sync::mpsc` channel handed out alongside the transport.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::session_id::{ConnectionId, StreamId};

pub mod memory;

pub use self::memory::MemoryTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed; nothing more can be sent on any stream.
    #[error("transport connection closed")]
    Closed,
}

/// Why a stream was reset. Codes follow the HTTP/2 error code registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    ProtocolError,
    InternalError,
    FlowControlError,
    RefusedStream,
    Cancel,
}

impl ResetReason {
    pub fn code(self) -> u32 {
        match self {
            ResetReason::ProtocolError => 0x1,
            ResetReason::InternalError => 0x2,
            ResetReason::FlowControlError => 0x3,
            ResetReason::RefusedStream => 0x7,
            ResetReason::Cancel => 0x8,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x1 => Some(ResetReason::ProtocolError),
            0x2 => Some(ResetReason::InternalError),
            0x3 => Some(ResetReason::FlowControlError),
            0x7 => Some(ResetReason::RefusedStream),
            0x8 => Some(ResetReason::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetReason::ProtocolError => "protocol error",
            ResetReason::InternalError => "internal error",
            ResetReason::FlowControlError => "flow control error",
            ResetReason::RefusedStream => "refused stream",
            ResetReason::Cancel => "cancel",
        };
        write!(f, "{name} (0x{:x})", self.code())
    }
}

/// Something the peer did on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One frame on `stream`.
    Frame { stream: StreamId, frame: Bytes },
    /// The peer will send nothing more on `stream`.
    HalfClosed { stream: StreamId },
    /// The peer abandoned `stream`.
    StreamReset { stream: StreamId, code: u32 },
    /// The connection is gone.
    ConnectionClosed,
}

/// Sending half of a multiplexed connection.
///
/// `send` suspends while the transport is saturated; it never drops a frame silently.
#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn connection_id(&self) -> ConnectionId;

    async fn send(&self, stream: StreamId, frame: Bytes) -> Result<(), TransportError>;

    /// Half-close `stream` from this side.
    async fn finish(&self, stream: StreamId) -> Result<(), TransportError>;

    async fn reset(&self, stream: StreamId, reason: ResetReason) -> Result<(), TransportError>;

    /// Close the whole connection. Idempotent.
    async fn close(&self);

    /// Resolves once the connection is closed by either side.
    async fn closed(&self);
}
