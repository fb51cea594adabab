use thiserror::Error;

use crate::codec::MalformedPayload;
use crate::frame_queue::error::QueueClosed;
use crate::registry::error::RegistryError;
use crate::registry::session_ref::error::SessionGone;
use crate::session::error::InvalidTransition;
use crate::session_id::SessionId;
use crate::transport::TransportError;

/// Errors that can occur in the session engine.
///
/// Every variant is scoped to a single session unless stated otherwise; none of them tears down a
/// connection on its own.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An operation was attempted on a closed frame queue.
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),

    /// A registry invariant was violated (duplicate, capacity, missing, still active).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A session refused a state transition.
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// The session was removed while a reference to it was still in use.
    #[error(transparent)]
    SessionGone(#[from] SessionGone),

    /// An inbound frame could not be decoded.
    #[error("malformed payload")]
    MalformedPayload(#[from] MalformedPayload),

    /// The transport failed. Fatal to every session on that connection.
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// No handler registered for the requested operation.
    #[error("no handler registered for '{0}'")]
    NoHandler(String),

    /// A handler is already registered for the operation.
    #[error("a handler is already registered for '{0}'")]
    DuplicateOperation(String),

    /// The session already has a running handler.
    #[error("session {0} already has a handler")]
    AlreadyDispatched(SessionId),

    /// A handler (or the remote peer) failed with an application status.
    #[error("handler failure: {0}")]
    HandlerFailure(#[from] tonic::Status),

    /// Timeout waiting for the remote side.
    #[error("timeout waiting for the remote side")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,
}
