use std::fmt::{self, Display};
use std::sync::Arc;

use uuid::Uuid;

/// Identifies one physical connection served by a [`ConnectionMultiplexer`].
///
/// [`ConnectionMultiplexer`]: crate::multiplexer::ConnectionMultiplexer
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport-assigned identifier of a logical stream within one connection.
pub type StreamId = u64;

/// Identifier of one [`StreamSession`](crate::session::StreamSession).
///
/// A session is addressed by the connection it lives on and the stream id the transport assigned
/// to it, so a single registry can serve any number of connections without collisions. The id is
/// cheap to clone and immutable once assigned.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(Arc<(ConnectionId, StreamId)>);

impl SessionId {
    pub fn new(connection: ConnectionId, stream: StreamId) -> Self {
        Self(Arc::new((connection, stream)))
    }

    pub fn connection(&self) -> ConnectionId {
        self.0.0
    }

    pub fn stream(&self) -> StreamId {
        self.0.1
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0.0, self.0.1)
    }
}
