/// Indicates that a message could not be enqueued because the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the frame queue is closed")]
pub struct QueueClosed;
