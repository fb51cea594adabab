use std::sync::Arc;

use bytes::Bytes;
use tonic::{Code, Status};

/// Logical type tag carried alongside every payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// Application data for the named operation (e.g. `users.Users/GetUser`).
    Data(Arc<str>),
    /// Terminal error record. The payload holds the UTF-8 status message.
    Status(Code),
}

/// An opaque application message.
///
/// The engine only ever inspects the [`Tag`]; payload bytes are handed to the handler untouched.
/// Ownership moves into a [`FrameQueue`](crate::frame_queue::FrameQueue) on enqueue and out again
/// to whoever dequeues it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    tag: Tag,
    payload: Bytes,
}

impl Message {
    /// A data message for `operation`.
    pub fn new(operation: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: Tag::Data(operation.into()),
            payload: payload.into(),
        }
    }

    /// A terminal error record built from a handler's [`Status`].
    pub fn status(status: &Status) -> Self {
        Self {
            tag: Tag::Status(status.code()),
            payload: Bytes::copy_from_slice(status.message().as_bytes()),
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// The operation this message is addressed to, if it is a data message.
    pub fn operation(&self) -> Option<&str> {
        match &self.tag {
            Tag::Data(operation) => Some(operation),
            Tag::Status(_) => None,
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self.tag, Tag::Status(_))
    }

    /// Rebuild the [`Status`] carried by a terminal error record.
    pub fn to_status(&self) -> Option<Status> {
        match self.tag {
            Tag::Status(code) => Some(Status::new(
                code,
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
            Tag::Data(_) => None,
        }
    }
}
