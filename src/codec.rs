//! Serialization of [`Message`]s into transport frames.

use bytes::Bytes;
use thiserror::Error;
use tonic::Code;

use crate::message::{Message, Tag};

/// A frame could not be turned back into a [`Message`].
#[derive(Debug, Error)]
pub enum MalformedPayload {
    /// The frame is not a valid protobuf envelope.
    #[error("protobuf decode error")]
    Decode(#[from] prost::DecodeError),

    /// A data frame did not name the operation it belongs to.
    #[error("data frame is missing its operation")]
    MissingOperation,

    /// A status frame carried a code outside the known range.
    #[error("unknown status code {0}")]
    UnknownStatus(i32),
}

/// Serialization collaborator used by the multiplexer on both directions of a connection.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, message: &Message) -> Bytes;

    fn decode(&self, frame: &[u8]) -> Result<Message, MalformedPayload>;
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireMessage {
    #[prost(string, tag = "1")]
    operation: String,
    #[prost(bytes = "bytes", tag = "2")]
    payload: Bytes,
    #[prost(int32, optional, tag = "3")]
    status_code: Option<i32>,
}

/// The default [`Codec`]: every frame is a protobuf envelope holding the tag and the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl Codec for ProstCodec {
    fn encode(&self, message: &Message) -> Bytes {
        let wire = match message.tag() {
            Tag::Data(operation) => WireMessage {
                operation: operation.to_string(),
                payload: message.payload().clone(),
                status_code: None,
            },
            Tag::Status(code) => WireMessage {
                operation: String::new(),
                payload: message.payload().clone(),
                status_code: Some(*code as i32),
            },
        };

        Bytes::from(prost::Message::encode_to_vec(&wire))
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, MalformedPayload> {
        let wire: WireMessage = prost::Message::decode(frame)?;

        match wire.status_code {
            Some(raw) => {
                // Code::from maps anything unknown to Code::Unknown; reject instead.
                if !(0..=16).contains(&raw) {
                    return Err(MalformedPayload::UnknownStatus(raw));
                }
                let status = tonic::Status::new(
                    Code::from(raw),
                    String::from_utf8_lossy(&wire.payload).into_owned(),
                );
                Ok(Message::status(&status))
            }
            None if wire.operation.is_empty() => Err(MalformedPayload::MissingOperation),
            None => Ok(Message::new(wire.operation, wire.payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_message_survives_the_wire() {
        let codec = ProstCodec;
        let msg = Message::new("users.Users/GetUser", Bytes::from_static(b"\x0a\x03Bob"));

        let decoded = codec.decode(&codec.encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_status_record_survives_the_wire() {
        let codec = ProstCodec;
        let msg = Message::status(&tonic::Status::internal("boom"));

        let status = codec.decode(&codec.encode(&msg)).unwrap().to_status().unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "boom");
    }

    #[test]
    fn test_garbage_is_malformed() {
        let result = ProstCodec.decode(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(MalformedPayload::Decode(_))));
    }

    #[test]
    fn test_data_without_operation_is_malformed() {
        // An empty buffer is a valid envelope with every field defaulted.
        let result = ProstCodec.decode(&[]);
        assert!(matches!(result, Err(MalformedPayload::MissingOperation)));
    }

    #[test]
    fn test_out_of_range_status_is_malformed() {
        let wire = WireMessage {
            operation: String::new(),
            payload: Bytes::new(),
            status_code: Some(99),
        };
        let frame = prost::Message::encode_to_vec(&wire);

        let result = ProstCodec.decode(&frame);
        assert!(matches!(result, Err(MalformedPayload::UnknownStatus(99))));
    }
}
