use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tonic::Status;

use crate::registry::SessionRef;

type PayloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// The inbound side of a session as seen by a handler.
///
/// Ends when the peer half-closes and the queue is drained, when the session is cancelled, or when
/// the session is removed. An inbound status record from the peer surfaces as a single `Err` and
/// ends the stream.
pub struct Inbound {
    inner: PayloadStream,
}

impl Inbound {
    pub(crate) fn new(session: SessionRef) -> Self {
        let inner = async_stream::stream! {
            loop {
                let Ok(live) = session.upgrade() else { break };
                let next = live.inbound().dequeue().await;
                drop(live);

                match next {
                    Some(message) => match message.to_status() {
                        Some(status) => {
                            yield Err(status);
                            break;
                        }
                        None => yield Ok(message.into_payload()),
                    },
                    None => break,
                }
            }
        };

        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for Inbound {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// An [`Inbound`] whose payloads are decoded as protobuf `Req` messages.
///
/// Undecodable payloads surface as `Status::invalid_argument`.
pub struct DecodedInbound<Req> {
    inner: Inbound,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req> DecodedInbound<Req>
where
    Req: prost::Message + Default + Send + 'static,
{
    pub(crate) fn new(inner: Inbound) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Yield requests until the first error, dropping the error itself.
    pub fn into_ok_stream(self) -> impl Stream<Item = Req> + Send + 'static {
        self.take_while(|item| futures::future::ready(item.is_ok()))
            .filter_map(|item| futures::future::ready(item.ok()))
    }
}

impl<Req> Stream for DecodedInbound<Req>
where
    Req: prost::Message + Default + Send + 'static,
{
    type Item = Result<Req, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx).map(|item| {
            item.map(|payload| {
                payload.and_then(|bytes| {
                    Req::decode(bytes)
                        .map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::message::Message;
    use crate::registry::SessionRegistry;
    use crate::session::CancelReason;
    use crate::session_id::{ConnectionId, SessionId};

    #[tokio::test]
    async fn test_inbound_ends_on_half_close() {
        let registry = SessionRegistry::default();
        let session = registry
            .create(SessionId::new(ConnectionId::generate(), 1), &SessionConfig::default())
            .unwrap();
        let live = session.upgrade().unwrap();

        live.inbound().enqueue(Message::new("op", "a")).await.unwrap();
        live.close_inbound().unwrap();

        let mut inbound = Inbound::new(session.clone());
        assert_eq!(inbound.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_ends_on_cancel() {
        let registry = SessionRegistry::default();
        let session = registry
            .create(SessionId::new(ConnectionId::generate(), 1), &SessionConfig::default())
            .unwrap();

        let mut inbound = Inbound::new(session.clone());
        let reader = tokio::spawn(async move { inbound.next().await.is_none() });

        tokio::task::yield_now().await;
        session
            .view(|s| s.cancel(CancelReason::Requested))
            .unwrap()
            .unwrap();

        assert!(reader.await.unwrap());
    }

    #[tokio::test]
    async fn test_inbound_status_record_surfaces_once() {
        let registry = SessionRegistry::default();
        let session = registry
            .create(SessionId::new(ConnectionId::generate(), 1), &SessionConfig::default())
            .unwrap();
        let live = session.upgrade().unwrap();
        live.inbound()
            .enqueue(Message::status(&Status::aborted("client gave up")))
            .await
            .unwrap();
        live.inbound().enqueue(Message::new("op", "ignored")).await.unwrap();

        let mut inbound = Inbound::new(session.clone());
        let err = inbound.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        assert!(inbound.next().await.is_none());
    }
}
