use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tonic::Status;
use tracing::{debug, trace};

use crate::client::rpc_client::ClientShared;
use crate::codec::{Codec, MalformedPayload};
use crate::error::SessionError;
use crate::frame_queue::error::QueueClosed;
use crate::message::Message;
use crate::registry::SessionRef;
use crate::session::CancelReason;
use crate::session_id::{SessionId, StreamId};
use crate::transport::{ResetReason, Transport};

/// State shared by the halves of one call. Dropping the last half abandons the call.
pub(super) struct CallInner {
    client: Arc<ClientShared>,
    session: SessionRef,
    operation: Arc<str>,
}

impl CallInner {
    fn stream(&self) -> StreamId {
        self.session.session_id().stream()
    }

    async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let (state, reason) = self.session.view(|s| (s.state(), s.cancel_reason()))?;
        if let Some(reason) = reason {
            return Err(cancelled(reason).into());
        }
        if !state.outbound_open() {
            return Err(QueueClosed.into());
        }

        let frame = self
            .client
            .codec
            .encode(&Message::new(Arc::clone(&self.operation), payload));
        self.client.transport.send(self.stream(), frame).await?;
        Ok(())
    }

    async fn close_send(&self) -> Result<(), SessionError> {
        let closed = self.session.view(|s| s.close_outbound().map_err(|e| (e, s.cancel_reason())))?;
        match closed {
            Ok(_) => {}
            Err((_, Some(reason))) => return Err(cancelled(reason).into()),
            Err((e, None)) => return Err(e.into()),
        }
        self.client.transport.finish(self.stream()).await?;
        Ok(())
    }

    async fn next(&self) -> Result<Option<Bytes>, SessionError> {
        let live = self.session.upgrade()?;

        match live.inbound().dequeue().await {
            Some(message) => match message.to_status() {
                Some(status) => Err(status.into()),
                None => Ok(Some(message.into_payload())),
            },
            None => match live.cancel_reason() {
                Some(reason) => Err(cancelled(reason).into()),
                None => Ok(None),
            },
        }
    }

    async fn cancel(&self) {
        if self
            .session
            .view(|s| s.cancel(CancelReason::Requested).is_ok())
            .unwrap_or(false)
        {
            let _ = self
                .client
                .transport
                .reset(self.stream(), ResetReason::Cancel)
                .await;
        }
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        let abandoned = self
            .session
            .view(|s| s.cancel(CancelReason::Requested).is_ok())
            .unwrap_or(false);

        if abandoned && !self.client.is_closed() {
            debug!(session_id = %self.session.session_id(), "Call dropped before completion");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let transport = Arc::clone(&self.client.transport);
                let stream = self.stream();
                runtime.spawn(async move {
                    let _ = transport.reset(stream, ResetReason::Cancel).await;
                });
            }
        }

        if let Err(e) = self.client.registry.remove(self.session.session_id()) {
            trace!(session_id = %self.session.session_id(), error = %e, "Call already released");
        }
    }
}

/// The status a call fails with once its session was cancelled.
fn cancelled(reason: CancelReason) -> Status {
    match reason {
        CancelReason::ConnectionClosed | CancelReason::Shutdown => {
            Status::unavailable(format!("call cancelled: {reason}"))
        }
        CancelReason::IdleTimeout => Status::deadline_exceeded(format!("call cancelled: {reason}")),
        CancelReason::InboundOverflow => {
            Status::resource_exhausted(format!("call cancelled: {reason}"))
        }
        _ => Status::cancelled(format!("call cancelled: {reason}")),
    }
}

fn decode<Resp: prost::Message + Default>(payload: Bytes) -> Result<Resp, SessionError> {
    Resp::decode(payload)
        .map_err(MalformedPayload::from)
        .map_err(SessionError::from)
}

/// One client-initiated call, typed by its request and response messages.
///
/// Sends go straight to the transport; responses are read with [`message`](Self::message). Use
/// [`split`](Self::split) to send and receive from different tasks. Dropping the call before it
/// completes cancels it and resets the stream.
pub struct RpcCall<Req, Resp> {
    inner: Arc<CallInner>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> RpcCall<Req, Resp>
where
    Req: prost::Message,
    Resp: prost::Message + Default,
{
    pub(super) fn new(client: Arc<ClientShared>, session: SessionRef, operation: Arc<str>) -> Self {
        Self {
            inner: Arc::new(CallInner {
                client,
                session,
                operation,
            }),
            _marker: PhantomData,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.inner.session.session_id()
    }

    pub fn operation(&self) -> &str {
        &self.inner.operation
    }

    pub async fn send(&self, request: &Req) -> Result<(), SessionError> {
        self.inner.send(Bytes::from(request.encode_to_vec())).await
    }

    /// Half-close the request side. Responses keep flowing.
    pub async fn close_send(&self) -> Result<(), SessionError> {
        self.inner.close_send().await
    }

    /// The next response, or `None` once the server finished the stream.
    ///
    /// A status record from the server surfaces as [`SessionError::HandlerFailure`].
    pub async fn message(&mut self) -> Result<Option<Resp>, SessionError> {
        match self.inner.next().await? {
            Some(payload) => decode(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Abandon the call and reset its stream.
    pub async fn cancel(self) {
        self.inner.cancel().await;
    }

    pub fn split(self) -> (RpcSender<Req>, RpcReceiver<Resp>) {
        (
            RpcSender {
                inner: Arc::clone(&self.inner),
                _marker: PhantomData,
            },
            RpcReceiver {
                inner: self.inner,
                _marker: PhantomData,
            },
        )
    }
}

/// The request half of a split [`RpcCall`].
pub struct RpcSender<Req> {
    inner: Arc<CallInner>,
    _marker: PhantomData<fn(Req)>,
}

impl<Req: prost::Message> RpcSender<Req> {
    pub async fn send(&self, request: &Req) -> Result<(), SessionError> {
        self.inner.send(Bytes::from(request.encode_to_vec())).await
    }

    pub async fn close_send(&self) -> Result<(), SessionError> {
        self.inner.close_send().await
    }
}

/// The response half of a split [`RpcCall`].
pub struct RpcReceiver<Resp> {
    inner: Arc<CallInner>,
    _marker: PhantomData<fn() -> Resp>,
}

impl<Resp> RpcReceiver<Resp>
where
    Resp: prost::Message + Default + Send + 'static,
{
    pub async fn message(&mut self) -> Result<Option<Resp>, SessionError> {
        match self.inner.next().await? {
            Some(payload) => decode(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Responses as a stream that ends after the first error.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Resp, SessionError>> + Send + 'static {
        async_stream::stream! {
            loop {
                match self.message().await {
                    Ok(Some(response)) => yield Ok(response),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}
