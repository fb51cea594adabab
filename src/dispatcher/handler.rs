use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tonic::Status;
use tracing::info;

use crate::dispatcher::context::SessionContext;
use crate::dispatcher::inbound::{DecodedInbound, Inbound};
use crate::error::SessionError;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Encoded outbound payloads produced by a streaming handler.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

pub type UnaryFn = Arc<dyn Fn(SessionContext, Bytes) -> BoxFuture<Result<Bytes, Status>> + Send + Sync>;

pub type ServerStreamingFn =
    Arc<dyn Fn(SessionContext, Bytes) -> BoxFuture<Result<PayloadStream, Status>> + Send + Sync>;

pub type BidirectionalFn =
    Arc<dyn Fn(SessionContext, Inbound) -> BoxFuture<Result<PayloadStream, Status>> + Send + Sync>;

/// The declared call shape of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// Independent request and response streams.
    Bidirectional,
}

/// A handler tagged by the call shape it implements.
#[derive(Clone)]
pub enum Handler {
    Unary(UnaryFn),
    ServerStreaming(ServerStreamingFn),
    Bidirectional(BidirectionalFn),
}

impl Handler {
    pub fn kind(&self) -> CallKind {
        match self {
            Handler::Unary(_) => CallKind::Unary,
            Handler::ServerStreaming(_) => CallKind::ServerStreaming,
            Handler::Bidirectional(_) => CallKind::Bidirectional,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

fn decode_request<Req: prost::Message + Default>(payload: Bytes) -> Result<Req, Status> {
    Req::decode(payload).map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))
}

fn encode_response<Resp: prost::Message>(response: Resp) -> Bytes {
    Bytes::from(response.encode_to_vec())
}

fn encode_stream<S, Resp>(stream: S) -> PayloadStream
where
    Resp: prost::Message + 'static,
    S: Stream<Item = Result<Resp, Status>> + Send + 'static,
{
    Box::pin(stream.map(|item| item.map(encode_response)))
}

/// Operation name → handler table consulted for the first frame of every session.
#[derive(Debug, Default, Clone)]
pub struct Router {
    handlers: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler for `operation`.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        handler: Handler,
    ) -> Result<(), SessionError> {
        let operation = operation.into();
        if self.handlers.contains_key(&operation) {
            return Err(SessionError::DuplicateOperation(operation));
        }

        info!(operation = %operation, kind = ?handler.kind(), "Registered handler");
        self.handlers.insert(operation, handler);
        Ok(())
    }

    /// Register a unary handler over protobuf messages.
    ///
    /// # Example
    /// ```ignore
    /// router.register_unary::<UserRequest, UserReply, _, _>(
    ///     "users.Users/GetUser",
    ///     |_ctx, request| async move {
    ///         Ok(UserReply { message: format!("Hello, {}", request.name) })
    ///     },
    /// )?;
    /// ```
    pub fn register_unary<Req, Resp, F, Fut>(
        &mut self,
        operation: impl Into<String>,
        handler: F,
    ) -> Result<(), SessionError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Send + 'static,
        F: Fn(SessionContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let erased: UnaryFn = Arc::new(
            move |ctx: SessionContext, payload: Bytes| -> BoxFuture<Result<Bytes, Status>> {
                match decode_request::<Req>(payload) {
                    Ok(request) => {
                        let call = handler(ctx, request);
                        Box::pin(async move { call.await.map(encode_response::<Resp>) })
                    }
                    Err(status) => Box::pin(async move { Err(status) }),
                }
            },
        );

        self.register(operation, Handler::Unary(erased))
    }

    /// Register a server-streaming handler over protobuf messages.
    pub fn register_server_streaming<Req, Resp, F, Fut, S>(
        &mut self,
        operation: impl Into<String>,
        handler: F,
    ) -> Result<(), SessionError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Send + 'static,
        F: Fn(SessionContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let erased: ServerStreamingFn = Arc::new(
            move |ctx: SessionContext, payload: Bytes| -> BoxFuture<Result<PayloadStream, Status>> {
                match decode_request::<Req>(payload) {
                    Ok(request) => {
                        let call = handler(ctx, request);
                        Box::pin(async move { call.await.map(encode_stream::<S, Resp>) })
                    }
                    Err(status) => Box::pin(async move { Err(status) }),
                }
            },
        );

        self.register(operation, Handler::ServerStreaming(erased))
    }

    /// Register a bidirectional-streaming handler over protobuf messages.
    ///
    /// # Example
    /// ```ignore
    /// router.register_bidirectional::<UserRequest, UserReply, _, _, _>(
    ///     "users.Users/GetUserBidiStream",
    ///     |_ctx, inbound| async move {
    ///         Ok(inbound.into_ok_stream().map(|request| {
    ///             Ok(UserReply { message: format!("Hello, {}", request.name) })
    ///         }))
    ///     },
    /// )?;
    /// ```
    pub fn register_bidirectional<Req, Resp, F, Fut, S>(
        &mut self,
        operation: impl Into<String>,
        handler: F,
    ) -> Result<(), SessionError>
    where
        Req: prost::Message + Default + Send + 'static,
        Resp: prost::Message + Send + 'static,
        F: Fn(SessionContext, DecodedInbound<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let erased: BidirectionalFn = Arc::new(
            move |ctx: SessionContext, inbound: Inbound| -> BoxFuture<Result<PayloadStream, Status>> {
                let call = handler(ctx, DecodedInbound::new(inbound));
                Box::pin(async move { call.await.map(encode_stream::<S, Resp>) })
            },
        );

        self.register(operation, Handler::Bidirectional(erased))
    }

    pub fn get(&self, operation: &str) -> Option<&Handler> {
        self.handlers.get(operation)
    }

    /// Check if a handler is registered for the given operation.
    pub fn has_handler(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
