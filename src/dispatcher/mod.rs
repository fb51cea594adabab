//! Runs exactly one handler invocation per session.
//!
//! The dispatcher bridges a session's inbound [`FrameQueue`](crate::frame_queue::FrameQueue)
//! through the handler into its outbound queue. Every invocation runs in its own tokio task, so a
//! stuck handler never holds up another session. Failures (a returned [`Status`] or a panic) are
//! trapped at this boundary and turned into a terminal status record for that session only.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::message::Message;
use crate::registry::SessionRef;
use crate::session::SessionState;

pub use self::context::SessionContext;
pub use self::handler::{
    BidirectionalFn, BoxFuture, CallKind, Handler, PayloadStream, Router, ServerStreamingFn,
    UnaryFn,
};
pub use self::inbound::{DecodedInbound, Inbound};

mod context;
mod handler;
mod inbound;

/// How a handler invocation ended.
#[derive(Debug)]
enum Outcome {
    /// The handler finished producing.
    Completed,
    /// The session was cancelled underneath the handler.
    Cancelled,
    /// The handler (or the request it was given) failed.
    Failed(Status),
}

/// Spawns and supervises handler invocations.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Start `handler` for `session`, addressed as `operation`.
    ///
    /// Fails with [`SessionError::AlreadyDispatched`] if the session already has a handler, so a
    /// handler never runs twice for the same call.
    pub fn dispatch(
        &self,
        session: SessionRef,
        operation: Arc<str>,
        handler: Handler,
    ) -> Result<JoinHandle<()>, SessionError> {
        let cancel_token = session.view(|live| {
            live.mark_dispatched()
                .then(|| live.cancel_token().clone())
        })?;
        let cancel_token =
            cancel_token.ok_or_else(|| SessionError::AlreadyDispatched(session.session_id().clone()))?;

        debug!(
            session_id = %session.session_id(),
            operation = %operation,
            kind = ?handler.kind(),
            "Dispatching handler"
        );

        let ctx = SessionContext::new(session.clone(), Arc::clone(&operation), cancel_token);
        Ok(tokio::spawn(run_handler(session, operation, handler, ctx)))
    }
}

async fn run_handler(
    session: SessionRef,
    operation: Arc<str>,
    handler: Handler,
    ctx: SessionContext,
) {
    let outcome = AssertUnwindSafe(drive(&session, &operation, handler, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Outcome::Failed(Status::internal("handler panicked")));

    finish(&session, outcome).await;
}

async fn drive(
    session: &SessionRef,
    operation: &Arc<str>,
    handler: Handler,
    ctx: SessionContext,
) -> Outcome {
    let cancel_token = ctx.cancel_token();

    let stream = match handler {
        Handler::Unary(call) => {
            let request = match first_request(session).await {
                Ok(request) => request,
                Err(outcome) => return outcome,
            };
            let response = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Outcome::Cancelled,
                response = call(ctx, request) => response,
            };
            return match response {
                Ok(payload) => emit(session, operation, payload).await,
                Err(status) => Outcome::Failed(status),
            };
        }

        Handler::ServerStreaming(call) => {
            let request = match first_request(session).await {
                Ok(request) => request,
                Err(outcome) => return outcome,
            };
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Outcome::Cancelled,
                stream = call(ctx, request) => stream,
            }
        }

        Handler::Bidirectional(call) => {
            let inbound = Inbound::new(session.clone());
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Outcome::Cancelled,
                stream = call(ctx, inbound) => stream,
            }
        }
    };

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(status) => return Outcome::Failed(status),
    };

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Outcome::Cancelled,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(payload)) => {
                if let outcome @ (Outcome::Cancelled | Outcome::Failed(_)) =
                    emit(session, operation, payload).await
                {
                    return outcome;
                }
            }
            Some(Err(status)) => return Outcome::Failed(status),
            None => return Outcome::Completed,
        }
    }
}

/// Wait for the single request of a unary or server-streaming call.
async fn first_request(session: &SessionRef) -> Result<Bytes, Outcome> {
    let Ok(live) = session.upgrade() else {
        return Err(Outcome::Cancelled);
    };
    let next = live.inbound().dequeue().await;

    match next {
        Some(message) => match message.to_status() {
            Some(status) => Err(Outcome::Failed(status)),
            None => Ok(message.into_payload()),
        },
        None if live.is_cancelled() => Err(Outcome::Cancelled),
        None => Err(Outcome::Failed(Status::invalid_argument(
            "stream closed before a request was received",
        ))),
    }
}

/// Enqueue one response, suspending while the outbound queue is full.
async fn emit(session: &SessionRef, operation: &Arc<str>, payload: Bytes) -> Outcome {
    let Ok(live) = session.upgrade() else {
        return Outcome::Cancelled;
    };

    match live
        .outbound()
        .enqueue(Message::new(Arc::clone(operation), payload))
        .await
    {
        Ok(()) => Outcome::Completed,
        // Only cancellation closes the outbound queue while the handler is still running.
        Err(_) => Outcome::Cancelled,
    }
}

async fn finish(session: &SessionRef, outcome: Outcome) {
    let Ok(live) = session.upgrade() else {
        return;
    };
    let session_id = live.id().clone();

    match outcome {
        Outcome::Completed => {
            if let Err(e) = live.close_outbound() {
                debug!(session_id = %session_id, error = %e, "Outbound already closed");
            }
            let dropped = live.abandon_inbound();
            debug!(session_id = %session_id, dropped, "Handler completed");
        }

        Outcome::Failed(status) => {
            warn!(
                session_id = %session_id,
                code = ?status.code(),
                message = %status.message(),
                "Handler failed"
            );

            if live.outbound().enqueue(Message::status(&status)).await.is_err() {
                debug!(session_id = %session_id, "Status record dropped, session already cancelled");
                return;
            }
            let _ = live.close_outbound();
            live.abandon_inbound();
            if live.state() == SessionState::HalfClosedOutbound {
                let _ = live.close_inbound();
            }
        }

        Outcome::Cancelled => {
            debug!(
                session_id = %session_id,
                reason = ?live.cancel_reason(),
                "Handler unwound after cancellation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SessionConfig;
    use crate::registry::SessionRegistry;
    use crate::session::CancelReason;
    use crate::session_id::{ConnectionId, SessionId};

    #[derive(Clone, PartialEq, prost::Message)]
    struct Name {
        #[prost(string, tag = "1")]
        name: String,
    }

    fn name(value: &str) -> Message {
        Message::new(
            "test.Greeter/Greet",
            Bytes::from(prost::Message::encode_to_vec(&Name {
                name: value.to_string(),
            })),
        )
    }

    fn decode(message: Message) -> String {
        <Name as prost::Message>::decode(message.into_payload())
            .unwrap()
            .name
    }

    fn open(registry: &SessionRegistry) -> SessionRef {
        registry
            .create(
                SessionId::new(ConnectionId::generate(), 1),
                &SessionConfig::builder().per_session_queue_capacity(4).build(),
            )
            .unwrap()
    }

    fn router() -> Router {
        let mut router = Router::new();
        router
            .register_unary::<Name, Name, _, _>("test.Greeter/Greet", |_ctx, request| async move {
                Ok(Name {
                    name: format!("Hello, {}", request.name),
                })
            })
            .unwrap();
        router
            .register_unary::<Name, Name, _, _>("test.Greeter/Fail", |_ctx, _request| async move {
                Err::<Name, _>(Status::not_found("nobody here"))
            })
            .unwrap();
        router
            .register_unary::<Name, Name, _, _>("test.Greeter/Panic", |_ctx, _request| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(Name::default())
            })
            .unwrap();
        router
            .register_bidirectional::<Name, Name, _, _, _>(
                "test.Greeter/Chat",
                |_ctx, inbound| async move {
                    Ok(inbound.into_ok_stream().map(|request| {
                        Ok(Name {
                            name: format!("Hello, {}", request.name),
                        })
                    }))
                },
            )
            .unwrap();
        router
            .register_server_streaming::<Name, Name, _, _, _>(
                "test.Greeter/Forever",
                |ctx, request| async move {
                    Ok(async_stream::stream! {
                        while !ctx.is_cancelled() {
                            yield Ok(Name { name: request.name.clone() });
                        }
                    })
                },
            )
            .unwrap();
        router
    }

    fn dispatch(session: &SessionRef, operation: &str) -> JoinHandle<()> {
        let handler = router().get(operation).unwrap().clone();
        Dispatcher::new()
            .dispatch(session.clone(), Arc::from(operation), handler)
            .unwrap()
    }

    #[tokio::test]
    async fn test_unary_produces_one_response_and_half_closes() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let live = session.upgrade().unwrap();

        live.inbound().enqueue(name("Ada")).await.unwrap();
        dispatch(&session, "test.Greeter/Greet").await.unwrap();

        assert_eq!(decode(live.outbound().dequeue().await.unwrap()), "Hello, Ada");
        assert_eq!(live.outbound().dequeue().await, None);
        assert_eq!(live.state(), SessionState::HalfClosedOutbound);

        live.close_inbound().unwrap();
        assert_eq!(live.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handler_failure_emits_status_and_closes() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let live = session.upgrade().unwrap();

        live.inbound().enqueue(name("Ada")).await.unwrap();
        dispatch(&session, "test.Greeter/Fail").await.unwrap();

        let record = live.outbound().dequeue().await.unwrap();
        assert_eq!(record.to_status().unwrap().code(), tonic::Code::NotFound);
        assert_eq!(live.outbound().dequeue().await, None);
        assert_eq!(live.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handler_panic_is_trapped() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let live = session.upgrade().unwrap();

        live.inbound().enqueue(name("Ada")).await.unwrap();
        dispatch(&session, "test.Greeter/Panic").await.unwrap();

        let record = live.outbound().dequeue().await.unwrap();
        assert_eq!(record.to_status().unwrap().code(), tonic::Code::Internal);
        assert_eq!(live.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unary_without_request_fails() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let live = session.upgrade().unwrap();

        live.close_inbound().unwrap();
        dispatch(&session, "test.Greeter/Greet").await.unwrap();

        let record = live.outbound().dequeue().await.unwrap();
        assert_eq!(
            record.to_status().unwrap().code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(live.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_bidirectional_echo_preserves_order() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let live = session.upgrade().unwrap();
        let task = dispatch(&session, "test.Greeter/Chat");

        let names: Vec<String> = (0..20).map(|i| format!("user-{i}")).collect();
        let feeder = {
            let live = Arc::clone(&live);
            let names = names.clone();
            tokio::spawn(async move {
                for n in &names {
                    live.inbound().enqueue(name(n)).await.unwrap();
                }
                live.close_inbound().unwrap();
            })
        };

        let mut replies = Vec::new();
        while let Some(message) = live.outbound().dequeue().await {
            replies.push(decode(message));
        }
        feeder.await.unwrap();
        task.await.unwrap();

        let expected: Vec<String> = names.iter().map(|n| format!("Hello, {n}")).collect();
        assert_eq!(replies, expected);
        assert_eq!(live.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_stops_streaming_handler() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let live = session.upgrade().unwrap();

        live.inbound().enqueue(name("loop")).await.unwrap();
        let task = dispatch(&session, "test.Greeter/Forever");

        // Let the handler fill the outbound queue, then pull it down.
        assert!(live.outbound().dequeue().await.is_some());
        live.cancel(CancelReason::Requested).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.state(), SessionState::Cancelled);
        assert_eq!(live.outbound().dequeue().await, None);
    }

    #[tokio::test]
    async fn test_second_dispatch_is_refused() {
        let registry = SessionRegistry::default();
        let session = open(&registry);
        let handler = router().get("test.Greeter/Greet").unwrap().clone();

        let dispatcher = Dispatcher::new();
        let _first = dispatcher
            .dispatch(session.clone(), Arc::from("test.Greeter/Greet"), handler.clone())
            .unwrap();
        let second = dispatcher.dispatch(session.clone(), Arc::from("test.Greeter/Greet"), handler);

        assert!(matches!(second, Err(SessionError::AlreadyDispatched(_))));
    }
}
