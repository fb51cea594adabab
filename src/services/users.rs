use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio_stream::wrappers::IntervalStream;
use tracing::info;

use crate::dispatcher::Router;
use crate::error::SessionError;

pub const GET_USER: &str = "users.Users/GetUser";
pub const GET_USER_STREAM_REPLY: &str = "users.Users/GetUserStreamReply";
pub const GET_USER_BIDI_STREAM: &str = "users.Users/GetUserBidiStream";

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

pub fn greet(name: &str) -> String {
    format!("Hello, {name}")
}

pub fn register(router: &mut Router, tick: Duration) -> Result<(), SessionError> {
    router.register_unary::<UserRequest, UserReply, _, _>(GET_USER, |ctx, request| async move {
        info!(session_id = %ctx.session_id(), name = %request.name, "Client requested user");
        Ok(UserReply {
            message: greet(&request.name),
        })
    })?;

    // Ticks until the session is cancelled; the client decides when it has seen enough.
    router.register_server_streaming::<UserRequest, UserReply, _, _, _>(
        GET_USER_STREAM_REPLY,
        move |ctx, request| async move {
            info!(session_id = %ctx.session_id(), name = %request.name, "Client subscribed to user");
            let ticks = IntervalStream::new(tokio::time::interval(tick));

            Ok(ticks
                .take_until(ctx.cancel_token().cancelled_owned())
                .map(move |_| {
                    let temperature: f64 = rand::rng().random_range(20.0..30.0);
                    Ok(UserReply {
                        message: format!("{}, temperature: {temperature:.2}", greet(&request.name)),
                    })
                }))
        },
    )?;

    router.register_bidirectional::<UserRequest, UserReply, _, _, _>(
        GET_USER_BIDI_STREAM,
        |ctx, inbound| async move {
            let session_id = ctx.session_id().clone();
            Ok(inbound.into_ok_stream().map(move |request| {
                info!(session_id = %session_id, name = %request.name, "Client requested user");
                Ok(UserReply {
                    message: greet(&request.name),
                })
            }))
        },
    )?;

    Ok(())
}
