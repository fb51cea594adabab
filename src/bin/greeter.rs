use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use duplex_session::client::{RpcClient, RpcClientConfig};
use duplex_session::services::greeting::{GREETING, GreetingRequest, GreetingResponse};
use duplex_session::services::login::{LOGIN, LoginRequest, LoginResponse};
use duplex_session::services::users::{
    GET_USER, GET_USER_BIDI_STREAM, GET_USER_STREAM_REPLY, UserReply, UserRequest,
};
use duplex_session::transport::MemoryTransport;
use duplex_session::{Router, Server, SessionConfig, services};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STREAM_REPLIES: usize = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let name = std::env::var("GREETER_NAME").unwrap_or_else(|_| "Ada Lovelace".to_string());
    let idle_timeout = std::env::var("GREETER_IDLE_TIMEOUT_MS")
        .ok()
        .map(|ms| ms.parse::<u64>())
        .transpose()?
        .map(Duration::from_millis);

    let mut router = Router::new();
    services::register(&mut router, Duration::from_millis(500))?;

    let config = SessionConfig::builder()
        .maybe_idle_timeout(idle_timeout)
        .build();
    let server = Server::new(router, config);

    let ((client_end, client_events), (server_end, server_events)) = MemoryTransport::pair(64);

    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve(Arc::new(server_end), server_events).await {
            error!("Server error: {e}");
        }
    });

    let client = RpcClient::new(
        Arc::new(client_end),
        client_events,
        RpcClientConfig::builder()
            .timeout(Duration::from_secs(5))
            .build(),
    );

    info!("Will try to greet world ...");
    let reply: UserReply = client
        .unary(GET_USER, &UserRequest { name: name.clone() })
        .await?;
    info!("Greeter client received: {}", reply.message);

    info!("Getting user stream reply");
    let mut stream = client
        .server_streaming::<UserRequest, UserReply>(
            GET_USER_STREAM_REPLY,
            &UserRequest { name: name.clone() },
        )
        .await?;
    for _ in 0..STREAM_REPLIES {
        match stream.message().await? {
            Some(reply) => info!("Greeter client received: {}", reply.message),
            None => break,
        }
    }
    stream.cancel().await;

    info!("Getting user bidi stream");
    let (sender, mut receiver) = client
        .open::<UserRequest, UserReply>(GET_USER_BIDI_STREAM)?
        .split();
    for i in 1..=3 {
        sender
            .send(&UserRequest {
                name: format!("{name} {i}"),
            })
            .await?;
    }
    sender.close_send().await?;
    while let Some(reply) = receiver.message().await? {
        info!("Greeter client received: {}", reply.message);
    }

    let greeting: GreetingResponse = client
        .unary(
            GREETING,
            &GreetingRequest {
                message: format!("Hi from {name}"),
            },
        )
        .await?;
    info!("Greeting service replied: {}", greeting.message);

    let login: LoginResponse = client
        .unary(
            LOGIN,
            &LoginRequest {
                user_name: "admin".to_string(),
                pass: "admin".to_string(),
            },
        )
        .await?;
    info!("Login service replied: {}", login.message);

    client.close().await;
    server.shutdown();
    Ok(())
}
