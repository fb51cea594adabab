//! # duplex-session
//!
//! A session engine for bidirectional streaming RPC. Many long-lived duplex streams share one
//! connection; each stream is a [`StreamSession`] with its own bounded inbound and outbound
//! [`FrameQueue`](frame_queue::FrameQueue), half-close state and cancellation token.
//!
//! ## Server Side
//!
//! ```ignore
//! use duplex_session::{Router, Server, SessionConfig};
//!
//! let mut router = Router::new();
//! router.register_bidirectional::<UserRequest, UserReply, _, _, _>(
//!     "users.Users/GetUserBidiStream",
//!     |_ctx, inbound| async move {
//!         Ok(inbound.into_ok_stream().map(|request| {
//!             Ok(UserReply { message: format!("Hello, {}", request.name) })
//!         }))
//!     },
//! )?;
//!
//! let server = Server::new(router, SessionConfig::default());
//! server.serve(Arc::new(transport), events).await?;
//! ```
//!
//! ## Client Side
//!
//! ```ignore
//! use duplex_session::client::{RpcClient, RpcClientConfig};
//!
//! let client = RpcClient::new(Arc::new(transport), events, RpcClientConfig::default());
//! let reply: UserReply = client.unary("users.Users/GetUser", &request).await?;
//! ```

pub mod activity;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame_queue;
pub mod lifecycle;
pub mod message;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod services;
pub mod session;
pub mod session_id;
pub mod state_machine;
pub mod transport;

pub use codec::{Codec, MalformedPayload, ProstCodec};
pub use config::{FairnessPolicy, SessionConfig};
pub use dispatcher::{Dispatcher, Handler, Router, SessionContext};
pub use error::SessionError;
pub use frame_queue::FrameQueue;
pub use lifecycle::{LifecycleEvent, LifecycleKind};
pub use message::Message;
pub use multiplexer::ConnectionMultiplexer;
pub use registry::{SessionRef, SessionRegistry};
pub use server::Server;
pub use session::{CancelReason, SessionState, StreamSession};
pub use session_id::{ConnectionId, SessionId, StreamId};
pub use transport::{MemoryTransport, Transport, TransportEvent};
