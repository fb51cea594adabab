//! Client-side types: calls initiated from this end of a connection.
//!
//! The client runs the same [`StreamSession`](crate::session::StreamSession) state machine as the
//! server, with the directions swapped: requests go straight to the transport, responses are
//! routed into the call's inbound queue by a reader task.
//!
//! # Example
//!
//! ```ignore
//! let client = RpcClient::new(Arc::new(transport), events, RpcClientConfig::default());
//!
//! let reply: UserReply = client
//!     .unary("users.Users/GetUser", &UserRequest { name: "Ada".into() })
//!     .await?;
//!
//! let call = client.open::<UserRequest, UserReply>("users.Users/GetUserBidiStream")?;
//! let (sender, mut receiver) = call.split();
//! sender.send(&UserRequest { name: "A".into() }).await?;
//! sender.close_send().await?;
//! while let Some(reply) = receiver.message().await? {
//!     println!("{}", reply.message);
//! }
//! ```

mod call;
mod config;
mod rpc_client;

pub use call::{RpcCall, RpcReceiver, RpcSender};
pub use config::RpcClientConfig;
pub use rpc_client::RpcClient;
