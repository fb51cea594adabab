use tracing::info;

use crate::dispatcher::Router;
use crate::error::SessionError;

pub const GREETING: &str = "greeting.GreetingService/Greeting";

#[derive(Clone, PartialEq, prost::Message)]
pub struct GreetingRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GreetingResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

pub fn register(router: &mut Router) -> Result<(), SessionError> {
    router.register_unary::<GreetingRequest, GreetingResponse, _, _>(
        GREETING,
        |ctx, request| async move {
            info!(session_id = %ctx.session_id(), message = %request.message, "Received greeting");
            Ok(GreetingResponse {
                message: format!("Received your: {}. Hello from server", request.message),
            })
        },
    )
}
