//! Demo services served by the `greeter` binary and used by the end-to-end tests.

use std::time::Duration;

use crate::dispatcher::Router;
use crate::error::SessionError;

pub mod greeting;
pub mod login;
pub mod users;

/// Register every demo service on `router`.
///
/// `tick` paces the server-streaming `users.Users/GetUserStreamReply` operation.
pub fn register(router: &mut Router, tick: Duration) -> Result<(), SessionError> {
    users::register(router, tick)?;
    greeting::register(router)?;
    login::register(router)?;
    Ok(())
}
