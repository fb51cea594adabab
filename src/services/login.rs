use crate::dispatcher::Router;
use crate::error::SessionError;

pub const LOGIN: &str = "login.LoginService/Login";

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginRequest {
    #[prost(string, tag = "1")]
    pub user_name: String,
    #[prost(string, tag = "2")]
    pub pass: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginResponse {
    #[prost(string, tag = "1")]
    pub message: String,
}

// Demo credentials; there is no user store behind this service.
fn check(request: &LoginRequest) -> bool {
    request.user_name == "admin" && request.pass == "admin"
}

pub fn register(router: &mut Router) -> Result<(), SessionError> {
    router.register_unary::<LoginRequest, LoginResponse, _, _>(LOGIN, |_ctx, request| async move {
        let message = if check(&request) {
            "Congratulations for login"
        } else {
            "Failed to login"
        };
        Ok(LoginResponse {
            message: message.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_admin_admin_logs_in() {
        let request = |user: &str, pass: &str| LoginRequest {
            user_name: user.to_string(),
            pass: pass.to_string(),
        };

        assert!(check(&request("admin", "admin")));
        assert!(!check(&request("admin", "hunter2")));
        assert!(!check(&request("root", "admin")));
    }
}
