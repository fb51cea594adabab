use std::time::Duration;

use bon::Builder;

use crate::config::SessionConfig;

/// Configuration for the RPC client.
#[derive(Debug, Clone, Builder)]
pub struct RpcClientConfig {
    /// How long a unary call waits for its response.
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,

    /// Capacity of each call's response queue.
    #[builder(default = 16)]
    pub queue_capacity: usize,

    /// Responses a call may have waiting for room in its queue before it is reset.
    #[builder(default = 64)]
    pub inbound_backlog: usize,

    /// Ceiling on calls open at once on this client.
    #[builder(default = 1024)]
    pub max_concurrent_calls: usize,
}

impl RpcClientConfig {
    /// Session settings for the client-side registry.
    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig::builder()
            .max_concurrent_sessions(self.max_concurrent_calls)
            .per_session_queue_capacity(self.queue_capacity)
            .inbound_backlog(self.inbound_backlog)
            .build()
    }
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
