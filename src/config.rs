use std::time::Duration;

use bon::Builder;

/// How the multiplexer pump shares the transport between sessions with pending output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FairnessPolicy {
    /// One message per ready session per round.
    #[default]
    RoundRobin,
    /// Sessions with deeper outbound backlogs get proportionally more messages per round.
    WeightedByBacklog,
}

/// Configuration for the session engine.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Ceiling on the number of sessions the registry holds at once.
    #[builder(default = 1024)]
    pub max_concurrent_sessions: usize,

    /// Capacity of each inbound and outbound queue. `0` makes every hand-off a rendezvous.
    #[builder(default = 16)]
    pub per_session_queue_capacity: usize,

    /// Frames a session may have waiting for room in its inbound queue. A peer that sends past
    /// this is reset with a flow control error; other sessions on the connection are unaffected.
    #[builder(default = 64)]
    pub inbound_backlog: usize,

    /// Cancel a session after this long without inbound or outbound activity.
    /// Disabled when not set.
    pub idle_timeout: Option<Duration>,

    #[builder(default)]
    pub fairness_policy: FairnessPolicy,

    /// Upper bound on messages a single session may send in one weighted round.
    #[builder(default = 8)]
    pub max_batch: usize,

    /// Buffer size of the lifecycle event channel.
    #[builder(default = 256)]
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.max_concurrent_sessions, 1024);
        assert_eq!(config.per_session_queue_capacity, 16);
        assert_eq!(config.inbound_backlog, 64);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.fairness_policy, FairnessPolicy::RoundRobin);
    }

    #[test]
    fn test_builder_overrides() {
        let config = SessionConfig::builder()
            .max_concurrent_sessions(2)
            .idle_timeout(Duration::from_millis(100))
            .fairness_policy(FairnessPolicy::WeightedByBacklog)
            .build();

        assert_eq!(config.max_concurrent_sessions, 2);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(100)));
        assert_eq!(config.fairness_policy, FairnessPolicy::WeightedByBacklog);
    }
}
