use std::fmt;

use super::StateMachine;

/// Lifecycle state of a [`StreamSession`](crate::session::StreamSession).
///
/// Transitions only move forward along
/// `Open → {HalfClosedInbound, HalfClosedOutbound} → Closed`, with `Cancelled` reachable from any
/// non-terminal state. `Closed` and `Cancelled` absorb every further input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Open,
    /// The peer is done sending; the handler may still produce.
    HalfClosedInbound,
    /// The handler is done producing; the peer may still send.
    HalfClosedOutbound,
    Closed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Cancelled)
    }

    pub fn inbound_open(self) -> bool {
        matches!(self, SessionState::Open | SessionState::HalfClosedOutbound)
    }

    pub fn outbound_open(self) -> bool {
        matches!(self, SessionState::Open | SessionState::HalfClosedInbound)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::HalfClosedInbound => "half-closed (inbound)",
            SessionState::HalfClosedOutbound => "half-closed (outbound)",
            SessionState::Closed => "closed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Explicit request from the application.
    Requested,
    /// No inbound or outbound activity within the configured idle timeout.
    IdleTimeout,
    /// The peer reset the stream with the given reason code.
    StreamReset(u32),
    /// An inbound frame could not be decoded.
    MalformedPayload,
    /// The peer sent more than the session's inbound backlog holds.
    InboundOverflow,
    /// The connection carrying the session went away.
    ConnectionClosed,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancelled by request"),
            CancelReason::IdleTimeout => f.write_str("idle timeout"),
            CancelReason::StreamReset(code) => write!(f, "stream reset by peer (code {code})"),
            CancelReason::MalformedPayload => f.write_str("malformed payload"),
            CancelReason::InboundOverflow => f.write_str("inbound backlog overflow"),
            CancelReason::ConnectionClosed => f.write_str("connection closed"),
            CancelReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    CloseInbound,
    CloseOutbound,
    Cancel(CancelReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutput {
    Transition {
        from: SessionState,
        to: SessionState,
    },
    /// The input is not valid in the current state; nothing changed.
    Rejected {
        state: SessionState,
        input: SessionInput,
    },
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    cancel_reason: Option<CancelReason>,
    pending: Option<SessionOutput>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Open,
            cancel_reason: None,
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    fn next_state(&self, input: SessionInput) -> Option<SessionState> {
        use SessionState::*;

        match (self.state, input) {
            (Closed | Cancelled, _) => None,
            (_, SessionInput::Cancel(_)) => Some(Cancelled),
            (Open, SessionInput::CloseInbound) => Some(HalfClosedInbound),
            (Open, SessionInput::CloseOutbound) => Some(HalfClosedOutbound),
            (HalfClosedOutbound, SessionInput::CloseInbound) => Some(Closed),
            (HalfClosedInbound, SessionInput::CloseOutbound) => Some(Closed),
            (HalfClosedInbound, SessionInput::CloseInbound) => None,
            (HalfClosedOutbound, SessionInput::CloseOutbound) => None,
        }
    }

    fn apply(&mut self, input: SessionInput) -> SessionOutput {
        let from = self.state;
        match self.next_state(input) {
            Some(to) => {
                self.state = to;
                if let SessionInput::Cancel(reason) = input {
                    self.cancel_reason = Some(reason);
                }
                SessionOutput::Transition { from, to }
            }
            None => SessionOutput::Rejected { state: from, input },
        }
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for SessionStateMachine {
    type Input = SessionInput;
    type Output = SessionOutput;

    fn process_input(&mut self, input: Self::Input) {
        self.pending = Some(self.apply(input));
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(machine: &mut SessionStateMachine, input: SessionInput) -> SessionOutput {
        machine.process_input(input);
        machine.poll_output().unwrap()
    }

    #[test]
    fn test_inbound_then_outbound_reaches_closed() {
        let mut machine = SessionStateMachine::new();

        assert_eq!(
            step(&mut machine, SessionInput::CloseInbound),
            SessionOutput::Transition {
                from: SessionState::Open,
                to: SessionState::HalfClosedInbound
            }
        );
        assert_eq!(
            step(&mut machine, SessionInput::CloseOutbound),
            SessionOutput::Transition {
                from: SessionState::HalfClosedInbound,
                to: SessionState::Closed
            }
        );
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_outbound_then_inbound_reaches_closed() {
        let mut machine = SessionStateMachine::new();

        step(&mut machine, SessionInput::CloseOutbound);
        assert_eq!(machine.state(), SessionState::HalfClosedOutbound);
        step(&mut machine, SessionInput::CloseInbound);
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_repeated_half_close_is_rejected() {
        let mut machine = SessionStateMachine::new();

        step(&mut machine, SessionInput::CloseInbound);
        assert!(matches!(
            step(&mut machine, SessionInput::CloseInbound),
            SessionOutput::Rejected {
                state: SessionState::HalfClosedInbound,
                ..
            }
        ));
        assert_eq!(machine.state(), SessionState::HalfClosedInbound);
    }

    #[test]
    fn test_cancel_from_every_non_terminal_state() {
        let paths: [&[SessionInput]; 3] = [
            &[],
            &[SessionInput::CloseInbound],
            &[SessionInput::CloseOutbound],
        ];

        for path in paths {
            let mut machine = SessionStateMachine::new();
            for input in path {
                step(&mut machine, *input);
            }

            let out = step(&mut machine, SessionInput::Cancel(CancelReason::Requested));
            assert!(matches!(
                out,
                SessionOutput::Transition {
                    to: SessionState::Cancelled,
                    ..
                }
            ));
            assert_eq!(machine.cancel_reason(), Some(CancelReason::Requested));
        }
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        let mut closed = SessionStateMachine::new();
        step(&mut closed, SessionInput::CloseInbound);
        step(&mut closed, SessionInput::CloseOutbound);

        let mut cancelled = SessionStateMachine::new();
        step(&mut cancelled, SessionInput::Cancel(CancelReason::IdleTimeout));

        for machine in [&mut closed, &mut cancelled] {
            let before = machine.state();
            for input in [
                SessionInput::CloseInbound,
                SessionInput::CloseOutbound,
                SessionInput::Cancel(CancelReason::Shutdown),
            ] {
                assert!(matches!(
                    step(machine, input),
                    SessionOutput::Rejected { .. }
                ));
            }
            assert_eq!(machine.state(), before);
        }

        assert_eq!(cancelled.cancel_reason(), Some(CancelReason::IdleTimeout));
        assert_eq!(closed.cancel_reason(), None);
    }
}
