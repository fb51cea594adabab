use std::collections::VecDeque;

use super::StateMachine;
use crate::message::Message;

/// Pure bounded FIFO with close semantics; the core of a
/// [`FrameQueue`](crate::frame_queue::FrameQueue).
///
/// A capacity of `0` is a rendezvous: the buffer holds at most one message, and the container is
/// expected to hold the producer until [`taken`](QueueMachine::taken) passes its sequence number.
#[derive(Debug)]
pub struct QueueMachine {
    buffer: VecDeque<Message>,
    capacity: usize,
    closed: bool,
    pushed: u64,
    taken: u64,
    pending: Option<QueueOutput>,
}

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Full,
    Closed,
}

pub enum QueueInput {
    Push(Message),
    Take,
    Close,
    Discard,
}

#[derive(Debug)]
pub enum QueueOutput {
    /// The oldest buffered message.
    Item(Message),
    /// The queue is closed and fully drained.
    EndOfStream,
    /// A push was refused; the message is handed back so the producer can retry.
    Rejected {
        message: Message,
        reason: RejectReason,
    },
    /// Number of buffered messages dropped by a discard.
    Discarded(usize),
}

impl QueueMachine {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.max(1)),
            capacity,
            closed: false,
            pushed: 0,
            taken: 0,
            pending: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sequence number of the most recently accepted message (1-based).
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Number of messages handed to consumers so far.
    pub fn taken(&self) -> u64 {
        self.taken
    }

    /// Whether the message with sequence number `seq` is still deliverable, i.e. it has either been
    /// taken or still sits in the buffer.
    pub fn is_deliverable(&self, seq: u64) -> bool {
        self.taken + self.buffer.len() as u64 >= seq
    }

    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    fn push(&mut self, message: Message) -> Option<QueueOutput> {
        if self.closed {
            return Some(QueueOutput::Rejected {
                message,
                reason: RejectReason::Closed,
            });
        }

        if self.buffer.len() >= self.slots() {
            return Some(QueueOutput::Rejected {
                message,
                reason: RejectReason::Full,
            });
        }

        self.buffer.push_back(message);
        self.pushed += 1;
        None
    }

    fn take(&mut self) -> Option<QueueOutput> {
        match self.buffer.pop_front() {
            Some(message) => {
                self.taken += 1;
                Some(QueueOutput::Item(message))
            }
            None if self.closed => Some(QueueOutput::EndOfStream),
            None => None,
        }
    }

    fn discard(&mut self) -> Option<QueueOutput> {
        self.closed = true;
        let dropped = self.buffer.len();
        self.buffer.clear();
        Some(QueueOutput::Discarded(dropped))
    }
}

impl StateMachine for QueueMachine {
    type Input = QueueInput;
    type Output = QueueOutput;

    fn process_input(&mut self, input: Self::Input) {
        self.pending = match input {
            QueueInput::Push(message) => self.push(message),
            QueueInput::Take => self.take(),
            QueueInput::Close => {
                self.closed = true;
                None
            }
            QueueInput::Discard => self.discard(),
        };
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &'static str) -> Message {
        Message::new("test.Echo/Echo", body)
    }

    fn take(machine: &mut QueueMachine) -> Option<QueueOutput> {
        machine.process_input(QueueInput::Take);
        machine.poll_output()
    }

    #[test]
    fn test_push_and_take_in_fifo_order() {
        let mut machine = QueueMachine::new(4);

        machine.process_input(QueueInput::Push(msg("a")));
        assert!(machine.poll_output().is_none());
        machine.process_input(QueueInput::Push(msg("b")));
        assert!(machine.poll_output().is_none());
        assert_eq!(machine.len(), 2);

        assert!(matches!(take(&mut machine), Some(QueueOutput::Item(m)) if m == msg("a")));
        assert!(matches!(take(&mut machine), Some(QueueOutput::Item(m)) if m == msg("b")));
        assert!(take(&mut machine).is_none());
        assert_eq!(machine.taken(), 2);
    }

    #[test]
    fn test_push_beyond_capacity_is_rejected_as_full() {
        let mut machine = QueueMachine::new(2);

        machine.process_input(QueueInput::Push(msg("a")));
        machine.process_input(QueueInput::Push(msg("b")));
        machine.process_input(QueueInput::Push(msg("c")));

        assert!(matches!(
            machine.poll_output(),
            Some(QueueOutput::Rejected { reason: RejectReason::Full, message }) if message == msg("c")
        ));
        assert_eq!(machine.len(), 2);
    }

    #[test]
    fn test_closed_queue_rejects_push_and_drains() {
        let mut machine = QueueMachine::new(2);

        machine.process_input(QueueInput::Push(msg("a")));
        machine.process_input(QueueInput::Close);
        machine.process_input(QueueInput::Push(msg("b")));

        assert!(matches!(
            machine.poll_output(),
            Some(QueueOutput::Rejected { reason: RejectReason::Closed, .. })
        ));
        assert!(matches!(take(&mut machine), Some(QueueOutput::Item(_))));
        assert!(matches!(take(&mut machine), Some(QueueOutput::EndOfStream)));
        assert!(matches!(take(&mut machine), Some(QueueOutput::EndOfStream)));
    }

    #[test]
    fn test_discard_drops_buffered_messages() {
        let mut machine = QueueMachine::new(4);

        machine.process_input(QueueInput::Push(msg("a")));
        machine.process_input(QueueInput::Push(msg("b")));
        machine.process_input(QueueInput::Discard);

        assert!(matches!(machine.poll_output(), Some(QueueOutput::Discarded(2))));
        assert!(machine.is_closed());
        assert!(matches!(take(&mut machine), Some(QueueOutput::EndOfStream)));
        assert!(!machine.is_deliverable(1));
    }

    #[test]
    fn test_rendezvous_holds_a_single_message() {
        let mut machine = QueueMachine::new(0);

        machine.process_input(QueueInput::Push(msg("a")));
        assert!(machine.poll_output().is_none());
        let seq = machine.pushed();
        assert!(machine.taken() < seq);

        machine.process_input(QueueInput::Push(msg("b")));
        assert!(matches!(
            machine.poll_output(),
            Some(QueueOutput::Rejected { reason: RejectReason::Full, .. })
        ));

        assert!(matches!(take(&mut machine), Some(QueueOutput::Item(_))));
        assert!(machine.taken() >= seq);
    }

    #[test]
    fn test_close_keeps_buffered_message_deliverable() {
        let mut machine = QueueMachine::new(0);

        machine.process_input(QueueInput::Push(msg("a")));
        let seq = machine.pushed();
        machine.process_input(QueueInput::Close);

        assert!(machine.is_deliverable(seq));
    }
}
