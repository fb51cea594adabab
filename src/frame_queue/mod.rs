use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::Notify;

use self::error::QueueClosed;
use crate::activity::Activity;
use crate::message::Message;
use crate::state_machine::StateMachine;
use crate::state_machine::queue::{QueueInput, QueueMachine, QueueOutput, RejectReason};

pub mod error;

/// Result of a non-suspending [`FrameQueue::try_dequeue`].
#[derive(Debug)]
pub enum TryDequeue {
    Item(Message),
    /// Nothing buffered, but the queue is still open.
    Empty,
    /// Closed and fully drained.
    EndOfStream,
}

/// A bounded, ordered buffer of [`Message`]s for one direction of one session.
///
/// Producers suspend in [`enqueue`](Self::enqueue) while the queue is full and consumers suspend
/// in [`dequeue`](Self::dequeue) while it is empty, which is how backpressure travels between the
/// multiplexer and a handler. Closing never loses buffered messages: consumers drain what is left
/// and then observe end of stream. Only [`close_and_discard`](Self::close_and_discard) drops data.
///
/// With a capacity of `0` the queue is a rendezvous: `enqueue` returns only once a consumer has
/// taken the message.
pub struct FrameQueue {
    machine: Mutex<QueueMachine>,
    changed: Notify,
    activity: Option<Arc<Activity>>,
    ready: OnceLock<Arc<Notify>>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            machine: Mutex::new(QueueMachine::new(capacity)),
            changed: Notify::new(),
            activity: None,
            ready: OnceLock::new(),
        }
    }

    /// A queue that records every successful enqueue and dequeue on `activity`.
    pub fn with_activity(capacity: usize, activity: Arc<Activity>) -> Self {
        Self {
            activity: Some(activity),
            ..Self::new(capacity)
        }
    }

    /// Install a signal that is notified whenever a message is enqueued or the queue closes.
    ///
    /// A queue has a single consumer, so only one signal can be installed. A second attempt hands
    /// the rejected signal back.
    pub fn set_ready_signal(&self, ready: Arc<Notify>) -> Result<(), Arc<Notify>> {
        self.ready.set(ready)
    }

    fn lock(&self) -> MutexGuard<'_, QueueMachine> {
        self.machine.lock().expect("frame queue lock poisoned")
    }

    fn signal_change(&self) {
        self.changed.notify_waiters();
        if let Some(ready) = self.ready.get() {
            ready.notify_waiters();
        }
    }

    fn record_activity(&self) {
        if let Some(activity) = &self.activity {
            activity.touch();
        }
    }

    /// Append `message`, suspending while the queue is full.
    ///
    /// Fails immediately with [`QueueClosed`] once the queue is closed, including when it closes
    /// while this call is waiting for space.
    pub async fn enqueue(&self, mut message: Message) -> Result<(), QueueClosed> {
        let seq = loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut machine = self.lock();
                machine.process_input(QueueInput::Push(message));
                match machine.poll_output() {
                    None => break machine.pushed(),
                    Some(QueueOutput::Rejected {
                        message: returned,
                        reason: RejectReason::Full,
                    }) => message = returned,
                    Some(_) => return Err(QueueClosed),
                }
            }

            notified.await;
        };

        self.record_activity();
        self.signal_change();

        if self.capacity() == 0 {
            self.await_hand_off(seq).await
        } else {
            Ok(())
        }
    }

    async fn await_hand_off(&self, seq: u64) -> Result<(), QueueClosed> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let machine = self.lock();
                if machine.taken() >= seq {
                    return Ok(());
                }
                if machine.is_closed() {
                    return if machine.is_deliverable(seq) {
                        Ok(())
                    } else {
                        Err(QueueClosed)
                    };
                }
            }

            notified.await;
        }
    }

    /// Take the oldest message, suspending while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<Message> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_dequeue() {
                TryDequeue::Item(message) => return Some(message),
                TryDequeue::EndOfStream => return None,
                TryDequeue::Empty => {}
            }

            notified.await;
        }
    }

    /// Take the oldest message without suspending.
    pub fn try_dequeue(&self) -> TryDequeue {
        let output = {
            let mut machine = self.lock();
            machine.process_input(QueueInput::Take);
            machine.poll_output()
        };

        match output {
            Some(QueueOutput::Item(message)) => {
                self.record_activity();
                self.changed.notify_waiters();
                TryDequeue::Item(message)
            }
            Some(QueueOutput::EndOfStream) => TryDequeue::EndOfStream,
            _ => TryDequeue::Empty,
        }
    }

    /// Close the queue. Idempotent; buffered messages stay available to consumers.
    pub fn close(&self) {
        self.lock().process_input(QueueInput::Close);
        self.signal_change();
    }

    /// Close the queue and drop everything still buffered, returning how many messages were lost.
    pub fn close_and_discard(&self) -> usize {
        let dropped = {
            let mut machine = self.lock();
            machine.process_input(QueueInput::Discard);
            match machine.poll_output() {
                Some(QueueOutput::Discarded(dropped)) => dropped,
                _ => 0,
            }
        };
        self.signal_change();
        dropped
    }

    /// Resolve once the queue is closed and every buffered message has been taken or discarded.
    pub async fn drained(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let machine = self.lock();
                if machine.is_closed() && machine.is_empty() {
                    return;
                }
            }

            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.lock();
        f.debug_struct("FrameQueue")
            .field("len", &machine.len())
            .field("capacity", &machine.capacity())
            .field("closed", &machine.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn msg(body: &str) -> Message {
        Message::new("test.Echo/Echo", body.to_string())
    }

    #[tokio::test]
    async fn test_dequeue_preserves_producer_order() {
        let queue = Arc::new(FrameQueue::new(4));

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..32 {
                    queue.enqueue(msg(&i.to_string())).await.unwrap();
                }
                queue.close();
            })
        };

        let mut received = Vec::new();
        while let Some(message) = queue.dequeue().await {
            received.push(String::from_utf8(message.into_payload().to_vec()).unwrap());
        }
        producer.await.unwrap();

        let expected: Vec<String> = (0..32).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_enqueue_on_closed_queue_fails_without_blocking() {
        let queue = FrameQueue::new(0);
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), queue.enqueue(msg("late"))).await;
        assert_eq!(result.unwrap(), Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_close_drains_then_signals_end_of_stream() {
        let queue = FrameQueue::new(4);
        queue.enqueue(msg("a")).await.unwrap();
        queue.enqueue(msg("b")).await.unwrap();

        queue.close();
        queue.close();

        assert_eq!(queue.dequeue().await, Some(msg("a")));
        assert_eq!(queue.dequeue().await, Some(msg("b")));
        assert_eq!(queue.dequeue().await, None);
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_enqueue_suspends_until_a_dequeue() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.enqueue(msg("1")).await.unwrap();
        queue.enqueue(msg("2")).await.unwrap();

        let third = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(msg("3")).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!third.is_finished());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().await, Some(msg("1")));
        third.await.unwrap().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_dequeuer() {
        let queue = Arc::new(FrameQueue::new(1));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_enqueuer_with_error() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.enqueue(msg("fill")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(msg("blocked")).await })
        };

        tokio::task::yield_now().await;
        queue.close();

        assert_eq!(producer.await.unwrap(), Err(QueueClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rendezvous_waits_for_consumer() {
        let queue = Arc::new(FrameQueue::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(msg("hand-off")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.dequeue().await, Some(msg("hand-off")));
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_discard_fails_pending_rendezvous() {
        let queue = Arc::new(FrameQueue::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(msg("dropped")).await })
        };

        while queue.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.close_and_discard(), 1);

        assert_eq!(producer.await.unwrap(), Err(QueueClosed));
        assert!(matches!(queue.try_dequeue(), TryDequeue::EndOfStream));
    }

    #[tokio::test]
    async fn test_drained_resolves_after_close_and_consumption() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.enqueue(msg("a")).await.unwrap();
        queue.close();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.drained().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(matches!(queue.try_dequeue(), TryDequeue::Item(_)));
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_signal_is_installed_once() {
        let queue = FrameQueue::new(2);
        let first = Arc::new(Notify::new());
        let second = Arc::new(Notify::new());

        queue.set_ready_signal(Arc::clone(&first)).unwrap();
        let rejected = queue.set_ready_signal(Arc::clone(&second)).unwrap_err();
        assert!(Arc::ptr_eq(&rejected, &second));

        let notified = first.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        queue.enqueue(msg("a")).await.unwrap();
        notified.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_is_recorded_on_both_ends() {
        let activity = Arc::new(Activity::new());
        let queue = FrameQueue::with_activity(2, Arc::clone(&activity));
        let start = activity.last();

        tokio::time::advance(Duration::from_millis(10)).await;
        queue.enqueue(msg("a")).await.unwrap();
        assert_eq!(activity.last() - start, Duration::from_millis(10));

        tokio::time::advance(Duration::from_millis(10)).await;
        queue.try_dequeue();
        assert_eq!(activity.last() - start, Duration::from_millis(20));
    }
}
