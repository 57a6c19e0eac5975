use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::lock::lock_ignore_poison;
use crate::InboundMessage;

/// Inbound message buffer of one receiver.
///
/// `push` is called from transport callbacks and never waits. Consumers (the
/// dispatch worker and any number of `receive_message` callers) wait on the
/// same notification; every change wakes all of them.
///
/// Once closed, consumers still get the remaining messages, then `None`.
#[derive(Default)]
pub(crate) struct InboundBuffer {
    // ---
    messages: Mutex<VecDeque<InboundMessage>>,
    changed: Notify,
    closed: AtomicBool,
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns `false` if the buffer is closed.
    pub fn push(&self, message: InboundMessage) -> bool {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        lock_ignore_poison(&self.messages).push_back(message);
        self.changed.notify_waiters();
        true
    }

    pub fn pop(&self) -> Option<InboundMessage> {
        // ---
        let message = lock_ignore_poison(&self.messages).pop_front();
        if message.is_some() {
            self.changed.notify_waiters();
        }
        message
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_ignore_poison(&self.messages).is_empty()
    }

    /// Discard every buffered message, returning how many were dropped.
    pub fn clear(&self) -> usize {
        // ---
        let dropped = {
            let mut messages = lock_ignore_poison(&self.messages);
            let n = messages.len();
            messages.clear();
            n
        };
        self.changed.notify_waiters();
        dropped
    }

    /// Stop accepting messages and wake every waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take the next message, waiting up to `timeout` (forever for `None`).
    ///
    /// Returns `None` on timeout, or once the buffer is closed and empty.
    pub async fn recv(&self, timeout: Option<Duration>) -> Option<InboundMessage> {
        // ---
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.pop() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return self.pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wait until consumers emptied the buffer, or `timeout` elapses.
    ///
    /// Returns `true` if the buffer is empty.
    pub async fn wait_for_drained(&self, timeout: Duration) -> bool {
        // ---
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use super::*;
    use crate::Topic;

    fn message(n: u8) -> InboundMessage {
        InboundMessage::new(Topic::of("t").unwrap(), vec![n])
    }

    #[tokio::test]
    async fn test_recv_times_out_without_traffic() {
        // ---
        let buffer = InboundBuffer::new();
        let started = Instant::now();

        assert!(buffer.recv(Some(Duration::from_millis(50))).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumers_after_backlog() {
        // ---
        let buffer = Arc::new(InboundBuffer::new());
        buffer.push(message(1));

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let first = buffer.recv(None).await;
                let second = buffer.recv(None).await;
                (first, second)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert!(!buffer.push(message(2)));

        let (first, second) = waiter.await.unwrap();
        assert_eq!(&first.unwrap().payload[..], &[1u8]);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_drained() {
        // ---
        let buffer = Arc::new(InboundBuffer::new());
        buffer.push(message(1));
        assert!(!buffer.wait_for_drained(Duration::from_millis(10)).await);

        let consumer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            consumer.pop();
        });
        assert!(buffer.wait_for_drained(Duration::from_secs(2)).await);
        assert_eq!(buffer.clear(), 0);
    }
}
