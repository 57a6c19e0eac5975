use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::lock::lock_ignore_poison;
use crate::{CorrelationTag, PubSubError, Publishable, Result};

/// A message accepted by `publish` but not yet handed to the transport.
#[derive(Clone, Debug)]
pub(crate) struct BufferedSend {
    // ---
    pub id: u64,
    pub publishable: Publishable,
    pub tag: Option<CorrelationTag>,
}

/// Ordered buffer between publishing callers and the send worker.
///
/// The worker peeks the head, sends it, and only then removes it, so a
/// message in flight to the transport still counts as unpublished.
pub(crate) struct SendBuffer {
    // ---
    items: Mutex<VecDeque<BufferedSend>>,
    capacity: Option<usize>,
    changed: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl SendBuffer {
    /// `capacity` of `None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        // ---
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            changed: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    /// Append a message.
    ///
    /// # Errors
    ///
    /// [`PubSubError::PublisherOverflow`] when a bounded buffer is full,
    /// [`PubSubError::IllegalState`] once the buffer is closed.
    pub fn push(&self, publishable: Publishable, tag: Option<CorrelationTag>) -> Result<()> {
        // ---
        {
            let mut items = lock_ignore_poison(&self.items);

            if self.closed.load(Ordering::SeqCst) {
                return Err(PubSubError::IllegalState("send buffer is closed".into()));
            }
            if let Some(capacity) = self.capacity {
                if items.len() >= capacity {
                    return Err(PubSubError::PublisherOverflow(format!(
                        "send buffer full ({capacity} messages)"
                    )));
                }
            }

            items.push_back(BufferedSend {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                publishable,
                tag,
            });
        }
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn peek(&self) -> Option<BufferedSend> {
        lock_ignore_poison(&self.items).front().cloned()
    }

    /// Remove the head if it is still the entry `id`.
    pub fn pop_if(&self, id: u64) -> Option<BufferedSend> {
        // ---
        let popped = {
            let mut items = lock_ignore_poison(&self.items);
            match items.front() {
                Some(head) if head.id == id => items.pop_front(),
                _ => None,
            }
        };
        self.changed.notify_waiters();
        popped
    }

    /// Remove and return everything still buffered.
    pub fn drain(&self) -> Vec<BufferedSend> {
        // ---
        let drained: Vec<_> = lock_ignore_poison(&self.items).drain(..).collect();
        self.changed.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_ignore_poison(&self.items).is_empty()
    }

    pub fn is_full(&self) -> bool {
        match self.capacity {
            Some(capacity) => self.len() >= capacity,
            None => false,
        }
    }

    /// Reject further pushes and release the worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Wake the worker without changing the contents.
    pub fn wake(&self) {
        self.changed.notify_waiters();
    }

    /// Wait for the head entry. `None` once the buffer is closed.
    pub async fn next(&self) -> Option<BufferedSend> {
        // ---
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(head) = self.peek() {
                return Some(head);
            }

            notified.await;
        }
    }

    /// Wait until the buffer is empty or `timeout` elapses.
    ///
    /// Returns the time left of `timeout`.
    pub async fn wait_for_empty(&self, timeout: Duration) -> Duration {
        // ---
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.is_empty() {
                return remaining;
            }
            if remaining.is_zero() {
                return Duration::ZERO;
            }

            let _ = time::timeout(remaining, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use super::*;
    use crate::{OutboundMessage, Topic};

    fn publishable() -> Publishable {
        Publishable::new(OutboundMessage::from("m"), Topic::of("t").unwrap())
    }

    #[test]
    fn test_bounded_buffer_overflows() {
        // ---
        let buffer = SendBuffer::new(Some(2));
        buffer.push(publishable(), None).unwrap();
        buffer.push(publishable(), None).unwrap();
        assert!(buffer.is_full());
        assert!(matches!(
            buffer.push(publishable(), None),
            Err(PubSubError::PublisherOverflow(_))
        ));

        let head = buffer.peek().unwrap();
        assert!(buffer.pop_if(head.id).is_some());
        assert!(buffer.pop_if(head.id).is_none());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_closed_buffer_rejects() {
        // ---
        let buffer = SendBuffer::new(None);
        buffer.close();
        assert!(matches!(
            buffer.push(publishable(), None),
            Err(PubSubError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_next_waits_for_push_and_ends_on_close() {
        // ---
        let buffer = Arc::new(SendBuffer::new(None));

        let worker = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut seen = 0;
                while let Some(head) = buffer.next().await {
                    buffer.pop_if(head.id);
                    seen += 1;
                }
                seen
            })
        };

        buffer.push(publishable(), None).unwrap();
        buffer.push(publishable(), None).unwrap();
        assert!(buffer.wait_for_empty(Duration::from_secs(1)).await > Duration::ZERO);

        buffer.close();
        assert_eq!(worker.await.unwrap(), 2);
    }
}
