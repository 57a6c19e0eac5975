use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::lock::lock_ignore_poison;
use crate::AckEvent;

// Upper bound on how long `wait_for_empty` sleeps before re-checking its
// extra condition, which may change without notifying this queue.
const RECHECK_INTERVAL: Duration = Duration::from_millis(10);

/// FIFO of acknowledgement events awaiting receipt delivery.
///
/// Producers (the transport ack callback, the publisher's synthetic failure
/// path) never block beyond a short critical section. The delivery dispatcher
/// is the only consumer and uses `peek` + `pop` so an event stays queued until
/// its receipt has actually been handed to the listener.
#[derive(Default)]
pub(crate) struct AckQueue {
    // ---
    events: Mutex<VecDeque<AckEvent>>,
    changed: Notify,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: AckEvent) {
        // ---
        lock_ignore_poison(&self.events).push_back(event);
        self.changed.notify_waiters();
    }

    /// A copy of the head event, if any.
    pub fn peek(&self) -> Option<AckEvent> {
        lock_ignore_poison(&self.events).front().cloned()
    }

    pub fn pop(&self) -> Option<AckEvent> {
        // ---
        let event = lock_ignore_poison(&self.events).pop_front();
        self.changed.notify_waiters();
        event
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_ignore_poison(&self.events).is_empty()
    }

    /// Drop every queued event, returning how many were discarded.
    pub fn clear(&self) -> usize {
        // ---
        let discarded = {
            let mut events = lock_ignore_poison(&self.events);
            let n = events.len();
            events.clear();
            n
        };
        self.changed.notify_waiters();
        discarded
    }

    /// Wait until the queue is empty and `extra_condition` holds, or until
    /// `timeout` elapses.
    ///
    /// Returns the time left of `timeout`; zero means the wait gave up.
    pub async fn wait_for_empty<F>(&self, timeout: Duration, extra_condition: F) -> Duration
    where
        F: Fn() -> bool,
    {
        // ---
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() && extra_condition() {
                return deadline.saturating_duration_since(Instant::now());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Duration::ZERO;
            }

            let _ = time::timeout(remaining.min(RECHECK_INTERVAL), notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::correlation::TagGenerator;
    use crate::{CorrelationClass, PubSubError};

    #[test]
    fn test_fifo_peek_pop() {
        // ---
        let queue = AckQueue::new();
        let tags = TagGenerator::new();
        let first = tags.next(CorrelationClass::FireAndForget);
        let second = tags.next(CorrelationClass::FireAndForget);

        queue.push(AckEvent::new(first.clone(), Ok(())));
        queue.push(AckEvent::new(
            second.clone(),
            Err(PubSubError::Transport("nack".into())),
        ));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().map(|e| e.tag), Some(first.clone()));
        assert_eq!(queue.peek().map(|e| e.tag), Some(first.clone()));
        assert_eq!(queue.pop().map(|e| e.tag), Some(first));

        let head = queue.pop().unwrap();
        assert_eq!(head.tag, second);
        assert!(!head.is_success());
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_empty_times_out() {
        // ---
        let queue = AckQueue::new();
        let tag = TagGenerator::new().next(CorrelationClass::FireAndForget);
        queue.push(AckEvent::new(tag, Ok(())));

        let started = Instant::now();
        let left = queue.wait_for_empty(Duration::from_millis(30), || true).await;
        assert_eq!(left, Duration::ZERO);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.clear(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_empty_observes_extra_condition() {
        // ---
        let queue = Arc::new(AckQueue::new());
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let left = queue
            .wait_for_empty(Duration::from_secs(2), || done.load(Ordering::SeqCst))
            .await;
        assert!(left > Duration::ZERO);
    }
}
