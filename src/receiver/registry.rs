use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::buffer::InboundBuffer;
use crate::macros::log_debug;

/// Receivers of one messaging service that must be woken when the service
/// goes down.
///
/// Entries are weak: a dropped receiver simply disappears from the
/// registry's point of view.
#[derive(Default)]
pub(crate) struct ReceiverRegistry {
    receivers: DashMap<String, Weak<InboundBuffer>>,
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, receiver_id: &str, buffer: &Arc<InboundBuffer>) {
        self.receivers
            .insert(receiver_id.to_string(), Arc::downgrade(buffer));
    }

    pub fn unregister(&self, receiver_id: &str) {
        self.receivers.remove(receiver_id);
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    /// Close the buffer of every live receiver: dispatch workers exit once
    /// their backlog is delivered and blocked `receive_message` calls return.
    pub fn wake_all(&self) -> usize {
        // ---
        let buffers: Vec<Arc<InboundBuffer>> = self
            .receivers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.receivers.retain(|_, buffer| buffer.strong_count() > 0);

        log_debug!("waking {} receiver(s)", buffers.len());
        for buffer in &buffers {
            buffer.close();
        }
        buffers.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_wake_all_skips_dropped_receivers() {
        // ---
        let registry = ReceiverRegistry::new();
        let live = Arc::new(InboundBuffer::new());
        let dropped = Arc::new(InboundBuffer::new());

        registry.register("r1", &live);
        registry.register("r2", &dropped);
        drop(dropped);

        assert_eq!(registry.wake_all(), 1);
        assert!(live.is_closed());
        assert_eq!(registry.len(), 1);

        registry.unregister("r1");
        assert_eq!(registry.len(), 0);
    }
}
