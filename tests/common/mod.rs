// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use mom_pubsub::{AckMode, MemoryTransport, MessagingService, ServiceConfig, TransportConfig};

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}

/// A messaging service on a fresh in-memory transport.
pub fn service(id: &str, ack_mode: AckMode) -> (Arc<MemoryTransport>, MessagingService) {
    // ---
    init_logging();

    let transport = MemoryTransport::new(&TransportConfig::memory(id).with_ack_mode(ack_mode));
    let service = MessagingService::new(ServiceConfig::new(id), transport.clone());
    (transport, service)
}

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
