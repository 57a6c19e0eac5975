//! Messaging service façade.
//!
//! A [`MessagingService`] owns one connected transport and hands out
//! publisher and receiver builders bound to it. It also watches the
//! transport's connectivity: when the transport goes down every receiver
//! created through this service is released.

use std::sync::{Arc, Weak};

use crate::macros::{log_info, log_warn};
use crate::receiver::ReceiverRegistry;
use crate::{
    // ---
    ConnectivityHandler,
    PublisherBuilder,
    ReceiverBuilder,
    Result,
    ServiceConfig,
    TransportPtr,
};

/// Entry point for creating publishers and receivers on a transport.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    config: ServiceConfig,
    transport: TransportPtr,
    registry: Arc<ReceiverRegistry>,
}

/// Connectivity hook fanning transport-down out to registered receivers.
struct ServiceDown {
    service_id: String,
    registry: Weak<ReceiverRegistry>,
}

impl ConnectivityHandler for ServiceDown {
    fn on_transport_down(&self) {
        // ---
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let _woken = registry.wake_all();
        log_warn!(
            "{}: transport down, released {_woken} receiver(s)",
            self.service_id
        );
    }
}

impl MessagingService {
    /// Wrap a transport. The transport is expected to be connected already.
    pub fn new(config: ServiceConfig, transport: TransportPtr) -> Self {
        // ---
        let registry = Arc::new(ReceiverRegistry::new());

        transport.register_connectivity_handler(
            &config.service_id,
            Arc::new(ServiceDown {
                service_id: config.service_id.clone(),
                registry: Arc::downgrade(&registry),
            }),
        );

        log_info!(
            "{}: messaging service on transport {}",
            config.service_id,
            transport.transport_id()
        );

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry,
            }),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.inner.config.service_id
    }

    pub fn transport(&self) -> TransportPtr {
        self.inner.transport.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn publisher_builder(&self) -> PublisherBuilder {
        PublisherBuilder::new(self.inner.transport.clone(), self.service_id())
    }

    pub fn receiver_builder(&self) -> ReceiverBuilder {
        // ---
        ReceiverBuilder::new(
            self.inner.transport.clone(),
            self.inner.registry.clone(),
            self.service_id(),
        )
    }

    /// Close the transport.
    ///
    /// Publishers and receivers observe the loss of connectivity through the
    /// transport's down notification.
    pub async fn disconnect(&self) -> Result<()> {
        // ---
        log_info!("{}: disconnecting", self.service_id());
        self.inner.transport.close().await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport
            .unregister_connectivity_handler(&self.config.service_id);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use super::*;
    use crate::{MemoryTransport, Subscription, TransportConfig};

    #[tokio::test]
    async fn test_transport_down_releases_blocked_receivers() {
        // ---
        let transport = MemoryTransport::new(&TransportConfig::memory("t"));
        let service = MessagingService::new(ServiceConfig::new("svc"), transport.clone());

        let receiver = service
            .receiver_builder()
            .subscription(Subscription::of("a/>").unwrap())
            .build();
        receiver.start().await.unwrap();

        let blocked = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.receive_message(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.set_connected(false);
        let released = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(released.unwrap().is_none());
        assert!(!service.is_connected());

        receiver.terminate(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_closes_transport() {
        // ---
        let transport = MemoryTransport::new(&TransportConfig::memory("t"));
        let service = MessagingService::new(ServiceConfig::new("svc"), transport);
        assert!(service.is_connected());

        service.disconnect().await.unwrap();
        assert!(!service.is_connected());
    }
}
