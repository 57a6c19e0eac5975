//! Direct receiver builder.

use std::sync::Arc;
use std::time::Duration;

use super::registry::ReceiverRegistry;
use crate::{DirectReceiver, ReceiverConfig, Subscription, TransportPtr};

/// Builder for [`DirectReceiver`] instances.
///
/// Obtained from [`MessagingService::receiver_builder`](crate::MessagingService::receiver_builder).
///
/// # Example
///
/// ```no_run
/// use mom_pubsub::{MessagingService, ServiceConfig, Subscription, TransportConfig};
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = mom_pubsub::create_memory_transport(&TransportConfig::memory("node-1"))?;
/// let service = MessagingService::new(ServiceConfig::new("billing"), transport);
///
/// let receiver = service
///     .receiver_builder()
///     .subscription(Subscription::of("orders/>")?)
///     .group_name("billing-workers")
///     .build();
/// receiver.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct ReceiverBuilder {
    // ---
    transport: TransportPtr,
    registry: Arc<ReceiverRegistry>,
    service_id: String,

    config: ReceiverConfig,
}

impl ReceiverBuilder {
    pub(crate) fn new(
        transport: TransportPtr,
        registry: Arc<ReceiverRegistry>,
        service_id: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            transport,
            registry,
            service_id: service_id.into(),
            config: ReceiverConfig::default(),
        }
    }

    /// Add one subscription applied on `start()`.
    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.config = self.config.with_subscription(subscription);
        self
    }

    pub fn with_subscriptions<I>(mut self, subscriptions: I) -> Self
    where
        I: IntoIterator<Item = Subscription>,
    {
        self.config.subscriptions.extend(subscriptions);
        self
    }

    /// Share every subscription with the other members of `group_name`:
    /// each message is delivered to one member only.
    pub fn group_name(mut self, group_name: impl Into<String>) -> Self {
        self.config = self.config.with_group_name(group_name);
        self
    }

    /// Set the grace period used by `terminate_default()`.
    ///
    /// Default: 10s.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config = self.config.with_grace_period(grace_period);
        self
    }

    /// Build the receiver (consumes self). The receiver still has to be
    /// started.
    pub fn build(self) -> DirectReceiver {
        DirectReceiver::new(self.transport, self.config, self.registry, &self.service_id)
    }
}
