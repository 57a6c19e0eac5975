//! Persistent publisher builder.

use std::time::Duration;

use crate::{BackPressure, PersistentPublisher, PublisherConfig, Result, TransportPtr};

/// Builder for [`PersistentPublisher`] instances.
///
/// Obtained from [`MessagingService::publisher_builder`](crate::MessagingService::publisher_builder).
///
/// # Example
///
/// ```no_run
/// use mom_pubsub::{MessagingService, ServiceConfig, TransportConfig};
/// use std::time::Duration;
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let transport = mom_pubsub::create_memory_transport(&TransportConfig::memory("node-1"))?;
/// let service = MessagingService::new(ServiceConfig::new("orders"), transport);
///
/// let publisher = service
///     .publisher_builder()
///     .on_back_pressure_reject(1024)
///     .grace_period(Duration::from_secs(5))
///     .build()?;
/// publisher.start()?;
/// # Ok(())
/// # }
/// ```
pub struct PublisherBuilder {
    // ---
    transport: TransportPtr,
    service_id: String,

    back_pressure: Option<BackPressure>,
    grace_period: Option<Duration>,
}

impl PublisherBuilder {
    pub(crate) fn new(transport: TransportPtr, service_id: impl Into<String>) -> Self {
        // ---
        Self {
            transport,
            service_id: service_id.into(),
            back_pressure: None,
            grace_period: None,
        }
    }

    /// Buffer without limit.
    ///
    /// This is the default.
    pub fn on_back_pressure_elastic(mut self) -> Self {
        self.back_pressure = Some(BackPressure::Elastic);
        self
    }

    /// Buffer at most `capacity` messages; publishing into a full buffer
    /// fails with [`PubSubError::PublisherOverflow`](crate::PubSubError::PublisherOverflow).
    pub fn on_back_pressure_reject(mut self, capacity: usize) -> Self {
        self.back_pressure = Some(BackPressure::Reject { capacity });
        self
    }

    /// Do not buffer: each publish call sends on the caller's task.
    pub fn unbuffered(mut self) -> Self {
        self.back_pressure = Some(BackPressure::Direct);
        self
    }

    /// Set the grace period used by `terminate_default()`.
    ///
    /// Default: 10s.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    /// Build the publisher (consumes self). The publisher still has to be
    /// started.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidArgument`](crate::PubSubError::InvalidArgument)
    /// for a reject buffer of zero capacity.
    pub fn build(self) -> Result<PersistentPublisher> {
        // ---
        let mut config = PublisherConfig::default();
        if let Some(back_pressure) = self.back_pressure {
            config = config.with_back_pressure(back_pressure);
        }
        if let Some(grace_period) = self.grace_period {
            config = config.with_grace_period(grace_period);
        }
        config.validate()?;

        Ok(PersistentPublisher::new(
            self.transport,
            config,
            &self.service_id,
        ))
    }
}
