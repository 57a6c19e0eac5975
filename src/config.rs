//! Public, transport-agnostic messaging configuration.
//!
//! These types intentionally contain no broker-specific concepts. Transport
//! layers are responsible for interpreting their own settings.

use std::time::Duration;

use crate::{PubSubError, Result, Subscription};

/// Default time allowed for in-flight work to complete on terminate.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Maximum number of outstanding submissions to a delivery dispatcher.
pub const DISPATCH_UPPER_BOUND: usize = 3;

/// How a publisher buffers messages that are not yet handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackPressure {
    /// Unbounded send buffer drained by a background send worker.
    #[default]
    Elastic,

    /// Bounded send buffer; publishing into a full buffer fails with
    /// [`PubSubError::PublisherOverflow`].
    Reject { capacity: usize },

    /// No buffer: the publishing call hands the message to the transport
    /// itself and sees send failures synchronously.
    Direct,
}

/// Persistent publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    // ---
    /// Send buffering strategy.
    ///
    /// Default: [`BackPressure::Elastic`]
    pub back_pressure: BackPressure,

    /// Grace period used by `terminate_default()`.
    ///
    /// Default: 10 seconds
    pub grace_period: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        // ---
        Self {
            back_pressure: BackPressure::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl PublisherConfig {
    pub fn with_back_pressure(mut self, back_pressure: BackPressure) -> Self {
        self.back_pressure = back_pressure;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Check the configuration for values no publisher can work with.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidArgument`] for a reject buffer with zero
    /// capacity.
    pub fn validate(&self) -> Result<()> {
        // ---
        if let BackPressure::Reject { capacity: 0 } = self.back_pressure {
            return Err(PubSubError::InvalidArgument(
                "reject back-pressure buffer capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Direct receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    // ---
    /// Subscriptions applied by `start()`.
    pub subscriptions: Vec<Subscription>,

    /// Optional shared-subscription group.
    ///
    /// When set, every subscription is applied as
    /// `#share/{group_name}/{subscription}`.
    pub group_name: Option<String>,

    /// Grace period used by `terminate_default()`.
    ///
    /// Default: 10 seconds
    pub grace_period: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        // ---
        Self {
            subscriptions: Vec::new(),
            group_name: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl ReceiverConfig {
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The subscription as it must be applied on the transport.
    pub(crate) fn effective(&self, subscription: &Subscription) -> Subscription {
        // ---
        match self.group_name.as_deref() {
            Some(group) if !group.is_empty() => subscription.shared(group),
            _ => subscription.clone(),
        }
    }
}

/// Messaging service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Identifier used in logs and as the prefix of receiver ids.
    pub service_id: String,
}

impl ServiceConfig {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }
}

/// How the in-memory transport acknowledges correlated sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Acknowledge every correlated send as soon as it is routed.
    #[default]
    Auto,

    /// Keep correlated sends pending until the driver calls `ack()`.
    Manual,
}

/// Configuration for the in-memory transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    // ---
    pub transport_id: String,
    pub ack_mode: AckMode,
}

impl TransportConfig {
    pub fn memory(transport_id: impl Into<String>) -> Self {
        // ---
        Self {
            transport_id: transport_id.into(),
            ack_mode: AckMode::Auto,
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_zero_capacity_reject_is_invalid() {
        // ---
        let cfg = PublisherConfig::default().with_back_pressure(BackPressure::Reject { capacity: 0 });
        assert!(matches!(cfg.validate(), Err(PubSubError::InvalidArgument(_))));

        let cfg = PublisherConfig::default().with_back_pressure(BackPressure::Reject { capacity: 4 });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_group_name_produces_shared_subscription() {
        // ---
        let sub = Subscription::of("sensors/>").unwrap();
        let plain = ReceiverConfig::default();
        assert_eq!(plain.effective(&sub).as_str(), "sensors/>");

        let grouped = ReceiverConfig::default().with_group_name("g1");
        assert_eq!(grouped.effective(&sub).as_str(), "#share/g1/sensors/>");

        let empty = ReceiverConfig::default().with_group_name("");
        assert_eq!(empty.effective(&sub).as_str(), "sensors/>");
    }
}
