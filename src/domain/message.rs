// src/domain/message.rs

//! Message and destination types exchanged with the transport layer.
//!
//! Payloads are opaque bytes. The JSON helpers are conveniences for
//! applications and tests; the transport never interprets payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{PubSubError, Result};

/// Prefix used for shared (load-balanced) subscriptions.
pub const SHARED_SUBSCRIPTION_PREFIX: &str = "#share/";

/// A publish destination.
///
/// Topics are hierarchical, `/`-separated and may not contain the wildcard
/// characters `*` or `>`, which are only meaningful in a [`Subscription`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(Arc<str>);

impl Topic {
    /// Validate and create a topic.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidArgument`] if the name is empty or
    /// contains wildcard characters.
    pub fn of(name: impl Into<Arc<str>>) -> Result<Self> {
        // ---
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PubSubError::InvalidArgument(
                "topic name must not be empty".into(),
            ));
        }
        if name.contains('*') || name.contains('>') {
            return Err(PubSubError::InvalidArgument(format!(
                "topic '{name}' must not contain wildcards"
            )));
        }
        Ok(Topic(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription expression.
///
/// Matching rules are defined by the transport. The in-memory transport
/// treats `*` as exactly one level and a trailing `>` as one or more levels.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription(Arc<str>);

impl Subscription {
    /// Validate and create a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidArgument`] if the expression is empty.
    pub fn of(expression: impl Into<Arc<str>>) -> Result<Self> {
        // ---
        let expression = expression.into();
        if expression.trim().is_empty() {
            return Err(PubSubError::InvalidArgument(
                "subscription must not be empty".into(),
            ));
        }
        Ok(Subscription(expression))
    }

    /// Wrap this subscription into a shared subscription for `group`.
    pub fn shared(&self, group: &str) -> Subscription {
        // ---
        Subscription(format!("{SHARED_SUBSCRIPTION_PREFIX}{group}/{}", self.0).into())
    }

    /// Strip a shared-subscription prefix, returning the topic expression.
    pub fn topic_expression(&self) -> &str {
        // ---
        match self.0.strip_prefix(SHARED_SUBSCRIPTION_PREFIX) {
            Some(rest) => rest.split_once('/').map(|(_, expr)| expr).unwrap_or(rest),
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery mode stamped on an outbound message by the publisher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Fire-and-forget, never acknowledged by the transport.
    #[default]
    Direct,
    /// Acknowledged by the transport once stored.
    Persistent,
}

/// A message prepared for publishing.
#[derive(Clone, Debug, Default)]
pub struct OutboundMessage {
    // ---
    pub payload: Bytes,
    pub properties: BTreeMap<String, String>,
    pub delivery_mode: DeliveryMode,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Serialize `value` as the JSON payload of a new message.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        // ---
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::new(bytes))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl From<&'static str> for OutboundMessage {
    fn from(value: &'static str) -> Self {
        OutboundMessage::new(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for OutboundMessage {
    fn from(value: String) -> Self {
        OutboundMessage::new(value)
    }
}

impl From<Vec<u8>> for OutboundMessage {
    fn from(value: Vec<u8>) -> Self {
        OutboundMessage::new(value)
    }
}

impl From<Bytes> for OutboundMessage {
    fn from(value: Bytes) -> Self {
        OutboundMessage::new(value)
    }
}

/// An outbound message bound to its destination: the unit the transport
/// sends.
#[derive(Clone, Debug)]
pub struct Publishable {
    pub message: OutboundMessage,
    pub destination: Topic,
}

impl Publishable {
    pub fn new(message: OutboundMessage, destination: Topic) -> Self {
        Self {
            message,
            destination,
        }
    }
}

/// A message delivered by the transport to a receiver.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    // ---
    pub destination: Topic,
    pub payload: Bytes,
    pub properties: BTreeMap<String, String>,
}

impl InboundMessage {
    pub fn new(destination: Topic, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            destination,
            payload: payload.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<&Publishable> for InboundMessage {
    fn from(publishable: &Publishable) -> Self {
        // ---
        Self {
            destination: publishable.destination.clone(),
            payload: publishable.message.payload.clone(),
            properties: publishable.message.properties.clone(),
        }
    }
}
