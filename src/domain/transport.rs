// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the boundary between the messaging engine (publishers
//! and receivers) and the layer that actually moves bytes. It intentionally
//! avoids any reference to concrete protocols, brokers, or client libraries.
//!
//! The transport talks back to the engine through three callback hooks:
//!
//! - [`AckHandler`] receives the outcome of every correlated send,
//! - [`InboundHandler`] receives messages matching a subscription,
//! - [`ConnectivityHandler`] learns that the transport went down.
//!
//! Callbacks run on the transport's own execution context. Implementations of
//! these traits must return quickly and must never block or panic: the engine
//! only pushes into an internal queue and wakes a worker.
//!
//! Concrete implementations of [`Transport`] live under `src/transport/`.

use std::sync::Arc;

use crate::{CorrelationTag, InboundMessage, PubSubError, Publishable, Result, Subscription};

/// Outcome of one correlated send as reported by the transport.
pub type AckOutcome = std::result::Result<(), PubSubError>;

/// One acknowledgement event: a tag and its delivery outcome.
#[derive(Debug, Clone)]
pub struct AckEvent {
    // ---
    pub tag: CorrelationTag,
    pub outcome: AckOutcome,
}

impl AckEvent {
    pub fn new(tag: CorrelationTag, outcome: AckOutcome) -> Self {
        Self { tag, outcome }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&PubSubError> {
        self.outcome.as_ref().err()
    }
}

/// Acknowledgement callback hook.
pub trait AckHandler: Send + Sync {
    /// Called exactly once for every tag the transport accepted.
    fn on_ack(&self, tag: CorrelationTag, outcome: AckOutcome);
}

/// Inbound message callback hook.
pub trait InboundHandler: Send + Sync {
    /// Called for every message matching a subscription of this handler.
    fn on_message(&self, message: InboundMessage);
}

/// Connectivity callback hook.
pub trait ConnectivityHandler: Send + Sync {
    /// Called once when the transport loses connectivity.
    fn on_transport_down(&self);
}

pub type AckHandlerPtr = Arc<dyn AckHandler>;
pub type InboundHandlerPtr = Arc<dyn InboundHandler>;
pub type ConnectivityHandlerPtr = Arc<dyn ConnectivityHandler>;

/// Transport abstraction.
///
/// Implementations must ensure that:
/// - `send()` returns once the message is accepted, not when it is delivered.
/// - For every correlation tag passed to a successful `send()`, the ack
///   handler registered for the tag's publisher is invoked exactly once,
///   including when connectivity is lost before the broker answered.
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point and matching the subscription are delivered to the handler.
/// - After `unsubscribe()` returns, the handler receives nothing more for
///   that subscription.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used for logging.
    fn transport_id(&self) -> &str;

    /// Connectivity-state query.
    fn is_connected(&self) -> bool;

    /// Hand one message to the transport.
    ///
    /// `tag` is `None` for sends that need no acknowledgement.
    async fn send(&self, publishable: &Publishable, tag: Option<&CorrelationTag>) -> Result<()>;

    /// Route acknowledgements for tags of `publisher_id` to `handler`.
    fn register_ack_handler(&self, publisher_id: &str, handler: AckHandlerPtr);

    fn unregister_ack_handler(&self, publisher_id: &str);

    /// Apply a subscription for `consumer_id`, blocking until confirmed.
    async fn subscribe(
        &self,
        sub: &Subscription,
        consumer_id: &str,
        handler: InboundHandlerPtr,
    ) -> Result<()>;

    /// Remove a subscription of `consumer_id`, blocking until confirmed.
    async fn unsubscribe(&self, sub: &Subscription, consumer_id: &str) -> Result<()>;

    fn register_connectivity_handler(&self, id: &str, handler: ConnectivityHandlerPtr);

    fn unregister_connectivity_handler(&self, id: &str);

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
pub type TransportPtr = Arc<dyn Transport>;
