//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod message;
mod transport;

// --- Message domain re-exports ---

pub use message::{
    //
    DeliveryMode,
    InboundMessage,
    OutboundMessage,
    Publishable,
    Subscription,
    Topic,
    SHARED_SUBSCRIPTION_PREFIX,
};

// --- Transport domain re-exports ---

pub use transport::{
    //
    AckEvent,
    AckHandler,
    AckHandlerPtr,
    AckOutcome,
    ConnectivityHandler,
    ConnectivityHandlerPtr,
    InboundHandler,
    InboundHandlerPtr,
    Transport,
    TransportPtr,
};
