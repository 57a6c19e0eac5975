//! Pub/sub messaging client core over a pluggable transport.
//!
//! This library provides the engine of a message-oriented-middleware client:
//! a persistent publisher with acknowledged delivery (asynchronous receipts
//! or a blocking wait per message), and a direct receiver dispatching inbound
//! messages to a pull API or a handler callback. It handles correlation tag
//! generation, acknowledgement ordering, bounded receipt dispatch, and
//! graceful termination.
//!
//! The wire protocol lives behind the [`Transport`] trait. An in-memory
//! transport is included for tests and single-process use.

// Import all sub modules once...
mod domain;
mod publisher;
mod receiver;
mod transport;

mod config;
mod correlation;
mod error;
mod lock;
mod macros;
mod service;

pub use config::{
    //
    AckMode,
    BackPressure,
    PublisherConfig,
    ReceiverConfig,
    ServiceConfig,
    TransportConfig,
    DEFAULT_GRACE_PERIOD,
    DISPATCH_UPPER_BOUND,
};

pub use correlation::{CorrelationClass, CorrelationTag};
pub use error::{PubSubError, Result};

pub use publisher::{
    //
    PersistentPublisher,
    PublishReceipt,
    PublisherBuilder,
    PublisherState,
    ReceiptListener,
    ReceiptListenerPtr,
    UserContext,
};

pub use receiver::{
    //
    DirectReceiver,
    MessageHandler,
    MessageHandlerPtr,
    ReceiverBuilder,
    ReceiverState,
};

pub use service::MessagingService;

pub use transport::{create_memory_transport, MemoryTransport};

// --- public re-exports
pub use domain::{
    //
    AckEvent,
    AckHandler,
    AckHandlerPtr,
    AckOutcome,
    ConnectivityHandler,
    ConnectivityHandlerPtr,
    DeliveryMode,
    InboundHandler,
    InboundHandlerPtr,
    InboundMessage,
    OutboundMessage,
    Publishable,
    Subscription,
    Topic,
    Transport,
    TransportPtr,
    SHARED_SUBSCRIPTION_PREFIX,
};
