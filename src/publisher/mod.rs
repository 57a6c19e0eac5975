// src/publisher/mod.rs
//! Send side: the persistent publisher and its acknowledgement machinery.
//!
//! # Architecture
//!
//! - `correlation_table` maps fire-and-forget tags to the message and user
//!   context a receipt is built from.
//! - `ack_queue` keeps acknowledgement events in arrival order until their
//!   receipt was delivered.
//! - `dispatcher` runs receipt delivery on one bounded, serialized worker.
//! - `send_buffer` decouples publishing callers from the transport.
//! - `persistent` ties these together behind [`PersistentPublisher`].

mod ack_queue;
mod builder;
mod correlation_table;
mod dispatcher;
mod persistent;
mod receipt;
mod send_buffer;

pub use builder::PublisherBuilder;
pub use persistent::{PersistentPublisher, PublisherState};
pub use receipt::{PublishReceipt, ReceiptListener, ReceiptListenerPtr, UserContext};
