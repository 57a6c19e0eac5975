// src/receiver/mod.rs
//! Receive side: direct receivers.
//!
//! - `buffer` holds inbound messages between the transport callback and the
//!   application.
//! - `registry` tracks the receivers of one messaging service so they can be
//!   released when the service goes down.
//! - `direct` implements [`DirectReceiver`].

mod buffer;
mod builder;
mod direct;
mod registry;

pub(crate) use registry::ReceiverRegistry;

pub use builder::ReceiverBuilder;
pub use direct::{DirectReceiver, MessageHandler, MessageHandlerPtr, ReceiverState};
