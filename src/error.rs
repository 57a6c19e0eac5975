use std::sync::Arc;

use thiserror::Error;

/// Errors produced by publishers, receivers and transports.
///
/// The type is `Clone` because one failure may travel through several
/// hands: a transport reports it in an acknowledgement event, the dispatcher
/// copies it into a [`PublishReceipt`](crate::PublishReceipt), and the
/// terminating publisher logs it.
#[derive(Error, Debug, Clone)]
pub enum PubSubError {
    /// An argument supplied by the caller was rejected before any network
    /// interaction took place.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A suspending call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation is not allowed in the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The transport rejected or failed to deliver a specific message.
    #[error("delivery to '{destination}' failed: {reason}")]
    Delivery { destination: String, reason: String },

    /// Work was still outstanding when a grace period expired.
    ///
    /// `unpublished` counts messages never handed to the transport,
    /// `pending_receipts` counts messages handed over whose outcome was never
    /// reported. For receivers `unpublished` carries the number of buffered
    /// messages that never reached the application.
    #[error(
        "incomplete delivery: unpublished message count [{unpublished}], \
         unacknowledged publish receipt count [{pending_receipts}]"
    )]
    IncompleteDelivery {
        unpublished: usize,
        pending_receipts: usize,
    },

    /// The reject-mode send buffer has no free capacity.
    #[error("publisher overflow: {0}")]
    PublisherOverflow(String),

    /// One or more subscriptions could not be applied.
    #[error("subscription failed: {}", failures.join("; "))]
    Subscription { failures: Vec<String> },

    /// Generic transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization of a payload failed.
    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for PubSubError {
    fn from(err: serde_json::Error) -> Self {
        // ---
        PubSubError::Serialization(Arc::new(err))
    }
}

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
