use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::{DeliveryMode, OutboundMessage, PubSubError, Result};

/// Caller-supplied value handed back with the receipt of a publish.
pub type UserContext = Arc<dyn Any + Send + Sync>;

/// Final, user-visible outcome of one persistent publish.
#[derive(Clone)]
pub struct PublishReceipt {
    // ---
    pub message: OutboundMessage,
    pub error: Option<PubSubError>,
    pub timestamp: SystemTime,
    pub persisted: bool,
    pub user_context: Option<UserContext>,
}

impl PublishReceipt {
    pub(crate) fn new(
        message: OutboundMessage,
        error: Option<PubSubError>,
        user_context: Option<UserContext>,
    ) -> Self {
        // ---
        let persisted = message.delivery_mode != DeliveryMode::Direct;
        Self {
            message,
            error,
            timestamp: SystemTime::now(),
            persisted,
            user_context,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Borrow the user context as a concrete type.
    pub fn user_context_as<T: Any>(&self) -> Option<&T> {
        self.user_context.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for PublishReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishReceipt")
            .field("message", &self.message)
            .field("error", &self.error)
            .field("timestamp", &self.timestamp)
            .field("persisted", &self.persisted)
            .field("user_context", &self.user_context.is_some())
            .finish()
    }
}

/// Receives one [`PublishReceipt`] per publish issued while it was set.
///
/// Receipts of one publisher arrive in acknowledgement order, one at a time,
/// on the publisher's delivery dispatcher. An error or panic is logged and
/// does not affect later receipts.
pub trait ReceiptListener: Send + Sync {
    fn on_publish_receipt(&self, receipt: PublishReceipt) -> Result<()>;
}

impl<F> ReceiptListener for F
where
    F: Fn(PublishReceipt) -> Result<()> + Send + Sync,
{
    fn on_publish_receipt(&self, receipt: PublishReceipt) -> Result<()> {
        self(receipt)
    }
}

pub type ReceiptListenerPtr = Arc<dyn ReceiptListener>;
