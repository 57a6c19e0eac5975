//! Direct message receiver.
//!
//! The transport pushes matching messages into the receiver's inbound buffer
//! from its callback context. Applications consume them either by pulling
//! with [`DirectReceiver::receive_message`] or by installing a
//! [`MessageHandler`] with [`DirectReceiver::receive_async`], which spawns one
//! dispatch worker invoking the handler serially, in arrival order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant};
use uuid::Uuid;

use super::buffer::InboundBuffer;
use super::registry::ReceiverRegistry;
use crate::lock::lock_ignore_poison;
use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::{
    // ---
    InboundHandler,
    InboundMessage,
    PubSubError,
    ReceiverConfig,
    Result,
    Subscription,
    TransportPtr,
};

/// Lifecycle of a [`DirectReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    // ---
    NotStarted,
    Starting,
    Started,
    Terminating,
    Terminated,
}

/// Application callback for [`DirectReceiver::receive_async`].
///
/// Errors and panics are logged; the next message is still delivered.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: InboundMessage) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) -> Result<()> + Send + Sync,
{
    fn on_message(&self, message: InboundMessage) -> Result<()> {
        self(message)
    }
}

pub type MessageHandlerPtr = Arc<dyn MessageHandler>;

/// Receiver of direct (unacknowledged) messages.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct DirectReceiver {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    receiver_id: String,
    transport: TransportPtr,
    config: ReceiverConfig,
    registry: Arc<ReceiverRegistry>,

    state: Mutex<ReceiverState>,

    // subscriptions as applied on the transport (group prefix included)
    applied: Mutex<Vec<Subscription>>,

    buffer: Arc<InboundBuffer>,
    handler: RwLock<Option<MessageHandlerPtr>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    me: Weak<Inner>,
}

/// Transport-facing inbound callback.
struct Inbound(Weak<Inner>);

impl InboundHandler for Inbound {
    fn on_message(&self, message: InboundMessage) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_inbound(message);
        }
    }
}

impl DirectReceiver {
    pub(crate) fn new(
        transport: TransportPtr,
        config: ReceiverConfig,
        registry: Arc<ReceiverRegistry>,
        service_id: &str,
    ) -> Self {
        // ---
        let receiver_id = format!("{service_id}/receiver-{}", Uuid::new_v4().simple());

        let inner = Arc::new_cyclic(|me| Inner {
            receiver_id,
            transport,
            config,
            registry,
            state: Mutex::new(ReceiverState::NotStarted),
            applied: Mutex::new(Vec::new()),
            buffer: Arc::new(InboundBuffer::new()),
            handler: RwLock::new(None),
            worker: Mutex::new(None),
            me: me.clone(),
        });

        Self { inner }
    }

    /// Identity used as the consumer id on the transport.
    pub fn receiver_id(&self) -> &str {
        &self.inner.receiver_id
    }

    pub fn state(&self) -> ReceiverState {
        *lock_ignore_poison(&self.inner.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ReceiverState::Started
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ReceiverState::Terminated
    }

    /// Number of buffered messages not yet consumed.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Apply every configured subscription.
    ///
    /// Idempotent while started.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::Subscription`] listing every subscription that failed.
    ///   Subscriptions that did succeed are removed again and the receiver
    ///   returns to [`ReceiverState::NotStarted`].
    /// - [`PubSubError::IllegalState`] if the receiver is starting,
    ///   terminating or terminated.
    pub async fn start(&self) -> Result<()> {
        // ---
        let inner = &self.inner;

        {
            let mut state = lock_ignore_poison(&inner.state);
            match *state {
                ReceiverState::Started => return Ok(()),
                ReceiverState::NotStarted => *state = ReceiverState::Starting,
                other => {
                    return Err(PubSubError::IllegalState(format!(
                        "{}: cannot start a receiver that is {other:?}",
                        inner.receiver_id
                    )));
                }
            }
        }

        let callback: Arc<Inbound> = Arc::new(Inbound(inner.me.clone()));
        let mut applied = Vec::new();
        let mut failures = Vec::new();

        for subscription in &inner.config.subscriptions {
            let effective = inner.config.effective(subscription);
            match inner
                .transport
                .subscribe(&effective, &inner.receiver_id, callback.clone())
                .await
            {
                Ok(()) => applied.push(effective),
                Err(err) => failures.push(format!("{effective}: {err}")),
            }
        }

        if !failures.is_empty() {
            for effective in &applied {
                if let Err(_err) = inner
                    .transport
                    .unsubscribe(effective, &inner.receiver_id)
                    .await
                {
                    log_warn!("{}: rollback of {effective} failed: {_err}", inner.receiver_id);
                }
            }
            inner.buffer.clear();
            *lock_ignore_poison(&inner.state) = ReceiverState::NotStarted;

            let err = PubSubError::Subscription { failures };
            log_warn!("{}: start failed: {err}", inner.receiver_id);
            return Err(err);
        }

        *lock_ignore_poison(&inner.applied) = applied;
        inner.registry.register(&inner.receiver_id, &inner.buffer);
        *lock_ignore_poison(&inner.state) = ReceiverState::Started;

        log_info!("{}: started", inner.receiver_id);
        Ok(())
    }

    /// Subscribe to one more topic expression.
    ///
    /// # Errors
    ///
    /// [`PubSubError::IllegalState`] unless started, or the transport's
    /// subscribe error.
    pub async fn add_subscription(&self, subscription: &Subscription) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.require_started("add a subscription")?;

        let effective = inner.config.effective(subscription);
        let callback: Arc<Inbound> = Arc::new(Inbound(inner.me.clone()));
        inner
            .transport
            .subscribe(&effective, &inner.receiver_id, callback)
            .await?;

        let mut applied = lock_ignore_poison(&inner.applied);
        if !applied.contains(&effective) {
            applied.push(effective);
        }
        Ok(())
    }

    /// Remove a subscription added at start or with
    /// [`add_subscription`](Self::add_subscription).
    ///
    /// # Errors
    ///
    /// [`PubSubError::IllegalState`] unless started, or the transport's
    /// unsubscribe error.
    pub async fn remove_subscription(&self, subscription: &Subscription) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.require_started("remove a subscription")?;

        let effective = inner.config.effective(subscription);
        inner
            .transport
            .unsubscribe(&effective, &inner.receiver_id)
            .await?;

        lock_ignore_poison(&inner.applied).retain(|s| s != &effective);
        Ok(())
    }

    /// Install (or replace) the message handler and start the dispatch worker.
    ///
    /// # Errors
    ///
    /// [`PubSubError::IllegalState`] unless started.
    pub fn receive_async<H>(&self, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        // ---
        let inner = &self.inner;
        inner.require_started("receive asynchronously")?;

        let handler: MessageHandlerPtr = Arc::new(handler);
        match inner.handler.write() {
            Ok(mut guard) => *guard = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }

        let mut worker = lock_ignore_poison(&inner.worker);
        if worker.is_none() {
            log_debug!("{}: starting dispatch worker", inner.receiver_id);
            *worker = Some(tokio::spawn(run_dispatch_worker(
                inner.me.clone(),
                inner.buffer.clone(),
            )));
        }
        Ok(())
    }

    /// Pull the next message, waiting up to `timeout` (indefinitely for
    /// `None`).
    ///
    /// Returns `Ok(None)` on timeout, when the receiver was terminated, or
    /// when the messaging service went down and nothing is left to deliver.
    ///
    /// # Errors
    ///
    /// [`PubSubError::IllegalState`] if the receiver was never started.
    pub async fn receive_message(&self, timeout: Option<Duration>) -> Result<Option<InboundMessage>> {
        // ---
        let inner = &self.inner;
        let state = *lock_ignore_poison(&inner.state);
        match state {
            ReceiverState::NotStarted | ReceiverState::Starting => {
                return Err(PubSubError::IllegalState(format!(
                    "{}: cannot receive before the receiver is started",
                    inner.receiver_id
                )));
            }
            ReceiverState::Started | ReceiverState::Terminating | ReceiverState::Terminated => {}
        }

        Ok(inner.buffer.recv(timeout).await)
    }

    /// Terminate with the configured grace period.
    pub async fn terminate_default(&self) -> Result<()> {
        self.terminate(self.inner.config.grace_period).await
    }

    /// Unsubscribe everything, then give consumers up to `grace_period` to
    /// drain the buffer.
    ///
    /// Blocked [`receive_message`](Self::receive_message) calls are released
    /// with `None`. A handler call still in progress when the grace period
    /// ends is not waited for. Idempotent once terminated.
    ///
    /// # Errors
    ///
    /// [`PubSubError::IncompleteDelivery`] if messages were still buffered
    /// after the grace period (reported as `unpublished`). They are dropped.
    pub async fn terminate(&self, grace_period: Duration) -> Result<()> {
        // ---
        let inner = &self.inner;
        let deadline = Instant::now() + grace_period;

        {
            let mut state = lock_ignore_poison(&inner.state);
            match *state {
                ReceiverState::Terminating | ReceiverState::Terminated => return Ok(()),
                ReceiverState::NotStarted => {
                    *state = ReceiverState::Terminated;
                    inner.buffer.close();
                    return Ok(());
                }
                ReceiverState::Starting => {
                    return Err(PubSubError::IllegalState(format!(
                        "{}: cannot terminate while starting",
                        inner.receiver_id
                    )));
                }
                ReceiverState::Started => *state = ReceiverState::Terminating,
            }
        }

        log_info!(
            "{}: terminating, grace period {grace_period:?}",
            inner.receiver_id
        );

        // no new messages past this point
        let applied: Vec<Subscription> = lock_ignore_poison(&inner.applied).drain(..).collect();
        if inner.transport.is_connected() {
            for subscription in &applied {
                if let Err(_err) = inner
                    .transport
                    .unsubscribe(subscription, &inner.receiver_id)
                    .await
                {
                    log_warn!(
                        "{}: unsubscribe {subscription} failed: {_err}",
                        inner.receiver_id
                    );
                }
            }
        }

        if !inner.buffer.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            inner.buffer.wait_for_drained(remaining).await;
        }

        let undelivered = inner.buffer.clear();
        inner.buffer.close();

        // a handler still running past the grace period is left to finish
        // on its own; the worker stops picking up messages either way
        let worker = lock_ignore_poison(&inner.worker).take();
        if let Some(mut worker) = worker {
            match time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(_err)) => {
                    log_error!("{}: dispatch worker failed: {_err}", inner.receiver_id)
                }
                Err(_) => {
                    log_warn!(
                        "{}: message handler still running after grace period",
                        inner.receiver_id
                    );
                    worker.abort();
                }
            }
        }

        inner.registry.unregister(&inner.receiver_id);
        *lock_ignore_poison(&inner.state) = ReceiverState::Terminated;

        if undelivered == 0 {
            log_info!("{}: terminated", inner.receiver_id);
            return Ok(());
        }

        let err = PubSubError::IncompleteDelivery {
            unpublished: undelivered,
            pending_receipts: 0,
        };
        log_warn!("{}: {err}", inner.receiver_id);
        Err(err)
    }
}

impl Inner {
    fn require_started(&self, action: &str) -> Result<()> {
        // ---
        let state = *lock_ignore_poison(&self.state);
        if state == ReceiverState::Started {
            return Ok(());
        }
        Err(PubSubError::IllegalState(format!(
            "{}: cannot {action} while {state:?}",
            self.receiver_id
        )))
    }

    fn on_inbound(&self, message: InboundMessage) {
        // ---
        let state = *lock_ignore_poison(&self.state);
        match state {
            ReceiverState::Starting | ReceiverState::Started => {
                if !self.buffer.push(message) {
                    log_debug!("{}: buffer closed, inbound message dropped", self.receiver_id);
                }
            }
            _ => log_debug!(
                "{}: inbound message on {} dropped while {state:?}",
                self.receiver_id,
                message.destination
            ),
        }
    }

    fn handler(&self) -> Option<MessageHandlerPtr> {
        match self.handler.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        // ---
        let Some(handler) = self.handler() else {
            log_warn!("{}: no message handler, message dropped", self.receiver_id);
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(message))) {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => log_warn!("{}: message handler failed: {_err}", self.receiver_id),
            Err(_) => log_error!("{}: message handler panicked", self.receiver_id),
        }
    }
}

/// Dispatch worker: delivers buffered messages to the handler until the
/// buffer is closed and empty.
async fn run_dispatch_worker(me: Weak<Inner>, buffer: Arc<InboundBuffer>) {
    // ---
    while let Some(message) = buffer.recv(None).await {
        let Some(inner) = me.upgrade() else {
            break;
        };
        // handlers may block: run each on the blocking pool, one at a time
        if let Err(_err) = task::spawn_blocking(move || inner.dispatch(message)).await {
            log_error!("dispatch job aborted: {_err}");
        }
    }
    log_debug!("dispatch worker stopped");
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        self.buffer.close();
        self.registry.unregister(&self.receiver_id);
    }
}
