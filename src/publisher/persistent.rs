//! Persistent message publisher.
//!
//! # Architecture
//!
//! ```text
//!  publish() ──► send buffer ──► send worker ──► Transport::send
//!                                                     │
//!   receipt listener ◄── dispatcher ◄── ack queue ◄───┤ (fire-and-forget tags)
//!   awaiting caller  ◄──────────── wait slot   ◄──────┘ (await tags)
//! ```
//!
//! Fire-and-forget publishes are only correlated while a receipt listener is
//! set. Their acknowledgements go through the ack queue and are turned into
//! receipts on the delivery dispatcher, strictly in arrival order. Awaiting
//! publishes park a single-shot wait slot keyed by their tag before the
//! message is handed to the transport, so the acknowledgement can never
//! arrive before someone is listening for it.
//!
//! Transport callbacks only push into queues, complete wait slots and submit
//! dispatcher jobs; they never block.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use super::ack_queue::AckQueue;
use super::correlation_table::{CorrelationTable, Lookup};
use super::dispatcher::DeliveryDispatcher;
use super::receipt::{PublishReceipt, ReceiptListener, ReceiptListenerPtr, UserContext};
use super::send_buffer::{BufferedSend, SendBuffer};
use crate::lock::lock_ignore_poison;
use crate::correlation::TagGenerator;
use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::{
    // ---
    AckEvent,
    AckHandler,
    AckOutcome,
    BackPressure,
    ConnectivityHandler,
    CorrelationClass,
    CorrelationTag,
    DeliveryMode,
    OutboundMessage,
    PubSubError,
    Publishable,
    PublisherConfig,
    Result,
    Topic,
    TransportPtr,
};

/// Lifecycle of a [`PersistentPublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    // ---
    NotStarted,
    Started,
    Terminating,
    Terminated,
}

/// Publisher with acknowledged delivery.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct PersistentPublisher {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    name: String,
    transport: TransportPtr,
    config: PublisherConfig,
    tags: TagGenerator,

    state: Mutex<PublisherState>,
    down: AtomicBool,
    listener: RwLock<Option<ReceiptListenerPtr>>,

    correlation: CorrelationTable,
    acks: AckQueue,
    dispatcher: DeliveryDispatcher,
    waiters: DashMap<CorrelationTag, oneshot::Sender<AckOutcome>>,

    // None in BackPressure::Direct mode
    send_buffer: Option<Arc<SendBuffer>>,
    send_worker: Mutex<Option<JoinHandle<()>>>,

    me: Weak<Inner>,
}

/// Transport-facing callbacks.
///
/// Holds the publisher weakly so the transport's handler registry does not
/// keep a dropped publisher alive.
struct Callbacks(Weak<Inner>);

impl AckHandler for Callbacks {
    fn on_ack(&self, tag: CorrelationTag, outcome: AckOutcome) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_ack(tag, outcome);
        }
    }
}

impl ConnectivityHandler for Callbacks {
    fn on_transport_down(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_transport_down();
        }
    }
}

impl PersistentPublisher {
    pub(crate) fn new(transport: TransportPtr, config: PublisherConfig, service_id: &str) -> Self {
        // ---
        let tags = TagGenerator::new();
        let short_id = tags.publisher_id().get(..8).unwrap_or(tags.publisher_id());
        let name = format!("{service_id}/publisher-{short_id}");

        let send_buffer = match config.back_pressure {
            BackPressure::Elastic => Some(Arc::new(SendBuffer::new(None))),
            BackPressure::Reject { capacity } => Some(Arc::new(SendBuffer::new(Some(capacity)))),
            BackPressure::Direct => None,
        };

        let inner = Arc::new_cyclic(|me| Inner {
            dispatcher: DeliveryDispatcher::new(format!("{name}/dispatcher")),
            name,
            transport,
            config,
            tags,
            state: Mutex::new(PublisherState::NotStarted),
            down: AtomicBool::new(false),
            listener: RwLock::new(None),
            correlation: CorrelationTable::new(),
            acks: AckQueue::new(),
            waiters: DashMap::new(),
            send_buffer,
            send_worker: Mutex::new(None),
            me: me.clone(),
        });

        Self { inner }
    }

    /// Globally unique identity of this publisher, embedded in its tags.
    pub fn publisher_id(&self) -> &str {
        self.inner.tags.publisher_id()
    }

    pub fn state(&self) -> PublisherState {
        *lock_ignore_poison(&self.inner.state)
    }

    /// Connect the publisher to its transport.
    ///
    /// Idempotent while started.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::IllegalState`] if the transport is not connected
    /// or the publisher is terminating or terminated.
    pub fn start(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        let mut state = lock_ignore_poison(&inner.state);

        match *state {
            PublisherState::Started => return Ok(()),
            PublisherState::Terminating | PublisherState::Terminated => {
                return Err(PubSubError::IllegalState(format!(
                    "{}: cannot start a publisher that is {:?}",
                    inner.name, *state
                )));
            }
            PublisherState::NotStarted => {}
        }

        inner.config.validate()?;

        if !inner.transport.is_connected() {
            return Err(PubSubError::IllegalState(format!(
                "{}: transport '{}' is not connected",
                inner.name,
                inner.transport.transport_id()
            )));
        }

        let callbacks = Arc::new(Callbacks(inner.me.clone()));
        inner
            .transport
            .register_ack_handler(inner.tags.publisher_id(), callbacks.clone());
        inner
            .transport
            .register_connectivity_handler(inner.tags.publisher_id(), callbacks);

        if let Some(buffer) = &inner.send_buffer {
            let worker = tokio::spawn(run_send_worker(inner.me.clone(), buffer.clone()));
            *lock_ignore_poison(&inner.send_worker) = Some(worker);
        }

        *state = PublisherState::Started;
        log_info!("{}: started", inner.name);
        Ok(())
    }

    /// Install (or replace) the receipt listener.
    ///
    /// Only publishes issued while a listener is set produce receipts.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::IllegalState`] unless the publisher is started.
    pub fn set_receipt_listener<L>(&self, listener: L) -> Result<()>
    where
        L: ReceiptListener + 'static,
    {
        // ---
        let inner = &self.inner;
        if self.state() != PublisherState::Started {
            return Err(PubSubError::IllegalState(format!(
                "{}: receipt listener can only be set on a started publisher",
                inner.name
            )));
        }

        let listener: ReceiptListenerPtr = Arc::new(listener);
        match inner.listener.write() {
            Ok(mut guard) => *guard = Some(listener),
            Err(poisoned) => *poisoned.into_inner() = Some(listener),
        }

        inner.dispatcher.start();
        if !inner.acks.is_empty() {
            inner.dispatch_drain();
        }
        Ok(())
    }

    /// Publish without waiting for the acknowledgement.
    ///
    /// Returns once the message is buffered for sending (or, in
    /// [`BackPressure::Direct`] mode, accepted by the transport). When a
    /// receipt listener is set, its receipt will carry `user_context`.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::IllegalState`] if the publisher is not started or the
    ///   transport is down.
    /// - [`PubSubError::PublisherOverflow`] if a reject-mode buffer is full.
    /// - Any send error of the transport in direct mode.
    pub async fn publish(
        &self,
        message: impl Into<OutboundMessage>,
        destination: &Topic,
        user_context: Option<UserContext>,
    ) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.check_ready()?;

        let publishable = persistent_publishable(message.into(), destination);

        let tag = if inner.has_listener() {
            let tag = inner.tags.next(CorrelationClass::FireAndForget);
            inner.correlation.record(tag.clone(), None, user_context);
            Some(tag)
        } else {
            None
        };

        match &inner.send_buffer {
            Some(buffer) => {
                if let Err(err) = buffer.push(publishable, tag.clone()) {
                    if let Some(tag) = &tag {
                        inner.remove_correlation(tag);
                    }
                    return Err(err);
                }
                Ok(())
            }
            None => {
                if let Some(tag) = &tag {
                    inner.add_correlation(&publishable, tag);
                }
                if let Err(err) = inner.transport.send(&publishable, tag.as_ref()).await {
                    if let Some(tag) = &tag {
                        inner.remove_correlation(tag);
                    }
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Publish and wait until the transport acknowledges the message.
    ///
    /// `timeout` of `None` waits until the acknowledgement arrives or the
    /// publisher terminates.
    ///
    /// # Errors
    ///
    /// - [`PubSubError::Timeout`] if no acknowledgement arrived in time. A
    ///   late acknowledgement is discarded.
    /// - The error carried by a negative acknowledgement or a failed send.
    /// - [`PubSubError::IllegalState`] if the publisher is not ready, or
    ///   terminated while the call was waiting.
    pub async fn publish_await_acknowledgement(
        &self,
        message: impl Into<OutboundMessage>,
        destination: &Topic,
        timeout: Option<Duration>,
    ) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.check_ready()?;

        let publishable = persistent_publishable(message.into(), destination);
        let tag = inner.tags.next(CorrelationClass::Await);

        // slot first: the ack may be delivered from inside send()
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(tag.clone(), tx);

        let sent = match &inner.send_buffer {
            Some(buffer) => buffer.push(publishable, Some(tag.clone())),
            None => inner.transport.send(&publishable, Some(&tag)).await,
        };
        if let Err(err) = sent {
            inner.waiters.remove(&tag);
            return Err(err);
        }

        let outcome = match timeout {
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    inner.waiters.remove(&tag);
                    log_debug!("{}: {tag} timed out after {limit:?}", inner.name);
                    return Err(PubSubError::Timeout);
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(PubSubError::IllegalState(format!(
                "{}: publisher terminated while awaiting acknowledgement",
                inner.name
            ))),
        }
    }

    /// Complete the correlation of a message the transport has taken.
    ///
    /// Await-class tags need no correlation and are ignored.
    pub fn add_correlation(&self, publishable: &Publishable, tag: &CorrelationTag) {
        self.inner.add_correlation(publishable, tag);
    }

    /// Forget the correlation of a message that was never sent.
    pub fn remove_correlation(&self, tag: &CorrelationTag) {
        self.inner.remove_correlation(tag);
    }

    /// Report a transmission failure for `publishable`.
    ///
    /// For fire-and-forget tags this produces a failed receipt. For await
    /// tags the failure goes to the waiting caller; without a tag it is only
    /// logged.
    pub fn notify_publish_error(
        &self,
        error: PubSubError,
        publishable: Option<&Publishable>,
        tag: Option<&CorrelationTag>,
    ) {
        self.inner.notify_publish_error(error, publishable, tag);
    }

    /// Connectivity-loss entry point, also invoked by the transport.
    ///
    /// Fails every message still buffered for sending.
    pub fn on_transport_down(&self) {
        self.inner.on_transport_down();
    }

    /// Terminate with the configured grace period.
    pub async fn terminate_default(&self) -> Result<()> {
        self.terminate(self.inner.config.grace_period).await
    }

    /// Stop publishing and wait up to `grace_period` for buffered messages to
    /// be sent and for outstanding receipts to be delivered.
    ///
    /// Blocked [`publish_await_acknowledgement`](Self::publish_await_acknowledgement)
    /// calls are woken with [`PubSubError::IllegalState`]. Idempotent once
    /// terminated.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::IncompleteDelivery`] when messages were still
    /// unsent or receipts still outstanding after the grace period. Those
    /// messages are discarded.
    pub async fn terminate(&self, grace_period: Duration) -> Result<()> {
        // ---
        let inner = &self.inner;

        {
            let mut state = lock_ignore_poison(&inner.state);
            match *state {
                PublisherState::Terminated | PublisherState::Terminating => return Ok(()),
                PublisherState::NotStarted => {
                    *state = PublisherState::Terminated;
                    return Ok(());
                }
                PublisherState::Started => *state = PublisherState::Terminating,
            }
        }

        log_info!("{}: terminating, grace period {grace_period:?}", inner.name);

        let mut remaining = grace_period;
        if let Some(buffer) = &inner.send_buffer {
            remaining = buffer.wait_for_empty(remaining).await;
        }
        if inner.has_listener() {
            let correlation = &inner.correlation;
            inner
                .acks
                .wait_for_empty(remaining, || correlation.is_empty())
                .await;
        }

        let unpublished = inner.send_buffer.as_ref().map_or(0, |b| b.len());
        let pending_receipts = inner.correlation.len();

        // stop the send side
        if let Some(buffer) = &inner.send_buffer {
            buffer.close();
        }
        let worker = lock_ignore_poison(&inner.send_worker).take();
        if let Some(worker) = worker {
            worker.abort();
        }

        // wake blocked awaiting callers
        inner.waiters.clear();

        let drained = unpublished == 0 && pending_receipts == 0;
        inner.dispatcher.shutdown(drained).await;

        if let Some(buffer) = &inner.send_buffer {
            buffer.drain();
        }
        let _discarded = inner.acks.clear();
        inner.correlation.clear();

        inner
            .transport
            .unregister_ack_handler(inner.tags.publisher_id());
        inner
            .transport
            .unregister_connectivity_handler(inner.tags.publisher_id());

        *lock_ignore_poison(&inner.state) = PublisherState::Terminated;

        if drained {
            log_info!("{}: terminated", inner.name);
            return Ok(());
        }

        let err = PubSubError::IncompleteDelivery {
            unpublished,
            pending_receipts,
        };
        log_warn!("{}: {err} ({_discarded} queued ack(s) dropped)", inner.name);
        Err(err)
    }

    /// `true` when a publish call would be accepted right now.
    pub fn is_ready(&self) -> bool {
        // ---
        self.inner.check_ready().is_ok()
            && !self
                .inner
                .send_buffer
                .as_ref()
                .is_some_and(|buffer| buffer.is_full())
    }

    pub fn is_running(&self) -> bool {
        self.state() == PublisherState::Started
    }

    pub fn is_terminating(&self) -> bool {
        self.state() == PublisherState::Terminating
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == PublisherState::Terminated
    }

    /// Messages accepted by `publish` but not yet handed to the transport.
    pub fn unpublished_count(&self) -> usize {
        self.inner.send_buffer.as_ref().map_or(0, |b| b.len())
    }

    /// Correlated publishes whose receipt has not been delivered yet.
    pub fn pending_receipt_count(&self) -> usize {
        self.inner.correlation.len()
    }
}

impl Inner {
    fn check_ready(&self) -> Result<()> {
        // ---
        let state = *lock_ignore_poison(&self.state);
        if state != PublisherState::Started {
            return Err(PubSubError::IllegalState(format!(
                "{}: cannot publish while {state:?}",
                self.name
            )));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(PubSubError::IllegalState(format!(
                "{}: transport is down",
                self.name
            )));
        }
        Ok(())
    }

    fn listener(&self) -> Option<ReceiptListenerPtr> {
        match self.listener.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn has_listener(&self) -> bool {
        self.listener().is_some()
    }

    fn add_correlation(&self, publishable: &Publishable, tag: &CorrelationTag) {
        // ---
        if !tag.is_fire_and_forget() {
            return;
        }
        if self.correlation.fill_publishable(tag, publishable) && !self.acks.is_empty() {
            // an ack may be parked behind this entry
            self.dispatch_drain();
        }
    }

    fn remove_correlation(&self, tag: &CorrelationTag) {
        // ---
        if tag.is_fire_and_forget() {
            self.correlation.take(tag);
        }
    }

    fn notify_publish_error(
        &self,
        error: PubSubError,
        publishable: Option<&Publishable>,
        tag: Option<&CorrelationTag>,
    ) {
        // ---
        let Some(tag) = tag else {
            log_error!("{}: publish failed, no receipt requested: {error}", self.name);
            return;
        };

        match tag.class() {
            CorrelationClass::FireAndForget => {
                let known = match publishable {
                    Some(publishable) => self.correlation.fill_publishable(tag, publishable),
                    None => self.correlation.has_publishable(tag),
                };
                if !known {
                    // a queued event without its message would stall every later receipt
                    if self.correlation.take(tag).is_some() {
                        log_error!(
                            "{}: {tag} failed without publishable message, no receipt: {error}",
                            self.name
                        );
                    } else {
                        log_error!(
                            "{}: publish failure for unknown {tag} dropped: {error}",
                            self.name
                        );
                    }
                    return;
                }
                log_debug!("{}: {tag} failed: {error}", self.name);
                self.acks.push(AckEvent::new(tag.clone(), Err(error)));
                self.dispatch_drain();
            }
            CorrelationClass::Await => match self.waiters.remove(tag) {
                Some((_, waiter)) => {
                    log_debug!("{}: {tag} failed, reporting to caller: {error}", self.name);
                    let _ = waiter.send(Err(error));
                }
                None => log_warn!(
                    "{}: publish failure for {tag} after caller stopped waiting: {error}",
                    self.name
                ),
            },
        }
    }

    fn on_ack(&self, tag: CorrelationTag, outcome: AckOutcome) {
        // ---
        let state = *lock_ignore_poison(&self.state);
        if !matches!(state, PublisherState::Started | PublisherState::Terminating) {
            log_debug!("{}: ack for {tag} while {state:?}, dropped", self.name);
            return;
        }

        match tag.class() {
            CorrelationClass::FireAndForget => {
                self.acks.push(AckEvent::new(tag, outcome));
                if self.has_listener() {
                    self.dispatch_drain();
                }
            }
            CorrelationClass::Await => match self.waiters.remove(&tag) {
                Some((_, waiter)) => {
                    let _ = waiter.send(outcome);
                }
                None => log_warn!("{}: late ack for {tag} dropped", self.name),
            },
        }
    }

    fn on_transport_down(&self) {
        // ---
        if *lock_ignore_poison(&self.state) != PublisherState::Started {
            return;
        }
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }

        log_warn!("{}: transport down, failing buffered messages", self.name);

        // the send worker fails the buffered messages in order
        if let Some(buffer) = &self.send_buffer {
            buffer.wake();
        }
    }

    fn dispatch_drain(&self) {
        // ---
        let me = self.me.clone();
        self.dispatcher.dispatch(Box::new(move || {
            if let Some(inner) = me.upgrade() {
                inner.drain_receipts();
            }
            Ok(())
        }));
    }

    /// Turn queued acknowledgements into receipts, in queue order.
    ///
    /// Stops at the first event whose correlation still waits for the send
    /// path; `add_correlation` triggers the next drain.
    fn drain_receipts(&self) {
        // ---
        while let Some(listener) = self.listener() {
            let Some(event) = self.acks.peek() else {
                return;
            };

            match self.correlation.take_complete(&event.tag) {
                Lookup::Partial => {
                    log_debug!("{}: {} waits for send confirmation", self.name, event.tag);
                    return;
                }
                Lookup::Absent => {
                    log_debug!("{}: no correlation for {}, ack dropped", self.name, event.tag);
                }
                Lookup::Ready(entry) => {
                    let (publishable, user_context) = entry.into_parts();
                    if let Some(publishable) = publishable {
                        let receipt = PublishReceipt::new(
                            publishable.message,
                            event.outcome.err(),
                            user_context,
                        );
                        self.deliver(&listener, receipt);
                    }
                }
            }

            self.acks.pop();
        }
    }

    fn deliver(&self, listener: &ReceiptListenerPtr, receipt: PublishReceipt) {
        // ---
        match panic::catch_unwind(AssertUnwindSafe(|| listener.on_publish_receipt(receipt))) {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => log_warn!("{}: receipt listener failed: {_err}", self.name),
            Err(_) => log_error!("{}: receipt listener panicked", self.name),
        }
    }

    /// Hand one buffered message to the transport.
    async fn send_buffered(&self, buffer: &SendBuffer, item: BufferedSend) {
        // ---
        if let Some(tag) = &item.tag {
            self.add_correlation(&item.publishable, tag);
        }

        let result = self
            .transport
            .send(&item.publishable, item.tag.as_ref())
            .await;
        buffer.pop_if(item.id);

        if let Err(err) = result {
            self.notify_publish_error(err, Some(&item.publishable), item.tag.as_ref());
        }
    }

    fn cancel_buffered(&self, buffer: &SendBuffer) {
        // ---
        let cancelled = buffer.drain();
        if cancelled.is_empty() {
            return;
        }

        log_warn!(
            "{}: cancelling {} unsent message(s)",
            self.name,
            cancelled.len()
        );

        for item in cancelled {
            let err = PubSubError::Delivery {
                destination: item.publishable.destination.to_string(),
                reason: "publisher down, message was not sent".into(),
            };
            self.notify_publish_error(err, Some(&item.publishable), item.tag.as_ref());
        }
    }
}

/// Send worker: drains the send buffer in order until it is closed or the
/// publisher is dropped.
async fn run_send_worker(me: Weak<Inner>, buffer: Arc<SendBuffer>) {
    // ---
    while let Some(item) = buffer.next().await {
        let Some(inner) = me.upgrade() else {
            break;
        };

        if inner.down.load(Ordering::SeqCst) {
            inner.cancel_buffered(&buffer);
        } else {
            inner.send_buffered(&buffer, item).await;
        }
    }
    log_debug!("send worker stopped");
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        if let Some(buffer) = &self.send_buffer {
            buffer.close();
        }
    }
}

fn persistent_publishable(mut message: OutboundMessage, destination: &Topic) -> Publishable {
    message.delivery_mode = DeliveryMode::Persistent;
    Publishable::new(message, destination.clone())
}
