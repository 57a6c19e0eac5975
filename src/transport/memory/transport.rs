// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics. Besides routing, it exposes a small set of driver controls
//! (manual acknowledgement, paused sends, forced rejections, simulated
//! connectivity loss) used by the test suite to reproduce the races a real
//! broker produces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::lock::lock_ignore_poison;
use crate::macros::{log_debug, log_info, log_warn};
use crate::{
    // ---
    AckHandlerPtr,
    AckMode,
    AckOutcome,
    ConnectivityHandlerPtr,
    CorrelationTag,
    InboundHandlerPtr,
    InboundMessage,
    PubSubError,
    Publishable,
    Result,
    Subscription,
    Topic,
    Transport,
    TransportConfig,
    TransportPtr,
};

#[derive(Clone)]
struct Subscriber {
    consumer_id: String,
    handler: InboundHandlerPtr,
}

/// In-memory transport.
///
/// ## Semantics
///
/// - Subscriptions are registered immediately.
/// - A subscription expression matches a topic level by level: `*` matches
///   exactly one level, a trailing `>` matches one or more levels.
/// - Shared subscriptions (`#share/{group}/{expr}`) deliver each message to a
///   single member of the group, chosen round-robin.
/// - Every correlated send that was accepted gets exactly one ack, either
///   immediately ([`AckMode::Auto`]), when the driver calls
///   [`ack`](Self::ack) ([`AckMode::Manual`]), or as a failure when the
///   transport goes down.
/// - Callbacks run inline on the task that triggered them.
///
/// ## Non-Goals
///
/// - Persistence or durability
/// - Network behavior beyond the explicit driver controls
pub struct MemoryTransport {
    // ---
    transport_id: String,
    ack_mode: AckMode,
    connected: AtomicBool,

    subscriptions: RwLock<HashMap<Subscription, Vec<Subscriber>>>,
    round_robin: AtomicUsize,
    refused_subscriptions: Mutex<HashSet<String>>,

    ack_handlers: DashMap<String, AckHandlerPtr>,
    connectivity_handlers: DashMap<String, ConnectivityHandlerPtr>,
    // manual mode: (tag, destination) in send order
    pending_acks: Mutex<VecDeque<(CorrelationTag, Topic)>>,

    // true while sends are held back by `pause_sends()`
    paused: watch::Sender<bool>,
    reject_budget: AtomicUsize,
    sent: AtomicUsize,
}

impl MemoryTransport {
    /// Create a connected in-memory transport.
    pub fn new(config: &TransportConfig) -> Arc<Self> {
        // ---
        log_debug!("{}: create memory transport", config.transport_id);

        let (paused, _) = watch::channel(false);

        Arc::new(Self {
            transport_id: config.transport_id.clone(),
            ack_mode: config.ack_mode,
            connected: AtomicBool::new(true),
            subscriptions: RwLock::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
            refused_subscriptions: Mutex::new(HashSet::new()),
            ack_handlers: DashMap::new(),
            connectivity_handlers: DashMap::new(),
            pending_acks: Mutex::new(VecDeque::new()),
            paused,
            reject_budget: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
        })
    }

    // --- driver controls ---

    /// Complete one pending manual acknowledgement.
    ///
    /// Returns `false` if the tag is not pending (never sent, already acked,
    /// or failed by a disconnect).
    pub fn ack(&self, tag: &CorrelationTag, outcome: AckOutcome) -> bool {
        // ---
        let found = {
            let mut pending = lock_ignore_poison(&self.pending_acks);
            match pending.iter().position(|(t, _)| t == tag) {
                Some(idx) => pending.remove(idx).map(|(tag, _)| tag),
                None => None,
            }
        };

        match found {
            Some(tag) => {
                self.deliver_ack(tag, outcome);
                true
            }
            None => false,
        }
    }

    /// Complete the oldest pending manual acknowledgement.
    pub fn ack_next(&self, outcome: AckOutcome) -> Option<CorrelationTag> {
        // ---
        let (tag, _) = lock_ignore_poison(&self.pending_acks).pop_front()?;
        self.deliver_ack(tag.clone(), outcome);
        Some(tag)
    }

    /// Complete every pending manual acknowledgement in send order.
    pub fn ack_all(&self, outcome: AckOutcome) -> usize {
        // ---
        let tags: Vec<_> = lock_ignore_poison(&self.pending_acks)
            .drain(..)
            .map(|(tag, _)| tag)
            .collect();
        let count = tags.len();
        for tag in tags {
            self.deliver_ack(tag, outcome.clone());
        }
        count
    }

    pub fn pending_ack_count(&self) -> usize {
        lock_ignore_poison(&self.pending_acks).len()
    }

    pub fn pending_ack_tags(&self) -> Vec<CorrelationTag> {
        lock_ignore_poison(&self.pending_acks)
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Pending manual acknowledgements with the destination of their send.
    pub fn pending_acks(&self) -> Vec<(CorrelationTag, Topic)> {
        lock_ignore_poison(&self.pending_acks).iter().cloned().collect()
    }

    /// Hold every subsequent `send()` until [`resume_sends`](Self::resume_sends)
    /// or a disconnect.
    pub fn pause_sends(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_sends(&self) {
        self.paused.send_replace(false);
    }

    /// Reject the next `count` sends with a delivery error.
    pub fn reject_next_sends(&self, count: usize) {
        self.reject_budget.store(count, Ordering::SeqCst);
    }

    /// Make every later `subscribe()` for this exact expression fail.
    pub fn fail_subscription(&self, expression: impl Into<String>) {
        lock_ignore_poison(&self.refused_subscriptions).insert(expression.into());
    }

    /// Simulate connectivity changes.
    ///
    /// Going down releases paused sends (they fail), fails every pending
    /// manual acknowledgement and notifies the registered connectivity
    /// handlers once.
    pub fn set_connected(&self, connected: bool) {
        // ---
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        if connected || !was_connected {
            return;
        }

        log_info!("{}: transport down", self.transport_id);

        // wake paused senders so they observe the disconnect
        self.paused.send_modify(|_| {});

        let orphaned = self.ack_all(Err(PubSubError::Transport(format!(
            "{}: connection lost before acknowledgement",
            self.transport_id
        ))));
        if orphaned > 0 {
            log_warn!(
                "{}: failed {orphaned} pending acknowledgement(s) on disconnect",
                self.transport_id
            );
        }

        let handlers: Vec<ConnectivityHandlerPtr> = self
            .connectivity_handlers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handler in handlers {
            handler.on_transport_down();
        }
    }

    /// Push a raw inbound message as if it came from the broker.
    ///
    /// Returns the number of handlers it was delivered to.
    pub fn inject(&self, topic: &Topic, payload: impl Into<Bytes>) -> usize {
        // ---
        self.route(InboundMessage::new(topic.clone(), payload))
    }

    /// Number of messages accepted by `send()`.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Number of (subscription, consumer) registrations.
    pub fn subscription_count(&self) -> usize {
        // ---
        let subs = match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.values().map(Vec::len).sum()
    }

    // --- internals ---

    fn deliver_ack(&self, tag: CorrelationTag, outcome: AckOutcome) {
        // ---
        let handler = self
            .ack_handlers
            .get(tag.publisher_id())
            .map(|entry| entry.value().clone());

        match handler {
            Some(handler) => handler.on_ack(tag, outcome),
            None => log_debug!("{}: no ack handler for {tag}, dropped", self.transport_id),
        }
    }

    fn route(&self, message: InboundMessage) -> usize {
        // ---
        let targets: Vec<InboundHandlerPtr> = {
            let subs = match self.subscriptions.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let mut targets = Vec::new();
            for (sub, subscribers) in subs.iter() {
                if subscribers.is_empty()
                    || !topic_matches(sub.topic_expression(), message.destination.name())
                {
                    continue;
                }

                if sub.topic_expression() != sub.as_str() {
                    let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % subscribers.len();
                    targets.push(subscribers[idx].handler.clone());
                } else {
                    targets.extend(subscribers.iter().map(|s| s.handler.clone()));
                }
            }
            targets
        };

        log_debug!(
            "{}: route {} to {} handler(s)",
            self.transport_id,
            message.destination,
            targets.len()
        );

        let count = targets.len();
        for handler in targets {
            handler.on_message(message.clone());
        }
        count
    }

    async fn wait_until_released(&self) {
        // ---
        let mut rx = self.paused.subscribe();
        let _ = rx
            .wait_for(|paused| !*paused || !self.connected.load(Ordering::SeqCst))
            .await;
    }

    fn not_connected(&self) -> PubSubError {
        PubSubError::Transport(format!("{}: not connected", self.transport_id))
    }
}

/// Level-wise subscription matching.
///
/// `*` matches exactly one level; a trailing `>` matches one or more.
fn topic_matches(expression: &str, topic: &str) -> bool {
    // ---
    let mut levels = topic.split('/');
    let mut patterns = expression.split('/').peekable();

    while let Some(pattern) = patterns.next() {
        if pattern == ">" && patterns.peek().is_none() {
            return levels.next().is_some();
        }
        match levels.next() {
            Some(level) if pattern == "*" || pattern == level => {}
            _ => return false,
        }
    }

    levels.next().is_none()
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Route a message to all matching subscriptions.
    ///
    /// Returns once the message has been handed to every matching handler.
    /// The acknowledgement for `tag` is delivered before returning in
    /// [`AckMode::Auto`], and parked for the driver in [`AckMode::Manual`].
    async fn send(&self, publishable: &Publishable, tag: Option<&CorrelationTag>) -> Result<()> {
        // ---
        if !self.is_connected() {
            return Err(self.not_connected());
        }

        self.wait_until_released().await;
        if !self.is_connected() {
            return Err(self.not_connected());
        }

        let rejected = self
            .reject_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(PubSubError::Delivery {
                destination: publishable.destination.to_string(),
                reason: "rejected by transport".into(),
            });
        }

        self.sent.fetch_add(1, Ordering::SeqCst);
        self.route(InboundMessage::from(publishable));

        if let Some(tag) = tag {
            match self.ack_mode {
                AckMode::Auto => self.deliver_ack(tag.clone(), Ok(())),
                AckMode::Manual => lock_ignore_poison(&self.pending_acks)
                    .push_back((tag.clone(), publishable.destination.clone())),
            }
        }

        Ok(())
    }

    fn register_ack_handler(&self, publisher_id: &str, handler: AckHandlerPtr) {
        self.ack_handlers.insert(publisher_id.to_string(), handler);
    }

    fn unregister_ack_handler(&self, publisher_id: &str) {
        self.ack_handlers.remove(publisher_id);
    }

    async fn subscribe(
        &self,
        sub: &Subscription,
        consumer_id: &str,
        handler: InboundHandlerPtr,
    ) -> Result<()> {
        // ---
        if !self.is_connected() {
            return Err(self.not_connected());
        }

        if lock_ignore_poison(&self.refused_subscriptions).contains(sub.as_str()) {
            return Err(PubSubError::Transport(format!(
                "subscription '{sub}' refused by broker"
            )));
        }

        log_debug!("{}: {consumer_id} subscribe to {sub}", self.transport_id);

        let mut subs = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.entry(sub.clone()).or_default().push(Subscriber {
            consumer_id: consumer_id.to_string(),
            handler,
        });

        Ok(())
    }

    async fn unsubscribe(&self, sub: &Subscription, consumer_id: &str) -> Result<()> {
        // ---
        log_debug!("{}: {consumer_id} unsubscribe from {sub}", self.transport_id);

        let mut subs = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(subscribers) = subs.get_mut(sub) {
            subscribers.retain(|s| s.consumer_id != consumer_id);
            if subscribers.is_empty() {
                subs.remove(sub);
            }
        }

        Ok(())
    }

    fn register_connectivity_handler(&self, id: &str, handler: ConnectivityHandlerPtr) {
        self.connectivity_handlers.insert(id.to_string(), handler);
    }

    fn unregister_connectivity_handler(&self, id: &str) {
        self.connectivity_handlers.remove(id);
    }

    /// Close the transport.
    ///
    /// Behaves like a connectivity loss, then clears all subscriptions.
    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing transport...", self.transport_id);

        self.set_connected(false);

        let mut subs = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.clear();
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// Use [`MemoryTransport::new`] instead when the driver controls are needed.
///
/// # Errors
///
/// Currently infallible: always returns `Ok`.
pub fn create_transport(config: &TransportConfig) -> Result<TransportPtr> {
    // ---
    Ok(MemoryTransport::new(config))
}
