// tests/transport_memory.rs

mod common;

use std::sync::{Arc, Mutex};

use tokio::time::{timeout, Duration};

use mom_pubsub::{
    // ---
    AckHandler,
    AckMode,
    AckOutcome,
    CorrelationTag,
    InboundHandler,
    InboundMessage,
    OutboundMessage,
    Publishable,
    Subscription,
    Topic,
    Transport,
    TransportConfig,
};

#[derive(Default)]
struct Inbox(Mutex<Vec<InboundMessage>>);

impl InboundHandler for Inbox {
    fn on_message(&self, message: InboundMessage) {
        common::lock(&self.0).push(message);
    }
}

#[tokio::test]
async fn memory_subscribe_then_send_delivers() {
    // ---
    // Arrange
    // ---
    common::init_logging();
    let transport = mom_pubsub::create_memory_transport(&TransportConfig::memory("mstsd"))
        .expect("failed to create memory transport");

    let inbox = Arc::new(Inbox::default());
    transport
        .subscribe(&Subscription::of("sensors/*/temp").unwrap(), "c1", inbox.clone())
        .await
        .expect("subscribe failed");

    let topic = Topic::of("sensors/kitchen/temp").unwrap();
    let publishable = Publishable::new(OutboundMessage::from("21.5"), topic.clone());

    // ---
    // Act
    // ---
    transport.send(&publishable, None).await.expect("send failed");
    transport
        .send(
            &Publishable::new(OutboundMessage::from("x"), Topic::of("sensors/kitchen/humidity").unwrap()),
            None,
        )
        .await
        .expect("send failed");

    // ---
    // Assert
    // ---
    let received = common::lock(&inbox.0).clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].destination, topic);
    assert_eq!(received[0].payload_as_str(), Some("21.5"));
}

#[tokio::test]
async fn memory_paused_send_fails_on_disconnect() {
    // ---
    common::init_logging();
    let transport = mom_pubsub::MemoryTransport::new(
        &TransportConfig::memory("mpsfd").with_ack_mode(AckMode::Manual),
    );
    transport.pause_sends();

    let sender = {
        let transport = transport.clone();
        tokio::spawn(async move {
            let publishable = Publishable::new(OutboundMessage::from("m"), Topic::of("t").unwrap());
            transport.send(&publishable, None).await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent_count(), 0);

    transport.set_connected(false);
    let result = timeout(Duration::from_secs(1), sender)
        .await
        .expect("paused send was not released")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test]
async fn memory_ack_reaches_handler_of_tag_publisher_only() {
    // ---
    struct Acks(Mutex<Vec<(CorrelationTag, bool)>>);

    impl AckHandler for Acks {
        fn on_ack(&self, tag: CorrelationTag, outcome: AckOutcome) {
            common::lock(&self.0).push((tag, outcome.is_ok()));
        }
    }

    common::init_logging();
    let transport = mom_pubsub::MemoryTransport::new(
        &TransportConfig::memory("marhotpo").with_ack_mode(AckMode::Manual),
    );

    let mine = Arc::new(Acks(Mutex::new(Vec::new())));
    let other = Arc::new(Acks(Mutex::new(Vec::new())));
    transport.register_ack_handler("p1", mine.clone());
    transport.register_ack_handler("p2", other.clone());

    let topic = Topic::of("orders").unwrap();
    let publishable = Publishable::new(OutboundMessage::from("m"), topic.clone());
    let tag = CorrelationTag::new("p1", mom_pubsub::CorrelationClass::FireAndForget, 1);
    transport.send(&publishable, Some(&tag)).await.unwrap();

    assert_eq!(transport.pending_acks(), vec![(tag.clone(), topic)]);
    assert!(transport.ack(&tag, Ok(())));
    assert!(!transport.ack(&tag, Ok(())));

    assert_eq!(*common::lock(&mine.0), vec![(tag, true)]);
    assert!(common::lock(&other.0).is_empty());
}
