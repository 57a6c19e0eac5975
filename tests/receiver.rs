// tests/receiver.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Duration, Instant};

use common::lock;
use mom_pubsub::{
    // ---
    AckMode,
    DirectReceiver,
    InboundMessage,
    PubSubError,
    ReceiverState,
    Result,
    Subscription,
    Topic,
};

fn collect_into(receiver: &DirectReceiver) -> Result<Arc<Mutex<Vec<String>>>> {
    // ---
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    receiver.receive_async(move |message: InboundMessage| -> Result<()> {
        let text = message.payload_as_str().unwrap_or_default().to_string();
        lock(&sink).push(text);
        Ok(())
    })?;
    Ok(seen)
}

async fn wait_for_len(seen: &Mutex<Vec<String>>, n: usize) {
    // ---
    let deadline = Instant::now() + Duration::from_secs(5);
    while lock(seen).len() < n {
        assert!(Instant::now() < deadline, "only {} of {n} messages", lock(seen).len());
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_async_handler_sees_fifo_and_nothing_after_terminate() -> Result<()> {
    // ---
    const N: usize = 200;

    let (transport, service) = common::service("rx-fifo", AckMode::Auto);
    let receiver = service
        .receiver_builder()
        .subscription(Subscription::of("feed/>")?)
        .build();
    receiver.start().await?;
    let seen = collect_into(&receiver)?;

    let publisher = service.publisher_builder().unbuffered().build()?;
    publisher.start()?;

    let topic = Topic::of("feed/prices")?;
    for i in 0..N {
        publisher.publish(i.to_string(), &topic, None).await?;
    }

    wait_for_len(&seen, N).await;
    let expected: Vec<String> = (0..N).map(|i| i.to_string()).collect();
    assert_eq!(*lock(&seen), expected);

    receiver.terminate(Duration::from_secs(1)).await?;
    assert_eq!(receiver.state(), ReceiverState::Terminated);

    publisher.publish("after", &topic, None).await?;
    assert_eq!(transport.inject(&topic, "injected"), 0);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(lock(&seen).len(), N);

    publisher.terminate(Duration::from_secs(1)).await
}

#[tokio::test]
async fn test_terminate_lets_handler_drain_backlog() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-drain", AckMode::Auto);
    let receiver = service
        .receiver_builder()
        .subscription(Subscription::of("jobs")?)
        .build();
    receiver.start().await?;

    let topic = Topic::of("jobs")?;
    for i in 0..50 {
        transport.inject(&topic, format!("{i}"));
    }
    let seen = collect_into(&receiver)?;

    receiver.terminate(Duration::from_secs(2)).await?;
    assert_eq!(lock(&seen).len(), 50);
    Ok(())
}

#[tokio::test]
async fn test_receive_message_times_out_after_50ms() -> Result<()> {
    // ---
    let (_transport, service) = common::service("rx-timeout", AckMode::Auto);
    let receiver = service
        .receiver_builder()
        .subscription(Subscription::of("quiet")?)
        .build();
    receiver.start().await?;

    let started = Instant::now();
    let message = receiver
        .receive_message(Some(Duration::from_millis(50)))
        .await?;
    let elapsed = started.elapsed();

    assert!(message.is_none());
    assert!(elapsed >= Duration::from_millis(50), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "returned after {elapsed:?}");

    receiver.terminate_default().await
}

#[tokio::test]
async fn test_receive_message_pulls_in_order() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-pull", AckMode::Auto);
    let receiver = service
        .receiver_builder()
        .subscription(Subscription::of("a/*")?)
        .build();
    receiver.start().await?;

    transport.inject(&Topic::of("a/1")?, "one");
    transport.inject(&Topic::of("a/2")?, "two");
    transport.inject(&Topic::of("b/3")?, "skipped");

    let wait = Some(Duration::from_millis(200));
    let first = receiver.receive_message(wait).await?.expect("first message");
    let second = receiver.receive_message(wait).await?.expect("second message");
    assert_eq!(first.payload_as_str(), Some("one"));
    assert_eq!(second.destination.name(), "a/2");
    assert!(receiver.receive_message(Some(Duration::from_millis(10))).await?.is_none());

    receiver.terminate(Duration::ZERO).await
}

#[tokio::test]
async fn test_subscriptions_can_change_while_started() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-subs", AckMode::Auto);
    let receiver = service.receiver_builder().build();
    receiver.start().await?;

    let alerts = Subscription::of("alerts")?;
    let topic = Topic::of("alerts")?;
    assert_eq!(transport.inject(&topic, "ignored"), 0);

    receiver.add_subscription(&alerts).await?;
    assert_eq!(transport.inject(&topic, "seen"), 1);

    receiver.remove_subscription(&alerts).await?;
    assert_eq!(transport.inject(&topic, "ignored"), 0);

    let message = receiver.receive_message(Some(Duration::from_millis(100))).await?;
    assert_eq!(message.and_then(|m| m.payload_as_str().map(str::to_owned)), Some("seen".into()));

    receiver.terminate(Duration::ZERO).await?;
    assert!(matches!(
        receiver.add_subscription(&alerts).await,
        Err(PubSubError::IllegalState(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_shared_subscription_splits_messages_across_group() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-shared", AckMode::Auto);
    let sub = Subscription::of("work/>")?;

    let mut members = Vec::new();
    for _ in 0..2 {
        let receiver = service
            .receiver_builder()
            .subscription(sub.clone())
            .group_name("workers")
            .build();
        receiver.start().await?;
        members.push(receiver);
    }

    let topic = Topic::of("work/item")?;
    for i in 0..10 {
        assert_eq!(transport.inject(&topic, format!("{i}")), 1);
    }

    let mut received = Vec::new();
    for member in &members {
        let mut count = 0;
        while let Some(message) = member.receive_message(Some(Duration::from_millis(20))).await? {
            received.push(message.payload_as_str().unwrap_or_default().to_string());
            count += 1;
        }
        assert_eq!(count, 5);
    }
    received.sort_by_key(|s| s.parse::<u32>().unwrap_or(u32::MAX));
    assert_eq!(received, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());

    for member in members {
        member.terminate(Duration::ZERO).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_start_reports_every_failed_subscription() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-start", AckMode::Auto);
    transport.fail_subscription("bad/one");
    transport.fail_subscription("bad/two");

    let receiver = service
        .receiver_builder()
        .with_subscriptions([
            Subscription::of("good")?,
            Subscription::of("bad/one")?,
            Subscription::of("bad/two")?,
        ])
        .build();

    match receiver.start().await {
        Err(PubSubError::Subscription { failures }) => assert_eq!(failures.len(), 2),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(receiver.state(), ReceiverState::NotStarted);
    assert_eq!(transport.subscription_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failing_handler_keeps_receiving() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-handler-err", AckMode::Auto);
    let receiver = service
        .receiver_builder()
        .subscription(Subscription::of("t")?)
        .build();
    receiver.start().await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    receiver.receive_async(move |_message: InboundMessage| -> Result<()> {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Err(PubSubError::InvalidArgument("bad message".into())),
            1 => panic!("handler bug"),
            _ => Ok(()),
        }
    })?;

    let topic = Topic::of("t")?;
    for _ in 0..4 {
        transport.inject(&topic, "m");
    }

    receiver.terminate(Duration::from_secs(2)).await?;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_does_not_wait_on_slow_handler() -> Result<()> {
    // ---
    let (transport, service) = common::service("rx-slow-handler", AckMode::Auto);
    let receiver = service
        .receiver_builder()
        .subscription(Subscription::of("slow")?)
        .build();
    receiver.start().await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    receiver.receive_async(move |_message: InboundMessage| -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(1500));
        Ok(())
    })?;

    transport.inject(&Topic::of("slow")?, "m");
    let deadline = Instant::now() + Duration::from_secs(5);
    while calls.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "handler never called");
        sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    receiver.terminate(Duration::from_millis(50)).await?;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(500), "terminate took {elapsed:?}");
    assert_eq!(receiver.state(), ReceiverState::Terminated);
    Ok(())
}
