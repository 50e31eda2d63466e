use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::broker::{
    Broker, HandlerError, HandlerResult, Message, OrderingMode, PublishRequest, QueueConfig,
    RetentionWindow, RetryPolicy, SubscribeOptions, TopicConfig,
};
use crate::config::{BrokerSettings, QueueSettings, Settings, TopicSettings};

fn broker() -> Broker {
    Broker::with_settings(&BrokerSettings {
        poll_interval_ms: 5,
        ..BrokerSettings::default()
    })
}

fn queue_config(max_attempts: u32) -> QueueConfig {
    QueueConfig {
        capacity: 10,
        ordering: OrderingMode::Priority,
        visibility_timeout: Duration::from_secs(5),
        retry: RetryPolicy::immediate(max_attempts),
    }
}

fn topic_config(max_attempts: u32) -> TopicConfig {
    TopicConfig {
        retention: RetentionWindow::messages(100),
        subscription: QueueConfig {
            capacity: 100,
            ..queue_config(max_attempts)
        },
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn integration_retry_until_success() {
    let broker = broker();
    let orders = broker.create_queue("orders", queue_config(3)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let handler_calls = Arc::clone(&calls);
    broker
        .subscribe(
            "orders",
            move |_message: Message| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(HandlerError::retry("downstream unavailable"));
                    }
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    broker
        .publish("orders", PublishRequest::new(b"order-1".to_vec()))
        .unwrap();

    eventually("ack", || orders.snapshot().acked == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(broker.dead_letters("orders").is_empty());
    assert!(orders.is_empty());

    let snapshot = orders.snapshot();
    assert_eq!(snapshot.delivered, 3);
    assert_eq!(snapshot.failed, 2);
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_exhausted_attempts_dead_letter() {
    let broker = broker();
    let orders = broker.create_queue("orders", queue_config(2)).unwrap();

    broker
        .subscribe(
            "orders",
            |_message: Message| async move {
                HandlerResult::Err(HandlerError::retry("always fails"))
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    let id = broker
        .publish("orders", PublishRequest::new(b"order-1".to_vec()))
        .unwrap();

    eventually("dead letter", || !broker.dead_letters("orders").is_empty()).await;
    let entries = broker.dead_letters("orders");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, id);
    assert_eq!(entries[0].attempts, 2);
    assert_eq!(entries[0].reason, "always fails");
    assert!(orders.is_empty());
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_rejected_message_skips_retries() {
    let broker = broker();
    broker.create_queue("orders", queue_config(5)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let handler_calls = Arc::clone(&calls);
    broker
        .subscribe(
            "orders",
            move |_message: Message| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    HandlerResult::Err(HandlerError::reject("unparseable order"))
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();
    broker
        .publish("orders", PublishRequest::new(b"{".to_vec()))
        .unwrap();

    eventually("dead letter", || broker.dead_letter_store().len() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.dead_letters("orders")[0].reason, "unparseable order");
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_panicking_handler_is_retried() {
    let broker = broker();
    broker.create_queue("orders", queue_config(2)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let handler_calls = Arc::clone(&calls);
    broker
        .subscribe(
            "orders",
            move |message: Message| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if message.attempts > 0 {
                        panic!("boom");
                    }
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();
    broker
        .publish("orders", PublishRequest::new(b"order-1".to_vec()))
        .unwrap();

    eventually("dead letter", || broker.dead_letter_store().len() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.dead_letters("orders")[0].reason, "handler panicked: boom");
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_topic_replay_from_epoch() {
    let broker = broker();
    broker.create_topic("events", topic_config(3)).unwrap();

    for n in 0..5 {
        broker
            .publish("events", PublishRequest::new(format!("event-{n}")))
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    broker
        .subscribe(
            "events",
            move |message: Message| {
                let seen = Arc::clone(&handler_seen);
                async move {
                    seen.lock().push(String::from_utf8_lossy(&message.payload).into_owned());
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default().with_replay_since(epoch),
        )
        .unwrap();

    eventually("replayed events", || seen.lock().len() == 5).await;
    let expected: Vec<String> = (0..5).map(|n| format!("event-{n}")).collect();
    assert_eq!(*seen.lock(), expected);

    let snapshot = broker.metrics_snapshot();
    assert_eq!(snapshot["events"].counters.published, 5);
    assert_eq!(snapshot["events"].counters.replayed, 5);
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_replay_overflow_keeps_subscription() {
    let broker = broker();
    let topic = TopicConfig {
        retention: RetentionWindow::messages(100),
        subscription: QueueConfig {
            capacity: 2,
            ..queue_config(1)
        },
    };
    broker.create_topic("events", topic).unwrap();
    for n in 0..4 {
        broker
            .publish("events", PublishRequest::new(format!("event-{n}")).with_id(format!("e{n}")))
            .unwrap();
    }

    let handled = Arc::new(AtomicU32::new(0));
    let handler_handled = Arc::clone(&handled);
    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    let subscription = broker
        .subscribe(
            "events",
            move |_message: Message| {
                let handled = Arc::clone(&handler_handled);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default().with_replay_since(epoch),
        )
        .unwrap();

    eventually("fitting copies acked", || {
        broker.metrics_snapshot()["events"].counters.replay_acked == 2
    })
    .await;
    assert_eq!(handled.load(Ordering::SeqCst), 2);
    let overflowed: Vec<String> = broker
        .dead_letters("events")
        .into_iter()
        .map(|entry| entry.message.id)
        .collect();
    assert_eq!(overflowed, vec!["e2", "e3"]);
    assert!(broker.topic("events").unwrap().subscription(&subscription).is_some());

    let snapshot = broker.metrics_snapshot();
    let counters = &snapshot["events"].counters;
    assert_eq!(counters.acked, 0);
    assert_eq!(counters.replay_acked, 2);
    assert_eq!(counters.replay_dead_lettered, 2);
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_fan_out_isolates_subscriptions() {
    let broker = broker();
    broker.create_topic("events", topic_config(2)).unwrap();

    let failing = broker
        .subscribe(
            "events",
            |_message: Message| async move { HandlerResult::Err(HandlerError::retry("no")) },
            SubscribeOptions::default(),
        )
        .unwrap();

    let received = Arc::new(AtomicU32::new(0));
    let handler_received = Arc::clone(&received);
    broker
        .subscribe(
            "events",
            move |_message: Message| {
                let received = Arc::clone(&handler_received);
                async move {
                    received.fetch_add(1, Ordering::SeqCst);
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    for n in 0..3 {
        broker
            .publish("events", PublishRequest::new(format!("event-{n}")))
            .unwrap();
    }

    eventually("healthy deliveries", || received.load(Ordering::SeqCst) == 3).await;
    eventually("dead letters", || broker.dead_letters("events").len() == 3).await;
    assert!(
        broker
            .dead_letters("events")
            .iter()
            .all(|entry| entry.subscription.as_deref() == Some(failing.as_str()))
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_filtered_subscription() {
    let broker = broker();
    broker.create_topic("events", topic_config(1)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    broker
        .subscribe(
            "events",
            move |message: Message| {
                let seen = Arc::clone(&handler_seen);
                async move {
                    seen.lock().push(message.id);
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default()
                .with_filter(crate::broker::Filter::header_equals("kind", "order")),
        )
        .unwrap();

    let wanted = broker
        .publish(
            "events",
            PublishRequest::new(b"a".to_vec()).with_header("kind", "order"),
        )
        .unwrap();
    broker
        .publish(
            "events",
            PublishRequest::new(b"b".to_vec()).with_header("kind", "refund"),
        )
        .unwrap();

    eventually("filtered delivery", || seen.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*seen.lock(), vec![wanted]);
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_duplicate_message_is_suppressed() {
    let broker = broker();
    let orders = broker.create_queue("orders", queue_config(3)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let handler_calls = Arc::clone(&calls);
    broker
        .subscribe(
            "orders",
            move |_message: Message| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default(),
        )
        .unwrap();

    let request = PublishRequest::new(b"order-1".to_vec()).with_id("order-1");
    broker.publish("orders", request.clone()).unwrap();
    eventually("first ack", || orders.snapshot().acked == 1).await;
    broker.publish("orders", request).unwrap();
    eventually("second ack", || orders.snapshot().acked == 2).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(orders.snapshot().duplicates_suppressed, 1);
    assert!(broker.idempotency().is_processed("orders", "order-1"));
    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_competing_consumers_share_work() {
    let broker = broker();
    let orders = broker
        .create_queue(
            "orders",
            QueueConfig {
                capacity: 100,
                ..queue_config(3)
            },
        )
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    broker
        .subscribe(
            "orders",
            move |message: Message| {
                let seen = Arc::clone(&handler_seen);
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    seen.lock().push(message.id);
                    HandlerResult::Ok(())
                }
            },
            SubscribeOptions::default().with_concurrency(4),
        )
        .unwrap();

    for n in 0..20 {
        broker
            .publish("orders", PublishRequest::new(format!("order-{n}")))
            .unwrap();
    }

    eventually("all acks", || orders.snapshot().acked == 20).await;
    let seen = seen.lock();
    assert_eq!(seen.len(), 20);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 20);
    drop(seen);
    broker.shutdown().await;
}

#[tokio::test]
async fn integration_unsubscribe_stops_consumption() {
    let broker = broker();
    let orders = broker.create_queue("orders", queue_config(3)).unwrap();
    let topic = broker.create_topic("events", topic_config(3)).unwrap();

    let queue_subscriber = broker
        .subscribe(
            "orders",
            |_message: Message| async move { HandlerResult::Ok(()) },
            SubscribeOptions::default(),
        )
        .unwrap();
    let topic_subscriber = broker
        .subscribe(
            "events",
            |_message: Message| async move { HandlerResult::Ok(()) },
            SubscribeOptions::default(),
        )
        .unwrap();
    assert_eq!(broker.subscriber_count(), 2);

    broker.unsubscribe(&queue_subscriber).await.unwrap();
    broker.unsubscribe(&topic_subscriber).await.unwrap();
    assert_eq!(broker.subscriber_count(), 0);
    assert!(broker.unsubscribe(&queue_subscriber).await.is_err());

    broker
        .publish("orders", PublishRequest::new(b"order-1".to_vec()))
        .unwrap();
    broker
        .publish("events", PublishRequest::new(b"event-1".to_vec()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(orders.len(), 1);
    assert!(topic.subscriptions().is_empty());
}

#[tokio::test]
async fn integration_queue_rejects_topic_only_options() {
    let broker = broker();
    broker.create_queue("orders", queue_config(3)).unwrap();

    let result = broker.subscribe(
        "orders",
        |_message: Message| async move { HandlerResult::Ok(()) },
        SubscribeOptions::default().with_replay_since(Utc::now()),
    );
    assert!(result.is_err());
    assert_eq!(broker.subscriber_count(), 0);
}

#[test]
fn integration_broker_from_settings_declares_destinations() {
    let settings = Settings {
        queues: vec![QueueSettings {
            name: "orders".to_string(),
            capacity: Some(5),
            ordering: Some(OrderingMode::Priority),
            visibility_timeout_ms: None,
            max_attempts: Some(2),
            backoff_base_ms: Some(0),
            backoff_multiplier: None,
            backoff_cap_ms: None,
        }],
        topics: vec![TopicSettings {
            name: "events".to_string(),
            retention_messages: Some(10),
            retention_secs: None,
        }],
        ..Settings::default()
    };

    let broker = Broker::from_settings(&settings, None).unwrap();
    assert_eq!(broker.destinations(), vec!["events", "orders"]);

    let orders = broker.queue("orders").unwrap();
    assert_eq!(orders.config().capacity, 5);
    assert_eq!(orders.config().retry.max_attempts, 2);
    assert_eq!(
        broker.topic("events").unwrap().config().retention,
        RetentionWindow::messages(10)
    );
}
