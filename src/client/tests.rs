use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::broker::message::{Message, Reliability};
use crate::client::dispatch::{Dispatcher, RouteOutcome};
use crate::client::session::{PublishReceipt, Registry};

fn msg(topic: &str, sequence: u64, payload: &'static [u8]) -> Message {
    Message::new(
        topic.to_string(),
        Bytes::from_static(payload),
        sequence,
        Reliability::BestEffort,
    )
}

/// Polls until `cond` holds, failing the test after five seconds.
async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn dispatcher_delivers_in_order() {
    let dispatcher = Dispatcher::new(16);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _entry = dispatcher.add(
        "news",
        Arc::new(move |message: Message| {
            sink.lock().unwrap().push(message.sequence);
        }),
    );

    for sequence in 1..=5 {
        assert_eq!(
            dispatcher.route(&msg("news", sequence, b"x")),
            RouteOutcome::Delivered
        );
    }

    wait_until(|| seen.lock().unwrap().len() == 5).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn dispatcher_ignores_duplicate_sequences() {
    let dispatcher = Dispatcher::new(16);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _entry = dispatcher.add(
        "news",
        Arc::new(move |message: Message| {
            sink.lock().unwrap().push(message.sequence);
        }),
    );

    dispatcher.route(&msg("news", 1, b"x"));
    dispatcher.route(&msg("news", 2, b"x"));
    // A retry duplicate counts as delivered without another callback
    assert_eq!(dispatcher.route(&msg("news", 1, b"x")), RouteOutcome::Delivered);

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn dispatcher_survives_panicking_callback() {
    let dispatcher = Dispatcher::new(16);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _entry = dispatcher.add(
        "news",
        Arc::new(move |message: Message| {
            if message.sequence == 2 {
                panic!("boom");
            }
            sink.lock().unwrap().push(message.sequence);
        }),
    );

    for sequence in 1..=3 {
        dispatcher.route(&msg("news", sequence, b"x"));
    }

    // Message 2 panics inside the callback; 3 must still arrive, in order
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_overflow_drops_and_reports_partial() {
    let dispatcher = Dispatcher::new(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let enter = Arc::new(Barrier::new(2));
    let exit = Arc::new(Barrier::new(2));

    let sink = seen.clone();
    let handler_enter = enter.clone();
    let handler_exit = exit.clone();
    let _entry = dispatcher.add(
        "news",
        Arc::new(move |message: Message| {
            if message.sequence == 1 {
                handler_enter.wait();
                handler_exit.wait();
            }
            sink.lock().unwrap().push(message.sequence);
        }),
    );

    // Park the dispatch task inside message 1's callback
    assert_eq!(dispatcher.route(&msg("news", 1, b"x")), RouteOutcome::Delivered);
    enter.wait();

    // Queue capacity is 1: message 2 fits, message 3 is dropped
    assert_eq!(dispatcher.route(&msg("news", 2, b"x")), RouteOutcome::Delivered);
    assert_eq!(dispatcher.route(&msg("news", 3, b"x")), RouteOutcome::Partial);
    assert_eq!(dispatcher.dropped_count.load(Ordering::Relaxed), 1);

    exit.wait();
    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn removed_subscription_receives_nothing_further() {
    let dispatcher = Dispatcher::new(16);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let entry = dispatcher.add(
        "news",
        Arc::new(move |message: Message| {
            sink.lock().unwrap().push(message.sequence);
        }),
    );

    dispatcher.route(&msg("news", 1, b"x"));
    wait_until(|| seen.lock().unwrap().len() == 1).await;

    dispatcher.remove(&entry);
    entry.stop(Duration::from_secs(1)).await;

    assert_eq!(dispatcher.route(&msg("news", 2, b"x")), RouteOutcome::NoSubscribers);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dispatcher = Dispatcher::new(16);
    let entry = dispatcher.add("news", Arc::new(|_: Message| {}));

    entry.stop(Duration::from_secs(1)).await;
    entry.stop(Duration::from_secs(1)).await;
    entry.abort();
}

#[test]
fn registry_collapses_handles_per_topic() {
    let registry = Registry::default();

    assert!(registry.add_publisher("news"));
    assert!(!registry.add_publisher("news"));
    assert!(registry.has_publisher("news"));

    assert!(!registry.remove_publisher("news"));
    assert!(registry.remove_publisher("news"));
    assert!(!registry.has_publisher("news"));

    // Removing more than was added stays a no-op
    assert!(!registry.remove_publisher("news"));
}

#[test]
fn registry_tracks_roles_independently() {
    let registry = Registry::default();

    registry.add_publisher("news");
    registry.add_subscriber("news");
    registry.add_subscriber("sport");

    let mut rows = registry.wire_registrations();
    rows.sort_by(|a, b| a.topic.cmp(&b.topic));
    assert_eq!(rows.len(), 2);
    assert!(rows[0].publisher && rows[0].subscriber);
    assert!(!rows[1].publisher && rows[1].subscriber);

    assert!(registry.remove_subscriber("news"));
    assert!(registry.has_publisher("news"));

    let drained = registry.drain();
    assert_eq!(drained.len(), 2);
    assert!(registry.wire_registrations().is_empty());
}

#[test]
fn publish_receipt_completeness() {
    assert!(PublishReceipt::Sent.complete());
    assert!(PublishReceipt::Acknowledged { delivered: 3, failed: 0 }.complete());
    assert!(!PublishReceipt::Acknowledged { delivered: 2, failed: 1 }.complete());
}
