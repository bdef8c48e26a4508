//! Delivery invariants of the topic processor.

use parking_lot::Mutex;
use proptest::prelude::*;
use ringtopic::{
    BoxError, Message, MessageChannel, MessageHandler, ProcessorConfig, ProcessorState, ShutdownMode,
    SubscribableChannel, Subscriber, TopicChannel, TopicProcessor, WaitStrategyKind,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn collect_into(topic: &TopicProcessor<u64>) -> Arc<Mutex<Vec<u64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    topic.subscribe(move |item: &u64| sink.lock().push(*item)).unwrap();
    seen
}

#[test]
fn test_every_subscriber_sees_every_item_once() {
    let topic = TopicProcessor::<u64>::create("exactly-once", 64, WaitStrategyKind::Blocking).unwrap();
    let sinks: Vec<_> = (0..3).map(|_| collect_into(&topic)).collect();

    for i in 0..10_000 {
        topic.on_next(i).unwrap();
    }
    topic.on_complete().unwrap();
    assert!(topic.await_termination(Duration::from_secs(10)));

    let expected: Vec<u64> = (0..10_000).collect();
    for sink in sinks {
        assert_eq!(*sink.lock(), expected);
    }
    assert_eq!(topic.metrics().consumed, 30_000);
}

#[test]
fn test_late_subscriber_does_not_replay() {
    let topic = TopicProcessor::<u64>::create("late", 64, WaitStrategyKind::Blocking).unwrap();
    let early = collect_into(&topic);
    for i in 0..100 {
        topic.on_next(i).unwrap();
    }

    let late = collect_into(&topic);
    for i in 100..200 {
        topic.on_next(i).unwrap();
    }
    topic.on_complete().unwrap();
    assert!(topic.await_termination(Duration::from_secs(10)));

    assert_eq!(*early.lock(), (0..200).collect::<Vec<_>>());
    assert_eq!(*late.lock(), (100..200).collect::<Vec<_>>());
}

#[test]
fn test_cancel_allows_at_most_one_more_item() {
    let topic = TopicProcessor::<u64>::create("cancel", 64, WaitStrategyKind::Blocking).unwrap();
    let handled = Arc::new(AtomicUsize::new(0));
    let (entered_tx, entered_rx) = crossbeam::channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
    let subscription = {
        let handled = handled.clone();
        topic
            .subscribe(move |_: &u64| {
                handled.fetch_add(1, Ordering::SeqCst);
                let _ = entered_tx.try_send(());
                let _ = release_rx.recv();
            })
            .unwrap()
    };

    for i in 0..20 {
        topic.on_next(i).unwrap();
    }
    // The handler is now inside item 0
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(subscription.cancel());
    assert!(!subscription.cancel());
    let at_cancel = handled.load(Ordering::SeqCst);
    drop(release_tx);

    assert!(wait_until(Duration::from_secs(5), || topic.subscriber_count() == 0));
    assert!(handled.load(Ordering::SeqCst) <= at_cancel + 1);
    assert_eq!(subscription.cursor(), 0);
}

#[test]
fn test_drain_shutdown_delivers_everything_published_before() {
    let topic = TopicProcessor::<u64>::create("drain", 256, WaitStrategyKind::Yielding).unwrap();
    let slow = {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        topic
            .subscribe(move |item: &u64| {
                thread::sleep(Duration::from_micros(100));
                sink.lock().push(*item);
            })
            .unwrap();
        seen
    };
    let fast = collect_into(&topic);

    for i in 0..200 {
        topic.on_next(i).unwrap();
    }
    topic.shutdown(ShutdownMode::Drain);
    assert!(topic.on_next(200).is_err());
    assert!(topic.await_termination(Duration::from_secs(10)));
    assert_eq!(topic.state(), ProcessorState::Terminated);

    let expected: Vec<u64> = (0..200).collect();
    assert_eq!(*slow.lock(), expected);
    assert_eq!(*fast.lock(), expected);
}

#[test]
fn test_backlog_bounded_by_capacity() {
    let topic = Arc::new(TopicProcessor::<u64>::create("bounded", 8, WaitStrategyKind::Blocking).unwrap());
    let max_backlog = Arc::new(AtomicU64::new(0));
    {
        let topic_ref = Arc::downgrade(&topic);
        let max_backlog = max_backlog.clone();
        topic
            .subscribe(move |_: &u64| {
                if let Some(topic) = topic_ref.upgrade() {
                    max_backlog.fetch_max(topic.backlog(), Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    for i in 0..1000 {
        topic.on_next(i).unwrap();
        max_backlog.fetch_max(topic.backlog(), Ordering::SeqCst);
    }
    topic.on_complete().unwrap();
    assert!(topic.await_termination(Duration::from_secs(10)));
    assert!(max_backlog.load(Ordering::SeqCst) <= topic.capacity() as u64);
}

#[test]
fn test_channel_payload_round_trip() {
    let channel = TopicChannel::<Vec<u8>>::new().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: Arc<dyn MessageHandler<Vec<u8>>> = Arc::new(move |message: &Message<Vec<u8>>| {
        sink.lock().push((message.headers().get("n").map(str::to_owned), message.payload().clone()));
    });
    channel.subscribe(handler).unwrap();

    let payloads: Vec<Vec<u8>> = (0..50u8).map(|n| (0..=n).map(|b| b.wrapping_mul(31)).collect()).collect();
    for (n, payload) in payloads.iter().enumerate() {
        let message = Message::new(payload.clone()).with_header("n", n.to_string());
        assert!(channel.send_timeout(message, Duration::from_secs(1)).unwrap());
    }

    assert!(wait_until(Duration::from_secs(5), || received.lock().len() == payloads.len()));
    for (n, (header, payload)) in received.lock().iter().enumerate() {
        assert_eq!(header.as_deref(), Some(n.to_string().as_str()));
        assert_eq!(payload, &payloads[n]);
    }
}

#[test]
fn test_config_file_builds_processor() {
    let config = ProcessorConfig::from_toml_str(
        r#"
        name = "from-toml"
        backlog = 100
        shared = true
        wait_strategy = "phased"
        "#,
    )
    .unwrap();
    let topic = TopicProcessor::<u64>::with_config(&config).unwrap();
    assert_eq!(topic.name(), "from-toml");
    assert_eq!(topic.capacity(), 128);
    assert_eq!(topic.producer_mode(), ringtopic::ProducerMode::Multi);
}

#[derive(Default, Clone)]
struct Recording {
    items: Arc<Mutex<Vec<u64>>>,
    error: Arc<Mutex<Option<String>>>,
    completed: Arc<AtomicBool>,
}

impl Subscriber<u64> for Recording {
    fn on_next(&mut self, item: &u64) -> Result<(), BoxError> {
        self.items.lock().push(*item);
        Ok(())
    }

    fn on_error(&mut self, error: &(dyn std::error::Error + Send + Sync + 'static)) {
        *self.error.lock() = Some(error.to_string());
    }

    fn on_complete(&mut self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_terminal_error_reaches_every_subscriber() {
    let topic = TopicProcessor::<u64>::create("feed", 16, WaitStrategyKind::Blocking).unwrap();
    let recordings: Vec<Recording> = (0..2).map(|_| Recording::default()).collect();
    for recording in &recordings {
        topic.subscribe(recording.clone()).unwrap();
    }

    for i in 0..10 {
        topic.on_next(i).unwrap();
    }
    topic.on_error("feed lost").unwrap();
    assert!(matches!(topic.state(), ProcessorState::Draining | ProcessorState::Terminated));
    assert!(topic.on_next(10).is_err());
    assert!(topic.on_error("again").is_err());

    assert!(topic.await_termination(Duration::from_secs(5)));
    assert_eq!(topic.state(), ProcessorState::Terminated);
    assert_eq!(topic.subscriber_count(), 0);
    for recording in &recordings {
        assert_eq!(*recording.items.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(recording.error.lock().as_deref(), Some("feed lost"));
        assert!(!recording.completed.load(Ordering::SeqCst));
    }
}

#[test]
fn test_subscribe_while_shared_topic_is_publishing() {
    const PRODUCERS: usize = 4;
    let topic = Arc::new(TopicProcessor::<Box<(usize, u64)>>::share("busy", 64, WaitStrategyKind::Yielding).unwrap());
    topic.start().unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    // No consumer yet: producers only gate on each other
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let topic = topic.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut sent = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    topic.on_next(Box::new((producer, sent))).unwrap();
                    sent += 1;
                }
                sent
            })
        })
        .collect();
    assert!(wait_until(Duration::from_secs(5), || topic.metrics().published > 10_000));

    let seen = Arc::new(Mutex::new(vec![Vec::new(); PRODUCERS]));
    {
        let seen = seen.clone();
        topic
            .subscribe(move |item: &Box<(usize, u64)>| seen.lock()[item.0].push(item.1))
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        seen.lock().iter().map(Vec::len).sum::<usize>() > 10_000
    }));

    stop.store(true, Ordering::Relaxed);
    let sent: Vec<u64> = producers.into_iter().map(|p| p.join().unwrap()).collect();
    topic.on_complete().unwrap();
    assert!(topic.await_termination(Duration::from_secs(10)));

    // Per producer: an unbroken run up to its last item
    for (producer, values) in seen.lock().iter().enumerate() {
        let Some(&first) = values.first() else { continue };
        assert_eq!(*values, (first..sent[producer]).collect::<Vec<_>>(), "producer {producer}");
    }
}

#[test]
fn test_channel_senders_before_any_subscriber() {
    let channel = Arc::new(TopicChannel::<String>::with_config(&ProcessorConfig::new("early", 16).with_shared(true)).unwrap());
    let senders: Vec<_> = (0..4)
        .map(|sender| {
            let channel = channel.clone();
            thread::spawn(move || {
                for i in 0..5_000 {
                    assert!(channel.send_payload(format!("{sender}-{i}")).unwrap());
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }
    assert_eq!(channel.processor().metrics().published, 20_000);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: Arc<dyn MessageHandler<String>> = Arc::new(move |message: &Message<String>| {
        sink.lock().push(message.payload().clone());
    });
    channel.subscribe(handler).unwrap();
    assert!(channel.send_payload("after".to_string()).unwrap());
    assert!(wait_until(Duration::from_secs(5), || !received.lock().is_empty()));
    assert_eq!(*received.lock(), vec!["after".to_string()]);
}

#[test]
fn test_channel_send_timeout_reports_full_ring() {
    let channel = TopicChannel::<u32>::with_config(&ProcessorConfig::new("tiny", 2).with_shared(true)).unwrap();
    let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
    let handler: Arc<dyn MessageHandler<u32>> = Arc::new(move |_: &Message<u32>| {
        let _ = release_rx.recv();
    });
    channel.subscribe(handler).unwrap();

    assert!(channel.send_timeout(Message::new(0), Duration::from_secs(1)).unwrap());
    assert!(channel.send_timeout(Message::new(1), Duration::from_secs(1)).unwrap());
    assert!(!channel.send_timeout(Message::new(2), Duration::from_millis(20)).unwrap());
    assert!(channel.processor().metrics().backpressure_events >= 1);

    drop(release_tx);
    assert!(channel.send_timeout(Message::new(3), Duration::from_secs(5)).unwrap());
    assert!(wait_until(Duration::from_secs(5), || channel.processor().metrics().consumed == 3));
}

/// Every item whose `on_next` returned `Ok` is delivered, even when the
/// topic closes while producers are mid-publication.
fn assert_acknowledged_items_delivered(close: impl FnOnce(&TopicProcessor<u64>)) {
    let topic = Arc::new(TopicProcessor::<u64>::share("closing", 64, WaitStrategyKind::Yielding).unwrap());
    let received = Arc::new(AtomicU64::new(0));
    {
        let received = received.clone();
        topic
            .subscribe(move |_: &u64| {
                received.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let topic = topic.clone();
            thread::spawn(move || {
                let mut acknowledged = 0u64;
                while topic.on_next(acknowledged).is_ok() {
                    acknowledged += 1;
                }
                acknowledged
            })
        })
        .collect();
    assert!(wait_until(Duration::from_secs(5), || topic.metrics().published > 5_000));

    close(&topic);
    let acknowledged: u64 = producers.into_iter().map(|p| p.join().unwrap()).sum();
    assert!(topic.await_termination(Duration::from_secs(10)));
    assert_eq!(received.load(Ordering::SeqCst), acknowledged);
    assert_eq!(topic.metrics().published, acknowledged);
}

#[test]
fn test_complete_during_publication_delivers_acknowledged_items() {
    assert_acknowledged_items_delivered(|topic| topic.on_complete().unwrap());
}

#[test]
fn test_drain_during_publication_delivers_acknowledged_items() {
    assert_acknowledged_items_delivered(|topic| topic.shutdown(ShutdownMode::Drain));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_observation_order_matches_publication(
        items in proptest::collection::vec(any::<u64>(), 0..300),
        backlog in 2usize..64,
    ) {
        let topic = TopicProcessor::<u64>::create("prop", backlog, WaitStrategyKind::Yielding).unwrap();
        let seen = collect_into(&topic);
        for item in &items {
            topic.on_next(*item).unwrap();
        }
        topic.on_complete().unwrap();
        prop_assert!(topic.await_termination(Duration::from_secs(10)));
        prop_assert_eq!(&*seen.lock(), &items);
    }
}
