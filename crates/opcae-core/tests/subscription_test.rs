#![allow(clippy::unwrap_used)]
// Integration tests for `Subscription` against the in-process fake server.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use opcae_api::Hresult;
use opcae_api::fake::{FakeCondition, FakeEvent, FakeEventServer, MAX_BATCH_SIZE, MIN_BUFFER_TIME_MS};
use pretty_assertions::assert_eq;

use opcae_core::{
    Backpressure, ChangeKind, CoreError, DecodeError, EventServer, EventType, RecvError, StateUpdate,
    SubscriptionConfig, SubscriptionFilter, SubscriptionPhase, Variant,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Sink and refresh threads log through `tracing`; `RUST_LOG=opcae_core=trace`
/// shows them interleaved with the test's own output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (FakeEventServer, EventServer) {
    init_tracing();
    let fake = FakeEventServer::new();
    let server = EventServer::new(fake.server_ptr(), fake.allocator_handle());
    (fake, server)
}

fn config(queue_capacity: usize, backpressure: Backpressure) -> SubscriptionConfig {
    SubscriptionConfig {
        queue_capacity,
        backpressure,
        ..SubscriptionConfig::default()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
}

fn sources(batch: &opcae_core::EventBatch) -> Vec<&str> {
    batch.records().iter().map(|r| r.source.as_str()).collect()
}

// ── Creation and state ──────────────────────────────────────────────

#[test]
fn test_create_assigns_handles_and_advises() {
    let (fake, server) = setup();
    let cfg = SubscriptionConfig {
        buffer_time_ms: 10,
        max_size: 50_000,
        ..SubscriptionConfig::default()
    };

    let (first, revised) = server.create_subscription(&cfg).unwrap();
    assert_eq!(revised.buffer_time_ms, MIN_BUFFER_TIME_MS);
    assert_eq!(revised.max_size, MAX_BATCH_SIZE);
    assert_eq!(first.phase(), SubscriptionPhase::Registered);

    let (second, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    assert_eq!((first.handle(), second.handle()), (1, 2));
    assert_eq!(fake.advised_sinks(), 2);
    assert_eq!(server.subscription_count(), 2);

    let state = second.state().unwrap();
    assert_eq!(state.client_handle, 2);
    assert!(state.active);
}

#[test]
fn test_state_setters_change_one_field_each() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();

    assert_eq!(sub.set_buffer_time(5).unwrap(), MIN_BUFFER_TIME_MS);
    assert_eq!(sub.set_max_size(20_000).unwrap(), MAX_BATCH_SIZE);
    sub.set_active(false).unwrap();

    let state = fake.subscription_state(sub.handle()).unwrap();
    assert!(!state.active);
    assert_eq!(state.buffer_time_ms, MIN_BUFFER_TIME_MS);
    assert_eq!(state.max_size, MAX_BATCH_SIZE);

    let revised = sub
        .set_state(StateUpdate {
            active: Some(true),
            ..StateUpdate::default()
        })
        .unwrap();
    assert_eq!(revised.buffer_time_ms, MIN_BUFFER_TIME_MS);
    assert!(sub.state().unwrap().active);
}

#[test]
fn test_inactive_subscription_gets_nothing() {
    let (fake, server) = setup();
    let (sub, _) = server
        .create_subscription(&SubscriptionConfig {
            active: false,
            ..SubscriptionConfig::default()
        })
        .unwrap();

    assert_eq!(fake.emit(&[FakeEvent::simple("Boiler", t0())]), 0);
    assert_eq!(sub.receiver().try_recv(), Err(RecvError::Empty));
}

#[test]
fn test_filter_is_server_authoritative() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();

    sub.set_filter(&SubscriptionFilter::default().with_severity(1, 1000)).unwrap();
    let held = sub.filter().unwrap();
    assert_eq!((held.low_severity, held.high_severity), (1, 1000));

    sub.set_filter(
        &SubscriptionFilter::default()
            .with_event_types(EventType::Condition)
            .with_severity(0, 4000)
            .with_sources(["Tank1"]),
    )
    .unwrap();
    let held = sub.filter().unwrap();
    assert_eq!((held.low_severity, held.high_severity), (1, 1000));
    assert_eq!(held.sources, vec!["Tank1".to_string()]);
    assert_eq!(held.event_types.types(), vec![EventType::Condition]);
    assert_eq!(fake.allocator().outstanding(), 0);

    let err = sub
        .set_filter(&SubscriptionFilter::default().with_severity(900, 100))
        .unwrap_err();
    assert!(matches!(err, CoreError::Protocol { .. }), "got {err:?}");
    assert_eq!(err.hresult(), Some(Hresult::E_INVALIDARG));
}

#[test]
fn test_returned_attributes_per_category() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();

    sub.select_returned_attributes(0x10, &[1, 2]).unwrap();
    sub.select_returned_attributes(0x20, &[7]).unwrap();
    assert_eq!(sub.returned_attributes(0x10).unwrap(), vec![1, 2]);
    assert_eq!(sub.returned_attributes(0x20).unwrap(), vec![7]);
    assert!(sub.returned_attributes(0x30).unwrap().is_empty());
    assert_eq!(fake.allocator().outstanding(), 0);
}

#[test]
fn test_transport_failure_is_not_a_protocol_error() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();

    fake.fail_next("SetFilter", Hresult::RPC_E_DISCONNECTED);
    let err = sub.set_filter(&SubscriptionFilter::default()).unwrap_err();
    assert!(err.is_transport(), "got {err:?}");
    // The failure was one-shot.
    sub.set_filter(&SubscriptionFilter::default()).unwrap();
}

#[test]
fn test_failed_advise_leaves_nothing_behind() {
    let (fake, server) = setup();
    fake.fail_next("Advise", Hresult::E_FAIL);

    let err = server
        .create_subscription(&SubscriptionConfig::default())
        .unwrap_err();
    assert_eq!(err.hresult(), Some(Hresult::E_FAIL));
    assert_eq!(fake.live_subscriptions(), 0);
    assert_eq!(server.subscription_count(), 0);
}

// ── Notifications ───────────────────────────────────────────────────

#[test]
fn test_events_arrive_decoded_and_in_order() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    let rx = sub.receiver();

    let events = [
        FakeEvent::simple("Boiler", t0()).message("pressure nominal").severity(100),
        FakeEvent::tracking("Valve7", "operator1", t0()).message("opened"),
        FakeEvent::condition("Tank1", "LevelAlarm", t0())
            .subcondition("HI")
            .severity(700)
            .cookie(42)
            .active_time(t0())
            .changes(&[ChangeKind::ActiveState, ChangeKind::Severity])
            .attribute(Variant::F64(97.5)),
    ];
    assert_eq!(fake.emit(&events), 1);

    let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(batch.client_handle(), sub.handle());
    assert!(!batch.is_refresh());
    assert_eq!(sources(&batch), vec!["Boiler", "Valve7", "Tank1"]);

    let alarm = &batch.records()[2];
    assert_eq!(alarm.event_type, EventType::Condition);
    assert_eq!(alarm.condition, "LevelAlarm");
    assert_eq!(alarm.subcondition, "HI");
    assert_eq!(alarm.cookie, 42);
    assert_eq!(alarm.active_time, Some(t0()));
    assert_eq!(alarm.time, t0());
    assert!(alarm.change_mask.contains(ChangeKind::ActiveState));
    assert!(alarm.change_mask.contains(ChangeKind::Severity));
    assert!(!alarm.change_mask.contains(ChangeKind::AckState));
    assert_eq!(alarm.attributes, vec![Variant::F64(97.5)]);
    assert_eq!(batch.records()[1].actor_id, "operator1");

    assert_eq!(fake.allocator().outstanding(), 0);
}

#[test]
fn test_max_size_splits_batches() {
    let (fake, server) = setup();
    let (sub, _) = server
        .create_subscription(&SubscriptionConfig {
            max_size: 2,
            ..SubscriptionConfig::default()
        })
        .unwrap();

    let events: Vec<FakeEvent> = (0..5).map(|i| FakeEvent::simple(format!("src{i}"), t0())).collect();
    assert_eq!(fake.emit(&events), 3);
    let lens: Vec<usize> = sub.receiver().drain().into_iter().map(|b| b.unwrap().len()).collect();
    assert_eq!(lens, vec![2, 2, 1]);
}

#[test]
fn test_undecodable_batch_is_reported_in_band() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    let rx = sub.receiver();

    fake.emit(&[FakeEvent::simple("before", t0())]);
    fake.emit(&[FakeEvent::simple("broken", t0()).corrupt_attribute()]);
    fake.emit(&[FakeEvent::simple("after", t0())]);

    assert_eq!(sources(&rx.try_recv().unwrap()), vec!["before"]);
    let err = rx.try_recv().unwrap_err();
    assert!(
        matches!(err, RecvError::Decode(DecodeError::Record { index: 0, .. })),
        "got {err:?}"
    );
    assert_eq!(sources(&rx.try_recv().unwrap()), vec!["after"]);
    assert_eq!(rx.stats().decode_failures, 1);
    assert_eq!(rx.stats().delivered, 2);

    assert_eq!(fake.allocator().outstanding(), 0);
    assert_eq!(fake.allocator().invalid_frees(), 0);
}

#[test]
fn test_concurrent_producers_lose_nothing_with_room() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    let (fake, server) = setup();
    let (sub, _) = server
        .create_subscription(&config(PRODUCERS * PER_PRODUCER, Backpressure::default()))
        .unwrap();
    let handle = sub.handle();
    let rx = sub.receiver();
    let fake = Arc::new(fake);

    let consumer = {
        let rx = rx.clone();
        thread::spawn(move || {
            let mut received = 0;
            while received < PRODUCERS * PER_PRODUCER {
                rx.recv_timeout(Duration::from_secs(10)).unwrap();
                received += 1;
            }
            received
        })
    };
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let fake = Arc::clone(&fake);
            thread::spawn(move || {
                for m in 0..PER_PRODUCER {
                    let event = FakeEvent::simple(format!("p{p}-{m}"), t0());
                    assert_eq!(fake.emit_to(handle, false, false, &[event]), 1);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(consumer.join().unwrap(), PRODUCERS * PER_PRODUCER);
    assert_eq!(rx.stats().dropped, 0);
    rx.ensure_lossless().unwrap();
    drop(sub);
    assert_eq!(fake.allocator().outstanding(), 0);
}

#[test]
fn test_concurrent_producers_under_drop_policies() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 20;
    const CAPACITY: usize = 8;

    for policy in [Backpressure::DropNewest, Backpressure::DropOldest] {
        let (fake, server) = setup();
        let (sub, _) = server.create_subscription(&config(CAPACITY, policy)).unwrap();
        let handle = sub.handle();
        let fake = Arc::new(fake);

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let fake = Arc::clone(&fake);
                thread::spawn(move || {
                    for m in 0..PER_PRODUCER {
                        fake.emit_to(handle, false, false, &[FakeEvent::simple(format!("p{p}-{m}"), t0())]);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let rx = sub.receiver();
        let stats = rx.stats();
        let total = u64::try_from(PRODUCERS * PER_PRODUCER).unwrap();
        let kept = u64::try_from(CAPACITY).unwrap();
        assert_eq!(stats.dropped, total - kept, "{policy}");
        assert_eq!(rx.drain().len(), CAPACITY, "{policy}");
        assert!(matches!(rx.ensure_lossless(), Err(CoreError::Capacity { .. })));
    }
}

#[test]
fn test_bounded_wait_with_a_slow_reader_is_lossless() {
    let (fake, server) = setup();
    let (sub, _) = server
        .create_subscription(&config(
            2,
            Backpressure::Wait {
                timeout: Duration::from_secs(10),
            },
        ))
        .unwrap();
    let handle = sub.handle();
    let rx = sub.receiver();
    let fake = Arc::new(fake);

    let producer = {
        let fake = Arc::clone(&fake);
        thread::spawn(move || {
            for m in 0..10 {
                fake.emit_to(handle, false, false, &[FakeEvent::simple(format!("e{m}"), t0())]);
            }
        })
    };
    let mut seen = Vec::new();
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(2));
        let batch = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        seen.push(batch.records()[0].source.clone());
    }
    producer.join().unwrap();

    let expected: Vec<String> = (0..10).map(|m| format!("e{m}")).collect();
    assert_eq!(seen, expected);
    rx.ensure_lossless().unwrap();
}

// ── Refresh ─────────────────────────────────────────────────────────

#[test]
fn test_refresh_replays_conditions_and_flags_the_last_batch() {
    let (fake, server) = setup();
    fake.add_condition(FakeCondition::new("Tank1", "LevelAlarm").cookie(1));
    fake.add_condition(FakeCondition::new("Tank2", "LevelAlarm").cookie(2));
    // Inactive and acknowledged: nothing to replay.
    fake.add_condition(FakeCondition::new("Tank3", "LevelAlarm").flags(0x0001).acked());
    let (sub, _) = server
        .create_subscription(&SubscriptionConfig {
            max_size: 1,
            ..SubscriptionConfig::default()
        })
        .unwrap();

    sub.refresh().unwrap();
    fake.wait_for_refreshes();

    let batches: Vec<_> = sub.receiver().drain().into_iter().map(Result::unwrap).collect();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.is_refresh()));
    assert_eq!(
        batches.iter().map(|b| b.is_last_refresh()).collect::<Vec<_>>(),
        vec![false, true]
    );
    assert_eq!(sources(&batches[0]), vec!["Tank1"]);
    assert_eq!(batches[1].records()[0].cookie, 2);
}

#[test]
fn test_refresh_with_nothing_active_sends_one_empty_last_batch() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();

    sub.refresh().unwrap();
    fake.wait_for_refreshes();

    let batch = sub.receiver().recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(batch.is_empty());
    assert!(batch.is_refresh() && batch.is_last_refresh());
}

#[test]
fn test_cancel_refresh_is_best_effort() {
    let (fake, server) = setup();
    for i in 0..5 {
        fake.add_condition(FakeCondition::new(format!("Tank{i}"), "LevelAlarm"));
    }
    fake.set_refresh_delay(Duration::from_millis(20));
    let (sub, _) = server
        .create_subscription(&SubscriptionConfig {
            max_size: 1,
            ..SubscriptionConfig::default()
        })
        .unwrap();

    sub.refresh().unwrap();
    // A second refresh while the first runs is refused.
    assert_eq!(sub.refresh().unwrap_err().hresult(), Some(Hresult::OPC_E_BUSY));
    // Either it stops the replay or the replay already finished.
    let cancelled = sub.cancel_refresh().is_ok();
    fake.wait_for_refreshes();

    let batches: Vec<_> = sub.receiver().drain().into_iter().map(Result::unwrap).collect();
    assert!(batches.len() <= 5);
    assert!(batches.iter().all(|b| b.is_refresh()));
    if !cancelled {
        assert_eq!(batches.len(), 5);
    }
    assert_eq!(fake.allocator().outstanding(), 0);
}

// ── Release ─────────────────────────────────────────────────────────

#[test]
fn test_release_without_any_notification() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    let rx = sub.receiver();

    sub.release().unwrap();
    assert_eq!(sub.phase(), SubscriptionPhase::Released);
    assert_eq!(fake.advised_sinks(), 0);
    assert_eq!(fake.live_subscriptions(), 0);
    assert_eq!(rx.try_recv(), Err(RecvError::Closed));
    assert_eq!(rx.recv(), Err(RecvError::Closed));

    // Idempotent, and everything else now refuses.
    sub.release().unwrap();
    assert!(matches!(sub.state(), Err(CoreError::Released { handle: 1 })));
    assert!(matches!(sub.refresh(), Err(CoreError::Released { .. })));
}

#[test]
fn test_release_unadvises_before_dropping_the_connection_point() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    sub.release().unwrap();

    assert_eq!(
        fake.call_log(),
        vec![
            "CreateEventSubscription 1",
            "Advise 1",
            "Unadvise 1",
            "Release connection point",
            "Release subscription 1",
        ]
    );
}

#[test]
fn test_release_keeps_already_queued_batches_readable() {
    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    let rx = sub.receiver();
    fake.emit(&[FakeEvent::simple("Boiler", t0())]);

    drop(sub);
    assert_eq!(fake.emit(&[FakeEvent::simple("late", t0())]), 0);
    assert_eq!(sources(&rx.try_recv().unwrap()), vec!["Boiler"]);
    assert_eq!(rx.try_recv(), Err(RecvError::Closed));
}

#[test]
fn test_release_while_refresh_in_flight() {
    let (fake, server) = setup();
    for i in 0..6 {
        fake.add_condition(FakeCondition::new(format!("Tank{i}"), "LevelAlarm"));
    }
    fake.set_refresh_delay(Duration::from_millis(50));
    let (sub, _) = server
        .create_subscription(&SubscriptionConfig {
            max_size: 1,
            ..SubscriptionConfig::default()
        })
        .unwrap();
    let rx = sub.receiver();

    sub.refresh().unwrap();
    thread::sleep(Duration::from_millis(20));
    sub.release().unwrap();
    fake.wait_for_refreshes();

    let drained = rx.drain();
    assert!(drained.len() < 6);
    assert!(drained.into_iter().all(|b| b.unwrap().is_refresh()));
    assert_eq!(rx.try_recv(), Err(RecvError::Closed));
    assert_eq!(fake.advised_sinks(), 0);
    assert_eq!(fake.allocator().outstanding(), 0);
}

#[test]
fn test_release_does_not_stall_on_a_blocked_sink() {
    let (fake, server) = setup();
    for i in 0..3 {
        fake.add_condition(FakeCondition::new(format!("Tank{i}"), "LevelAlarm"));
    }
    let (sub, _) = server
        .create_subscription(&SubscriptionConfig {
            max_size: 1,
            queue_capacity: 1,
            backpressure: Backpressure::Wait {
                timeout: Duration::from_secs(60),
            },
            ..SubscriptionConfig::default()
        })
        .unwrap();

    // Nobody reads: the replay's second batch waits for room.
    sub.refresh().unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    sub.release().unwrap();
    fake.wait_for_refreshes();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(sub.receiver().stats().dropped, 0);
}

// ── Async consumption ───────────────────────────────────────────────

#[tokio::test]
async fn test_async_receiver_and_stream() {
    use futures_util::StreamExt;

    let (fake, server) = setup();
    let (sub, _) = server.create_subscription(&SubscriptionConfig::default()).unwrap();
    let rx = sub.receiver();
    let fake = Arc::new(fake);

    let emitter = {
        let fake = Arc::clone(&fake);
        tokio::task::spawn_blocking(move || {
            fake.emit(&[FakeEvent::simple("a", t0())]);
            fake.emit(&[FakeEvent::simple("b", t0())]);
        })
    };
    let first = rx.recv_async().await.unwrap();
    assert_eq!(sources(&first), vec!["a"]);
    emitter.await.unwrap();

    sub.release().unwrap();
    let rest: Vec<_> = rx.into_stream().collect().await;
    assert_eq!(rest.len(), 1);
    assert_eq!(sources(rest[0].as_ref().unwrap()), vec!["b"]);
}
