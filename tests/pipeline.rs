//! End-to-end behavior for the seed scenarios: happy path, out-of-order
//! publication, an LSN regression during registration, retriable-then-
//! success publishing, a non-retriable per-record drop, and the
//! duplicate window a leader failover can replay.
//!
//! Scenarios that only exercise the ack tracker's bookkeeping are plain
//! `#[test]`s; the ones that need batching/retry/backoff run the real
//! [`Publisher`] against a [`FakeSink`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use wal_relay::ack_tracker::AckTracker;
use wal_relay::lsn::Lsn;
use wal_relay::publisher::Publisher;
use wal_relay::queue::{InflightQueue, QueuedEvent};
use wal_relay::settings::{
    BatchSettings, IntervalSettings, PostgresSettings, QueueSettings, RetrySettings, SecretString,
    Settings,
};
use wal_relay::sink::fake::{FakeSink, Programmed};
use wal_relay::sink::{PutOutcome, Sink};

fn test_settings(max_records: usize, max_linger_ms: u64, max_attempts: u32) -> Settings {
    Settings {
        postgres: PostgresSettings {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: SecretString::for_test(""),
            dbname: "postgres".into(),
            replication_slot: "relay_slot".into(),
            leader_lock_key_override: None,
        },
        aws_region: "us-east-1".into(),
        kinesis_stream: "events".into(),
        batch: BatchSettings {
            max_records,
            max_bytes: 10_000_000,
            max_linger: Duration::from_millis(max_linger_ms),
        },
        queue: QueueSettings {
            max_count: 1000,
            max_bytes: 10_000_000,
        },
        retry: RetrySettings {
            max_attempts,
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            multiplier: 2.0,
        },
        intervals: IntervalSettings {
            feedback: Duration::from_millis(100),
            watchdog: Duration::from_millis(100),
            leader_acquire: Duration::from_millis(100),
        },
        log_level: "info".into(),
        log_format: wal_relay::logging::LogFormat::Plain,
        metrics_listen_addr: "127.0.0.1:0".into(),
    }
}

fn event(ack_id: u64, lsn: u64) -> QueuedEvent {
    QueuedEvent {
        ack_id,
        lsn: Lsn(lsn),
        partition_key: lsn.to_string(),
        payload: Bytes::from_static(b"{}"),
    }
}

#[tokio::test]
async fn happy_path_publishes_in_order_with_no_drops() {
    let ack_tracker = Arc::new(Mutex::new(AckTracker::new(Lsn(90))));
    let queue = Arc::new(InflightQueue::new(20, 1_000_000));

    for lsn in (100..=190).step_by(10) {
        let ack_id = ack_tracker.lock().register(Lsn(lsn));
        queue.put(event(ack_id, lsn)).await;
    }

    let sink = Arc::new(FakeSink::new());
    let (frontier_tx, mut frontier_rx) = watch::channel(Lsn::INVALID);
    let settings = test_settings(20, 20, 5);
    let publisher = Publisher::new(
        queue.clone(),
        ack_tracker.clone(),
        sink.clone() as Arc<dyn Sink>,
        &settings,
        frontier_tx,
    );

    let cancel = CancellationToken::new();
    let publisher_task = tokio::spawn(publisher.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    publisher_task.await.unwrap().unwrap();

    frontier_rx.changed().await.ok();
    assert_eq!(*frontier_rx.borrow(), Lsn(190));
    assert_eq!(sink.received.lock().len(), 1, "all 10 events fit in one batch");
    assert_eq!(sink.received.lock()[0].len(), 10);
    assert_eq!(ack_tracker.lock().outstanding(), 0);
    assert_eq!(queue.inflight_count(), 0);
}

/// The frontier only ever advances over a *contiguous* acked prefix
/// (§4.3), so acking strictly in registration order must pass through
/// every intermediate LSN, never skipping ahead.
#[test]
fn frontier_advances_through_every_value_when_acked_in_order() {
    let mut tracker = AckTracker::new(Lsn(90));
    let mut ack_ids = Vec::new();
    for lsn in (100..=190).step_by(10) {
        ack_ids.push(tracker.register(Lsn(lsn)));
    }

    for (ack_id, lsn) in ack_ids.into_iter().zip((100..=190).step_by(10)) {
        tracker.mark_published_by_id(ack_id);
        assert_eq!(tracker.frontier_lsn(), Lsn(lsn));
    }
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn out_of_order_publication_advances_contiguous_frontier() {
    let mut tracker = AckTracker::new(Lsn(90));
    let a = tracker.register(Lsn(100));
    let b = tracker.register(Lsn(110));
    let c = tracker.register(Lsn(120));

    assert_eq!(tracker.frontier_lsn(), Lsn(90));
    tracker.mark_published_by_id(c);
    assert_eq!(tracker.frontier_lsn(), Lsn(90));
    tracker.mark_published_by_id(a);
    assert_eq!(tracker.frontier_lsn(), Lsn(100));
    tracker.mark_published_by_id(b);
    assert_eq!(tracker.frontier_lsn(), Lsn(120));
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn lsn_regression_during_registration_does_not_corrupt_frontier() {
    let mut tracker = AckTracker::new(Lsn(0));
    let a = tracker.register(Lsn(200));
    let b = tracker.register(Lsn(150));
    let c = tracker.register(Lsn(210));

    tracker.mark_published_by_id(a);
    tracker.mark_published_by_id(b);
    tracker.mark_published_by_id(c);

    assert_eq!(tracker.frontier_lsn(), Lsn(210));
}

#[tokio::test]
async fn retriable_failure_is_retried_then_succeeds() {
    let ack_tracker = Arc::new(Mutex::new(AckTracker::new(Lsn(0))));
    let queue = Arc::new(InflightQueue::new(20, 1_000_000));

    for (i, lsn) in (10..=50).step_by(10).enumerate() {
        let ack_id = ack_tracker.lock().register(Lsn(lsn));
        assert_eq!(ack_id, (i + 1) as u64);
        queue.put(event(ack_id, lsn)).await;
    }

    let sink = Arc::new(FakeSink::new());
    sink.program(Programmed::CallFails("request throttled, please retry".into()));
    sink.program(Programmed::CallFails("service unavailable, try again".into()));

    let drops_before = wal_relay::metrics::EVENTS_DROPPED_TOTAL
        .with_label_values(&["retry_exhausted"])
        .get();
    let retries_before = wal_relay::metrics::RETRY_ATTEMPTS_TOTAL.get();

    let (frontier_tx, _frontier_rx) = watch::channel(Lsn::INVALID);
    let settings = test_settings(5, 200, 5);
    let publisher = Publisher::new(
        queue.clone(),
        ack_tracker.clone(),
        sink.clone() as Arc<dyn Sink>,
        &settings,
        frontier_tx,
    );

    let cancel = CancellationToken::new();
    let publisher_task = tokio::spawn(publisher.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(250)).await;
    cancel.cancel();
    publisher_task.await.unwrap().unwrap();

    assert_eq!(sink.received.lock().len(), 3, "two failed attempts plus one success");
    for call in sink.received.lock().iter() {
        assert_eq!(call.len(), 5, "the full batch is retried together");
    }
    assert_eq!(ack_tracker.lock().outstanding(), 0);
    assert_eq!(ack_tracker.lock().frontier_lsn(), Lsn(50));
    assert_eq!(
        wal_relay::metrics::EVENTS_DROPPED_TOTAL
            .with_label_values(&["retry_exhausted"])
            .get(),
        drops_before,
        "no drops expected once the retry succeeds"
    );
    assert_eq!(
        wal_relay::metrics::RETRY_ATTEMPTS_TOTAL.get() - retries_before,
        2
    );
}

#[tokio::test]
async fn non_retriable_record_is_dropped_but_frontier_still_advances() {
    let ack_tracker = Arc::new(Mutex::new(AckTracker::new(Lsn(0))));
    let queue = Arc::new(InflightQueue::new(20, 1_000_000));

    let a = ack_tracker.lock().register(Lsn(10));
    let b = ack_tracker.lock().register(Lsn(20));
    let c = ack_tracker.lock().register(Lsn(30));
    queue.put(event(a, 10)).await;
    queue.put(event(b, 20)).await;
    queue.put(event(c, 30)).await;

    let sink = Arc::new(FakeSink::new());
    sink.program(Programmed::PerRecord(vec![
        PutOutcome::Success,
        PutOutcome::Failed {
            error_code: Some("ValidationException".into()),
            message: "bad partition key".into(),
        },
        PutOutcome::Success,
    ]));

    let drops_before = wal_relay::metrics::EVENTS_DROPPED_TOTAL
        .with_label_values(&["non_retriable_record_error"])
        .get();

    let (frontier_tx, _frontier_rx) = watch::channel(Lsn::INVALID);
    let settings = test_settings(3, 50, 5);
    let publisher = Publisher::new(
        queue.clone(),
        ack_tracker.clone(),
        sink.clone() as Arc<dyn Sink>,
        &settings,
        frontier_tx,
    );

    let cancel = CancellationToken::new();
    let publisher_task = tokio::spawn(publisher.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    publisher_task.await.unwrap().unwrap();

    assert_eq!(sink.received.lock().len(), 1);
    assert_eq!(ack_tracker.lock().outstanding(), 0);
    assert_eq!(
        ack_tracker.lock().frontier_lsn(),
        Lsn(30),
        "the dropped record is still marked published so the frontier can pass it"
    );
    assert_eq!(queue.inflight_count(), 0);
    assert_eq!(
        wal_relay::metrics::EVENTS_DROPPED_TOTAL
            .with_label_values(&["non_retriable_record_error"])
            .get()
            - drops_before,
        1
    );
}

#[test]
fn leader_failover_duplicate_window_does_not_lose_data() {
    // Generation 1 reads up to lsn 300 but only confirms lsn 200 before
    // losing leadership; lsn 300 is published but never acked.
    let mut gen1 = AckTracker::new(Lsn(100));
    let a = gen1.register(Lsn(200));
    let _b = gen1.register(Lsn(300));
    gen1.mark_published_by_id(a);
    assert_eq!(gen1.frontier_lsn(), Lsn(200));

    // The new leader resumes from the recovered checkpoint, re-reading the
    // duplicate window (200, 300) plus new WAL at 400.
    let mut gen2 = AckTracker::new(gen1.frontier_lsn());
    let a2 = gen2.register(Lsn(200));
    let b2 = gen2.register(Lsn(300));
    let c2 = gen2.register(Lsn(400));
    gen2.mark_published_by_id(a2);
    gen2.mark_published_by_id(b2);
    gen2.mark_published_by_id(c2);

    assert_eq!(gen2.frontier_lsn(), Lsn(400));
    assert_eq!(gen2.outstanding(), 0);
}
