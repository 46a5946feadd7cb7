//! Prometheus metrics, registered against the default process-wide registry.
//!
//! Follows the macro style `pageserver::metrics` uses over the `metrics`
//! wrapper crate; that wrapper's own source isn't part of the retrieved
//! sources this crate was built from, so these statics talk to `prometheus`
//! directly (see DESIGN.md).

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Gauge,
    IntCounter, IntCounterVec, IntGauge,
};

pub static EVENTS_REGISTERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_relay_events_registered_total",
        "Total WAL change events registered with the ack tracker"
    )
    .expect("failed to register wal_relay_events_registered_total")
});

pub static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_relay_events_published_total",
        "Total events successfully published to the sink"
    )
    .expect("failed to register wal_relay_events_published_total")
});

pub static EVENTS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "wal_relay_events_dropped_total",
        "Total events dropped by the publisher, by reason",
        &["reason"]
    )
    .expect("failed to register wal_relay_events_dropped_total")
});

pub static OVERSIZE_EVENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_relay_oversize_events_total",
        "Total events admitted to the queue despite exceeding max_bytes on their own"
    )
    .expect("failed to register wal_relay_oversize_events_total")
});

pub static FEEDBACK_LSN_CLAMPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_relay_feedback_lsn_clamped_total",
        "Total times a feedback LSN below the last sent value was clamped instead of sent"
    )
    .expect("failed to register wal_relay_feedback_lsn_clamped_total")
});

pub static RETRY_ATTEMPTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_relay_publish_retry_attempts_total",
        "Total publish retry attempts issued by the publisher"
    )
    .expect("failed to register wal_relay_publish_retry_attempts_total")
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "wal_relay_queue_depth",
        "Current number of events sitting in the inflight queue"
    )
    .expect("failed to register wal_relay_queue_depth")
});

pub static FRONTIER_LSN: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "wal_relay_frontier_lsn",
        "Current contiguous frontier LSN, as a float (may lose low bits past 2^53)"
    )
    .expect("failed to register wal_relay_frontier_lsn")
});

pub static LEADER_CYCLES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wal_relay_leader_cycles_total",
        "Total number of leader cycles entered"
    )
    .expect("failed to register wal_relay_leader_cycles_total")
});

/// Force registration of every metric above. Call once at startup so
/// `/metrics` is populated even before the first event flows through.
pub fn preinitialize() {
    Lazy::force(&EVENTS_REGISTERED_TOTAL);
    Lazy::force(&EVENTS_PUBLISHED_TOTAL);
    Lazy::force(&EVENTS_DROPPED_TOTAL);
    Lazy::force(&OVERSIZE_EVENTS_TOTAL);
    Lazy::force(&FEEDBACK_LSN_CLAMPED_TOTAL);
    Lazy::force(&RETRY_ATTEMPTS_TOTAL);
    Lazy::force(&QUEUE_DEPTH);
    Lazy::force(&FRONTIER_LSN);
    Lazy::force(&LEADER_CYCLES_TOTAL);
}
