//! Batches -> sink, with per-record retry/drop and frontier emission (§4.5).
//!
//! The retry/backoff shape mirrors `backoff::retry`'s attempt-count loop
//! used throughout this codebase family for transient AWS/Postgres calls;
//! the per-record success/failure split is the same "one service call,
//! many independent outcomes" pattern `proxy`'s connection pooling uses
//! when pooling across backends that can each fail independently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::ack_tracker::AckTracker;
use crate::batcher::{Batch, MicroBatcher};
use crate::classify::{classify, Classification};
use crate::lsn::Lsn;
use crate::queue::{InflightQueue, QueuedEvent};
use crate::settings::{RetrySettings, Settings};
use crate::sink::{PutOutcome, PutRecord, Sink};

pub struct Publisher {
    queue: Arc<InflightQueue>,
    ack_tracker: Arc<parking_lot::Mutex<AckTracker>>,
    sink: Arc<dyn Sink>,
    batcher: MicroBatcher,
    retry: RetrySettings,
    sink_timeout: Duration,
    frontier_tx: watch::Sender<Lsn>,
}

impl Publisher {
    pub fn new(
        queue: Arc<InflightQueue>,
        ack_tracker: Arc<parking_lot::Mutex<AckTracker>>,
        sink: Arc<dyn Sink>,
        settings: &Settings,
        frontier_tx: watch::Sender<Lsn>,
    ) -> Self {
        let batcher = MicroBatcher::new(
            queue.clone(),
            settings.batch.max_records,
            settings.batch.max_bytes,
            settings.batch.max_linger,
        );
        Publisher {
            queue,
            ack_tracker,
            sink,
            batcher,
            retry: settings.retry.clone(),
            sink_timeout: settings.batch.max_linger.max(Duration::from_secs(5)),
            frontier_tx,
        }
    }

    /// Drain batches forever, publishing each one to completion (either
    /// fully acked or fully dropped) before moving to the next. Returns
    /// only on an unrecoverable error or cancellation.
    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("publisher cancelled");
                    return Ok(());
                }
                batch = self.batcher.next_batch() => batch,
            };
            self.publish_batch(batch).await;
            self.emit_frontier();
        }
    }

    /// Drive one batch through the state machine in §4.5 to a terminal
    /// outcome (ALL_OK or DROP), retrying retriable failures with backoff
    /// and shrinking the pending set to just the retriable remainder on
    /// each attempt.
    async fn publish_batch(&self, batch: Batch) {
        let mut pending = batch.events;
        let mut attempt = 0u32;

        while !pending.is_empty() {
            attempt += 1;
            let records: Vec<PutRecord> = pending
                .iter()
                .map(|e| PutRecord {
                    ack_id: e.ack_id,
                    partition_key: e.partition_key.clone(),
                    payload: e.payload.clone(),
                })
                .collect();

            let call = timeout(self.sink_timeout, self.sink.put_records(records));

            match call.await {
                Err(_elapsed) => {
                    self.handle_stream_failure(&mut pending, attempt, None, "sink call timed out")
                        .await;
                }
                Ok(Err(err)) => {
                    self.handle_stream_failure(&mut pending, attempt, None, &err.to_string())
                        .await;
                }
                Ok(Ok(outcomes)) => {
                    if outcomes.len() != pending.len() {
                        warn!(
                            expected = pending.len(),
                            got = outcomes.len(),
                            "sink returned a mismatched outcome count, treating as a stream failure"
                        );
                        self.handle_stream_failure(
                            &mut pending,
                            attempt,
                            None,
                            "outcome count did not match record count",
                        )
                        .await;
                        continue;
                    }
                    self.handle_per_record_outcomes(&mut pending, outcomes);
                }
            }

            if attempt >= self.retry.max_attempts && !pending.is_empty() {
                self.drop_all(&pending, "retry_exhausted");
                pending.clear();
            }
        }
    }

    /// A whole-batch exception: classify and either retry the full pending
    /// set (with backoff) or drop it outright.
    async fn handle_stream_failure(
        &self,
        pending: &mut Vec<QueuedEvent>,
        attempt: u32,
        error_code: Option<&str>,
        message: &str,
    ) {
        match classify(error_code, message) {
            Classification::NonRetriable => {
                warn!(attempt, message, "non-retriable stream failure, dropping batch");
                self.drop_all(pending, "non_retriable_stream_error");
                pending.clear();
            }
            Classification::Retriable => {
                if attempt >= self.retry.max_attempts {
                    error!(attempt, message, "retries exhausted, dropping batch");
                    return;
                }
                let delay = crate::backoff::delay_for_attempt(&self.retry, attempt);
                warn!(attempt, message, delay_ms = delay.as_millis() as u64, "retriable stream failure, backing off");
                crate::metrics::RETRY_ATTEMPTS_TOTAL.inc();
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// A batch call that returned per-record outcomes: ack successes,
    /// drop non-retriable failures, and narrow `pending` to just the
    /// retriable remainder for the next attempt.
    fn handle_per_record_outcomes(&self, pending: &mut Vec<QueuedEvent>, outcomes: Vec<PutOutcome>) {
        let taken = std::mem::take(pending);
        let mut retriable = Vec::new();

        for (event, outcome) in taken.into_iter().zip(outcomes) {
            match outcome {
                PutOutcome::Success => self.ack_and_complete(&event),
                PutOutcome::Failed { error_code, message } => {
                    match classify(error_code.as_deref(), &message) {
                        Classification::Retriable => retriable.push(event),
                        Classification::NonRetriable => {
                            warn!(ack_id = event.ack_id, error_code = ?error_code, message, "dropping record, non-retriable");
                            self.drop_one(&event, "non_retriable_record_error");
                        }
                    }
                }
            }
        }

        *pending = retriable;
    }

    fn drop_all(&self, events: &[QueuedEvent], reason: &'static str) {
        for event in events {
            self.drop_one(event, reason);
        }
    }

    /// Drop policy (§4.5, §9): mark published anyway so the frontier can
    /// still advance past a poison event, then release the queue slot.
    /// This is the liveness/durability tradeoff the core is built around.
    fn drop_one(&self, event: &QueuedEvent, reason: &'static str) {
        crate::metrics::EVENTS_DROPPED_TOTAL
            .with_label_values(&[reason])
            .inc();
        warn!(ack_id = event.ack_id, %event.lsn, reason, "dropped event");
        self.ack_tracker.lock().mark_published_by_id(event.ack_id);
        self.queue.task_done(event);
    }

    fn ack_and_complete(&self, event: &QueuedEvent) {
        self.ack_tracker.lock().mark_published_by_id(event.ack_id);
        crate::metrics::EVENTS_PUBLISHED_TOTAL.inc();
        self.queue.task_done(event);
    }

    /// After every batch completion (including a full drop), push the new
    /// frontier if it advanced (§4.5). The channel is a `watch`, so a
    /// reader that is busy handling other messages simply sees the latest
    /// value next time it checks -- coalescing is built in.
    fn emit_frontier(&self) {
        let frontier = self.ack_tracker.lock().frontier_lsn();
        self.frontier_tx.send_if_modified(|current| {
            if frontier > *current {
                *current = frontier;
                true
            } else {
                false
            }
        });
    }
}
