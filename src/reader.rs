//! Owns the logical replication connection and drives it end to end (§4.6).
//!
//! Grounded on `walreceiver_connection::handle_walreceiver_connection`: the
//! same `IDENTIFY_SYSTEM` / `START_REPLICATION` / `copy_both_simple` dance,
//! the same `ReplicationMessage::{XLogData, PrimaryKeepAlive}` match, the
//! same "reply only when requested, else on a timer" feedback shape. The
//! differences are what this service does with each message: register with
//! the ack tracker and push onto the inflight queue instead of ingesting
//! into a timeline, and drive the feedback LSN off the publisher's frontier
//! channel instead of a locally computed disk-consistent LSN.

use std::pin::pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use futures::StreamExt;
use postgres_protocol::message::backend::ReplicationMessage;
use postgres_types::PgLsn;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_postgres::replication::ReplicationStream;
use tokio_postgres::{Client, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, info, trace, warn};

use crate::ack_tracker::AckTracker;
use crate::decode::WalEventDecoder;
use crate::lsn::Lsn;
use crate::queue::{InflightQueue, QueuedEvent};
use crate::settings::Settings;

/// Postgres epoch (2000-01-01) used by the replication protocol's
/// microsecond timestamps, matching `postgres_ffi::get_current_timestamp`.
const PG_EPOCH_UNIX_SECONDS: u64 = 946_684_800;

pub struct ReplicationReader {
    replication_client: Client,
    slot_name: String,
    queue: Arc<InflightQueue>,
    ack_tracker: Arc<parking_lot::Mutex<AckTracker>>,
    decoder: Box<dyn WalEventDecoder>,
    feedback_interval: std::time::Duration,
    queue_max_bytes: usize,
    frontier_rx: watch::Receiver<Lsn>,
    last_sent_lsn: Lsn,
}

impl ReplicationReader {
    pub fn new(
        replication_client: Client,
        queue: Arc<InflightQueue>,
        ack_tracker: Arc<parking_lot::Mutex<AckTracker>>,
        decoder: Box<dyn WalEventDecoder>,
        settings: &Settings,
        frontier_rx: watch::Receiver<Lsn>,
    ) -> Self {
        ReplicationReader {
            replication_client,
            slot_name: settings.postgres.replication_slot.clone(),
            queue,
            ack_tracker,
            decoder,
            feedback_interval: settings.intervals.feedback,
            queue_max_bytes: settings.queue.max_bytes,
            frontier_rx,
            last_sent_lsn: Lsn::INVALID,
        }
    }

    /// Run the replication loop until the connection ends, the stream
    /// errors, or `cancel` fires. Backpressure from `queue.put` naturally
    /// throttles how fast frames are consumed; no frame is ever dropped on
    /// this side (§4.6).
    pub async fn run(mut self, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let identify = identify_system(&mut self.replication_client).await?;
        info!(systemid = identify.systemid, timeline = identify.timeline, "identified upstream");

        let start_lsn = self.ack_tracker.lock().initial_lsn();
        self.last_sent_lsn = start_lsn;
        info!(%start_lsn, "starting logical replication");

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {}",
            quote_ident(&self.slot_name), start_lsn
        );
        let copy_stream: tokio_postgres::CopyBothDuplex<Bytes> = self
            .replication_client
            .copy_both_simple(&query)
            .await
            .context("START_REPLICATION failed")?;
        let physical_stream = ReplicationStream::new(copy_stream);
        let mut physical_stream = pin!(physical_stream);

        let mut feedback_ticker = interval(self.feedback_interval);
        feedback_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("replication reader cancelled");
                    return Ok(());
                }

                _ = feedback_ticker.tick() => {
                    self.send_feedback(physical_stream.as_mut(), false).await?;
                }

                msg = physical_stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("replication stream closed by upstream");
                    };
                    let msg = msg.context("replication protocol error")?;
                    self.handle_message(physical_stream.as_mut(), msg).await?;
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        mut stream: std::pin::Pin<&mut ReplicationStream>,
        msg: ReplicationMessage<Bytes>,
    ) -> anyhow::Result<()> {
        match msg {
            ReplicationMessage::XLogData(xlog_data) => {
                let wal_start = Lsn::from(u64::from(xlog_data.wal_start()));
                trace!(%wal_start, len = xlog_data.data().len(), "received XLogData");

                let events = self
                    .decoder
                    .decode(wal_start, xlog_data.data())
                    .context("failed to decode WAL payload")?;

                for event in events {
                    let ack_id = self.ack_tracker.lock().register(event.lsn);
                    let queued = QueuedEvent {
                        ack_id,
                        lsn: event.lsn,
                        partition_key: event.partition_key,
                        payload: event.payload,
                    };
                    if queued.size() > self.queue_max_bytes {
                        crate::metrics::OVERSIZE_EVENTS_TOTAL.inc();
                        warn!(%ack_id, size = queued.size(), "admitting oversize event larger than queue byte cap");
                    }
                    self.queue.put(queued).await;
                }
            }
            ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                debug!(
                    wal_end = keepalive.wal_end(),
                    reply_requested = keepalive.reply() != 0,
                    "received keepalive"
                );
                if keepalive.reply() != 0 {
                    self.send_feedback(stream, true).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Drain the frontier channel down to its latest value and send a
    /// `StandbyStatusUpdate` carrying it as write/flush/apply LSN (§4.6).
    /// The sent value never decreases (I4): a stale or regressed read is
    /// clamped to the last value sent and logged as a bug (§9).
    async fn send_feedback(
        &mut self,
        mut stream: std::pin::Pin<&mut ReplicationStream>,
        reply_requested: bool,
    ) -> anyhow::Result<()> {
        let _ = self.frontier_rx.has_changed();
        let mut candidate = *self.frontier_rx.borrow_and_update();
        if !reply_requested && candidate <= self.last_sent_lsn {
            return Ok(());
        }

        if candidate < self.last_sent_lsn {
            warn!(
                %candidate,
                last_sent = %self.last_sent_lsn,
                "feedback LSN regressed, clamping to last sent value"
            );
            crate::metrics::FEEDBACK_LSN_CLAMPED_TOTAL.inc();
            candidate = self.last_sent_lsn;
        }

        let pg_lsn = PgLsn::from(u64::from(candidate));
        let ts = pg_timestamp_now();
        stream
            .as_mut()
            .standby_status_update(pg_lsn, pg_lsn, pg_lsn, ts, 0)
            .await
            .context("failed to send StandbyStatusUpdate")?;
        self.last_sent_lsn = candidate;
        Ok(())
    }
}

fn pg_timestamp_now() -> i64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (unix.as_micros() as i64) - (PG_EPOCH_UNIX_SECONDS as i64) * 1_000_000
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug)]
struct IdentifySystem {
    systemid: u64,
    timeline: u32,
    #[allow(dead_code)]
    xlogpos: PgLsn,
}

/// Run `IDENTIFY_SYSTEM` on the replication connection, the same helper
/// shape `walreceiver_connection::identify_system` uses.
async fn identify_system(client: &mut Client) -> anyhow::Result<IdentifySystem> {
    let response = client.simple_query("IDENTIFY_SYSTEM").await?;

    fn get_parse<T: FromStr>(row: &SimpleQueryRow, idx: usize) -> anyhow::Result<T> {
        let val = row.get(idx).context("IDENTIFY_SYSTEM: missing column")?;
        val.parse::<T>()
            .map_err(|_| anyhow::anyhow!("IDENTIFY_SYSTEM: failed to parse column {idx}"))
    }

    match response.first() {
        Some(SimpleQueryMessage::Row(row)) => Ok(IdentifySystem {
            systemid: get_parse(row, 0)?,
            timeline: get_parse(row, 1)?,
            xlogpos: get_parse(row, 2)?,
        }),
        _ => anyhow::bail!("IDENTIFY_SYSTEM returned no rows"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_timestamp_is_relative_to_pg_epoch() {
        let ts = pg_timestamp_now();
        // Unix time is always well past the Postgres epoch offset, so the
        // adjusted timestamp must be positive.
        assert!(ts > 0);
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("my_slot"), "\"my_slot\"");
        assert_eq!(quote_ident("weird\"slot"), "\"weird\"\"slot\"");
    }
}
