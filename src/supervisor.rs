//! Top-level leader-cycle loop (§4.8).
//!
//! Shaped like `pageserver`/`safekeeper`'s main-loop pattern of "set up
//! per-run state, spawn the run's tasks under a `JoinSet`, wait for the
//! first exit, cancel the rest": a leader cycle is exactly one such run,
//! repeated forever with a backoff between attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ack_tracker::AckTracker;
use crate::decode::JsonPassthroughDecoder;
use crate::errors::LeaderCycleError;
use crate::leader::{LeaderElector, Watchdog};
use crate::lsn::Lsn;
use crate::publisher::Publisher;
use crate::queue::InflightQueue;
use crate::reader::ReplicationReader;
use crate::settings::Settings;
use crate::sink::Sink;
use crate::slot;

/// Shared flag the `/healthz` endpoint reads; true only while a leader
/// cycle has a fully running pipeline.
#[derive(Default)]
pub struct LeaderState {
    leading: AtomicBool,
}

impl LeaderState {
    pub fn is_leading(&self) -> bool {
        self.leading.load(Ordering::Relaxed)
    }

    fn set(&self, leading: bool) {
        self.leading.store(leading, Ordering::Relaxed);
    }
}

/// Runs leader cycles forever until `shutdown` fires. Each cycle acquires
/// leadership, wires up a fresh queue/tracker/pipeline, and runs it until
/// any task ends; then tears everything down and retries (§4.8).
pub async fn run(
    settings: Settings,
    sink: Arc<dyn Sink>,
    leader_state: Arc<LeaderState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let elector = LeaderElector::new(settings.postgres.clone(), settings.intervals.leader_acquire);

    loop {
        if shutdown.is_cancelled() {
            info!("shutdown requested before next leader cycle");
            return Ok(());
        }

        let cycle_result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("shutdown requested, not starting a new leader cycle");
                return Ok(());
            }
            result = run_one_cycle(&settings, sink.clone(), &elector, &leader_state, shutdown.clone()) => result,
        };

        leader_state.set(false);
        crate::metrics::LEADER_CYCLES_TOTAL.inc();

        match cycle_result {
            Ok(()) => info!("leader cycle ended cleanly"),
            Err(err) => match err.downcast_ref::<LeaderCycleError>() {
                Some(LeaderCycleError::LockLost) => warn!("leadership lost, retrying"),
                Some(LeaderCycleError::Shutdown) => {
                    info!("leader cycle unwound for shutdown");
                    return Ok(());
                }
                _ => error!(error = %err, "leader cycle failed"),
            },
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn run_one_cycle(
    settings: &Settings,
    sink: Arc<dyn Sink>,
    elector: &LeaderElector,
    leader_state: &Arc<LeaderState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let session = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(LeaderCycleError::Shutdown.into()),
        session = elector.acquire() => session?,
    };

    let checkpoint = slot::read_checkpoint(session.client(), &settings.postgres.replication_slot)
        .await
        .map_err(LeaderCycleError::TaskFailed)?;
    info!(%checkpoint, "recovered slot checkpoint");

    let ack_tracker = Arc::new(parking_lot::Mutex::new(AckTracker::new(checkpoint)));
    let queue = Arc::new(InflightQueue::new(
        settings.queue.max_count,
        settings.queue.max_bytes,
    ));
    let (frontier_tx, frontier_rx) = watch::channel(Lsn::INVALID);

    let (replication_client, replication_connection) = tokio_postgres::connect(
        &settings.postgres.replication_connstring(),
        NoTls,
    )
    .await
    .context("failed to open replication connection")
    .map_err(LeaderCycleError::TaskFailed)?;

    let replication_connection_task = tokio::spawn(async move {
        if let Err(err) = replication_connection.await {
            warn!(error = %err, "replication connection ended");
        }
    });

    let cycle_cancel = CancellationToken::new();

    let reader = ReplicationReader::new(
        replication_client,
        queue.clone(),
        ack_tracker.clone(),
        Box::new(JsonPassthroughDecoder),
        settings,
        frontier_rx,
    );
    let publisher = Publisher::new(queue.clone(), ack_tracker.clone(), sink, settings, frontier_tx);
    let watchdog = Watchdog::new(settings.intervals.watchdog);

    leader_state.set(true);

    // Scoped so every future borrowing `session.client()` (the watchdog)
    // is fully dropped before `session.release()` below needs to consume
    // `session` by value.
    let outcome = run_pipeline(reader, publisher, watchdog, &session, cycle_cancel, &shutdown).await;

    replication_connection_task.abort();
    session.release().await;

    outcome
}

async fn run_pipeline(
    reader: ReplicationReader,
    publisher: Publisher,
    watchdog: Watchdog,
    session: &crate::leader::LeaderSession,
    cycle_cancel: CancellationToken,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let lock_key = session.lock_key();

    let mut reader_task = tokio::spawn(reader.run(cycle_cancel.clone()));
    let mut publisher_task = tokio::spawn(publisher.run(cycle_cancel.clone()));

    // The watchdog borrows the leader session's own client (§4.7), so it
    // runs inline in this task rather than a spawned one; `select!` below
    // still races it against the other two and against shutdown.
    let watchdog_fut = watchdog.run(session.client(), lock_key, cycle_cancel.clone());
    tokio::pin!(watchdog_fut);

    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(LeaderCycleError::Shutdown.into()),
        res = &mut reader_task => flatten_join(res, "replication reader"),
        res = &mut publisher_task => flatten_join(res, "publisher"),
        res = &mut watchdog_fut => res,
    };

    cycle_cancel.cancel();
    let _ = reader_task.await;
    let _ = publisher_task.await;

    outcome
}

fn flatten_join(
    res: Result<anyhow::Result<()>, tokio::task::JoinError>,
    task_name: &'static str,
) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(LeaderCycleError::TaskFailed(err).into()),
        Err(join_err) => Err(LeaderCycleError::TaskFailed(anyhow::anyhow!(
            "{task_name} panicked: {join_err}"
        ))
        .into()),
    }
}
