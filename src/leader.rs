//! Leadership via a Postgres advisory lock, plus the watchdog that confirms
//! the lock is still held (§4.7).
//!
//! There's no direct precedent for advisory-lock leader election in this
//! codebase family (`neon` coordinates safekeeper quorums instead), so
//! this module is grounded on the nearby idiom: `tokio_postgres::Client`
//! query helpers the way `walreceiver_connection::identify_system` and
//! `compute_tools::compute`'s `simple_query` calls use them, and the
//! "poll on an interval, bail with a distinguished error on loss" shape
//! `send_wal`'s keepalive-timeout checks use for its own liveness probe.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::Context;
use tokio::time::interval;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info, warn};

use crate::errors::LeaderCycleError;
use crate::settings::PostgresSettings;

/// Derive the 64-bit advisory lock key from the replication slot name,
/// unless an explicit override is configured (§6). Hashing the slot name
/// keeps the key deterministic across restarts without requiring an
/// operator to hand-pick one.
fn lock_key(postgres: &PostgresSettings) -> i64 {
    if let Some(key) = postgres.leader_lock_key_override {
        return key;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    postgres.replication_slot.hash(&mut hasher);
    hasher.finish() as i64
}

/// A held advisory lock, bound to the Postgres session that acquired it.
/// Leadership and session lifetime are co-terminus (§4.7): dropping this
/// closes the connection, which releases the lock server-side even if
/// this process never sends an explicit unlock.
pub struct LeaderSession {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    lock_key: i64,
}

impl LeaderSession {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Release the lock by closing the session. Idempotent with process
    /// exit: if the connection already died (e.g. network partition), this
    /// just reaps the background task.
    pub async fn release(self) {
        drop(self.client);
        let _ = self.connection_task.await;
    }
}

/// Attempts leadership acquisition on a fixed poll interval (§4.7).
pub struct LeaderElector {
    postgres: PostgresSettings,
    poll_interval: Duration,
}

impl LeaderElector {
    pub fn new(postgres: PostgresSettings, poll_interval: Duration) -> Self {
        LeaderElector {
            postgres,
            poll_interval,
        }
    }

    /// Block until leadership is acquired, retrying non-blocking
    /// try-acquire attempts forever on `poll_interval` (§4.7: "waits
    /// indefinitely", no total timeout).
    pub async fn acquire(&self) -> anyhow::Result<LeaderSession> {
        let key = lock_key(&self.postgres);
        let mut ticker = interval(self.poll_interval);

        loop {
            ticker.tick().await;
            match self.try_acquire_once(key).await {
                Ok(Some(session)) => {
                    info!(lock_key = key, "acquired leadership");
                    return Ok(session);
                }
                Ok(None) => {
                    // Another replica holds the lock; keep polling.
                }
                Err(err) => {
                    warn!(error = %err, "leader session connection error, retrying");
                }
            }
        }
    }

    async fn try_acquire_once(&self, key: i64) -> anyhow::Result<Option<LeaderSession>> {
        let (client, connection) = tokio_postgres::connect(&self.postgres.connstring(), NoTls)
            .await
            .context("failed to open leader session")?;

        let connection_task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "leader session connection ended");
            }
        });

        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
            .await
            .context("pg_try_advisory_lock query failed")?;
        let acquired: bool = row.get(0);

        if acquired {
            Ok(Some(LeaderSession {
                client,
                connection_task,
                lock_key: key,
            }))
        } else {
            drop(client);
            let _ = connection_task.await;
            Ok(None)
        }
    }
}

/// Polls `pg_locks` on the leader session to confirm the advisory lock is
/// still held by this backend, signalling `leader_lock_lost` on loss
/// (§4.7, §7). A separate connection from the leader session itself would
/// let a query outlive a session that's already gone, so the watchdog
/// reuses the leader session's own client.
pub struct Watchdog {
    interval: Duration,
}

impl Watchdog {
    pub fn new(interval: Duration) -> Self {
        Watchdog { interval }
    }

    pub async fn run(
        self,
        client: &Client,
        lock_key: i64,
        cancel: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<()> {
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("watchdog cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if !self.check_held(client, lock_key).await? {
                        error!(lock_key, "leadership lock no longer held");
                        return Err(LeaderCycleError::LockLost.into());
                    }
                }
            }
        }
    }

    async fn check_held(&self, client: &Client, lock_key: i64) -> anyhow::Result<bool> {
        // A single-bigint advisory lock is recorded in pg_locks split
        // across two int4 columns: `classid` holds the high 32 bits,
        // `objid` the low 32 bits.
        let classid = (lock_key >> 32) as i32;
        let objid = (lock_key & 0xffff_ffff) as i32;
        let row = client
            .query_one(
                "SELECT count(*) FROM pg_locks \
                 WHERE locktype = 'advisory' \
                   AND classid = $1 AND objid = $2 \
                   AND pid = pg_backend_pid()",
                &[&classid, &objid],
            )
            .await
            .context("pg_locks watchdog query failed")?;
        let held: i64 = row.get(0);
        Ok(held > 0)
    }
}
