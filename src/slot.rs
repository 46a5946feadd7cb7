//! Reads the replication slot's durable checkpoint (§4.6, §6).
//!
//! `confirmed_flush_lsn`/`restart_lsn` live in `pg_replication_slots`, the
//! same system view `neon`'s own tooling reads when reasoning about a
//! safekeeper's WAL retention; queried here with a plain `query_one` the
//! way `leader::Watchdog` queries `pg_locks`.

use anyhow::Context;
use tokio_postgres::Client;

use crate::lsn::Lsn;

/// The slot's durable cursor, preferring `confirmed_flush_lsn` (the
/// consumer-acknowledged position) and falling back to `restart_lsn`
/// (decoding can always restart from there, even if nothing has been
/// confirmed yet) per §4.6.
pub async fn read_checkpoint(client: &Client, slot_name: &str) -> anyhow::Result<Lsn> {
    let row = client
        .query_opt(
            "SELECT confirmed_flush_lsn, restart_lsn FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
        .context("failed to query pg_replication_slots")?
        .with_context(|| format!("replication slot '{slot_name}' does not exist"))?;

    let confirmed: Option<tokio_postgres::types::PgLsn> = row.get(0);
    let restart: Option<tokio_postgres::types::PgLsn> = row.get(1);

    let lsn = confirmed
        .or(restart)
        .with_context(|| format!("replication slot '{slot_name}' has no usable checkpoint LSN yet"))?;
    Ok(Lsn::from(u64::from(lsn)))
}
