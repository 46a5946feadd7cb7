//! CDC relay: Postgres logical replication -> ordered ack tracking ->
//! micro-batched Kinesis publication -> slot feedback (see crate root
//! `DESIGN.md` for the grounding ledger).
//!
//! Module layout mirrors the component table: each of C1-C9 is its own
//! module, composed together by [`supervisor`], the way `safekeeper`'s
//! `lib.rs` re-exports one module per subsystem for its own binaries.

pub mod ack_tracker;
pub mod backoff;
pub mod batcher;
pub mod classify;
pub mod decode;
pub mod errors;
pub mod http;
pub mod leader;
pub mod logging;
pub mod lsn;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod reader;
pub mod settings;
pub mod sink;
pub mod slot;
pub mod supervisor;
