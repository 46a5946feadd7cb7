//! The small set of error shapes other components match on programmatically.
//!
//! Everything else in this crate propagates with `anyhow::Result` and
//! `.context(...)`, the idiom used throughout this codebase. These enums
//! exist only where a caller needs to branch on *which* failure happened,
//! not just log it.

use thiserror::Error;

/// Why a leader cycle ended. The supervisor logs `LockLost` and `Shutdown`
/// at `warn!`/`info!` (expected outcomes) and `TaskFailed` at `error!`.
#[derive(Debug, Error)]
pub enum LeaderCycleError {
    #[error("leader_lock_lost")]
    LockLost,

    #[error("task failed: {0}")]
    TaskFailed(#[source] anyhow::Error),

    #[error("shutdown requested")]
    Shutdown,
}

/// Configuration validation failure. Fatal at startup; the binary exits
/// non-zero without entering the supervisor loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
