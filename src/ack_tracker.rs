//! Contiguous-frontier ack tracking.
//!
//! Events are registered in WAL order and later acknowledged out of order
//! by the publisher (batches complete independently). The tracker sweeps
//! its registration-ordered queue from the front, advancing the frontier
//! LSN only as far as the unbroken run of acknowledged events reaches.
//! Modeled on the in-order completion bookkeeping `safekeeper::send_wal`
//! keeps for `commit_lsn`/`flush_lsn`, adapted from "newest wins" to
//! "longest contiguous prefix wins".

use std::collections::VecDeque;

use tracing::warn;

use crate::lsn::Lsn;

struct Entry {
    ack_id: u64,
    lsn: Lsn,
    acked: bool,
}

/// Tracks registered-but-not-yet-contiguously-acknowledged events and
/// exposes the frontier LSN: the highest LSN such that every event at or
/// below it has been acknowledged.
pub struct AckTracker {
    entries: VecDeque<Entry>,
    next_ack_id: u64,
    frontier: Lsn,
    last_registered_lsn: Lsn,
}

impl AckTracker {
    /// `initial_lsn` is the frontier recovered from the last persisted
    /// checkpoint (§3); the tracker starts with nothing outstanding.
    pub fn new(initial_lsn: Lsn) -> Self {
        AckTracker {
            entries: VecDeque::new(),
            next_ack_id: 1,
            frontier: initial_lsn,
            last_registered_lsn: initial_lsn,
        }
    }

    /// The frontier this tracker started from, i.e. the checkpoint to
    /// resume replication at (§3, §7).
    pub fn initial_lsn(&self) -> Lsn {
        self.frontier
    }

    /// Register a newly read WAL event at `lsn`, returning the ack id the
    /// publisher must present back via [`mark_published_by_id`].
    ///
    /// `lsn` is expected to be weakly monotonic with prior registrations.
    /// A regression is tolerated (logged, not fatal): Postgres can, in
    /// rare recovery scenarios, replay a small range of already-seen WAL.
    pub fn register(&mut self, lsn: Lsn) -> u64 {
        if lsn < self.last_registered_lsn {
            warn!(
                registered_lsn = %lsn,
                last_registered_lsn = %self.last_registered_lsn,
                "LSN regression observed while registering event"
            );
        } else {
            self.last_registered_lsn = lsn;
        }

        let ack_id = self.next_ack_id;
        self.next_ack_id += 1;
        self.entries.push_back(Entry {
            ack_id,
            lsn,
            acked: false,
        });
        crate::metrics::EVENTS_REGISTERED_TOTAL.inc();
        ack_id
    }

    /// Mark the event registered under `ack_id` as published, then sweep
    /// the frontier forward over any now-contiguous prefix.
    ///
    /// A mismatched `ack_id` (already swept past, or never registered) is
    /// a no-op: a late ack after a leader failover/slot rewind must not
    /// corrupt the tracker state.
    pub fn mark_published_by_id(&mut self, ack_id: u64) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.ack_id == ack_id) else {
            return;
        };
        entry.acked = true;
        self.sweep();
    }

    fn sweep(&mut self) {
        while let Some(front) = self.entries.front() {
            if !front.acked {
                break;
            }
            let lsn = front.lsn;
            self.entries.pop_front();
            if lsn > self.frontier {
                self.frontier = lsn;
            }
        }
        crate::metrics::FRONTIER_LSN.set(u64::from(self.frontier) as f64);
    }

    /// Highest LSN such that every registered event at or below it has
    /// been acknowledged. Safe to report to Postgres as `flush_lsn`.
    pub fn frontier_lsn(&self) -> Lsn {
        self.frontier
    }

    /// Number of events registered but not yet swept past the frontier.
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_advances_only_over_contiguous_prefix() {
        let mut t = AckTracker::new(Lsn(0));
        let a = t.register(Lsn(10));
        let b = t.register(Lsn(20));
        let c = t.register(Lsn(30));

        t.mark_published_by_id(c);
        assert_eq!(t.frontier_lsn(), Lsn(0));

        t.mark_published_by_id(a);
        assert_eq!(t.frontier_lsn(), Lsn(10));

        t.mark_published_by_id(b);
        assert_eq!(t.frontier_lsn(), Lsn(30));
        assert_eq!(t.outstanding(), 0);
    }

    #[test]
    fn unknown_ack_id_is_ignored() {
        let mut t = AckTracker::new(Lsn(0));
        t.register(Lsn(10));
        t.mark_published_by_id(999);
        assert_eq!(t.frontier_lsn(), Lsn(0));
        assert_eq!(t.outstanding(), 1);
    }

    #[test]
    fn lsn_regression_is_tolerated() {
        let mut t = AckTracker::new(Lsn(100));
        let a = t.register(Lsn(90));
        t.mark_published_by_id(a);
        assert_eq!(t.frontier_lsn(), Lsn(100));
    }

    #[test]
    fn initial_lsn_reflects_recovered_checkpoint() {
        let t = AckTracker::new(Lsn(500));
        assert_eq!(t.initial_lsn(), Lsn(500));
        assert_eq!(t.frontier_lsn(), Lsn(500));
    }
}
