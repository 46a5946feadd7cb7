//! Micro-batching: groups queued events into batches bounded by record
//! count, byte size, and linger time, whichever is hit first.
//!
//! Pulled out as its own unit (rather than inlined in the publisher) the
//! same way `safekeeper`'s WAL senders separate "gather bytes" from
//! "send the message" -- makes the three caps independently testable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::queue::{InflightQueue, QueuedEvent};

pub struct Batch {
    pub events: Vec<QueuedEvent>,
}

impl Batch {
    pub fn total_bytes(&self) -> usize {
        self.events.iter().map(|e| e.size()).sum()
    }
}

pub struct MicroBatcher {
    queue: Arc<InflightQueue>,
    max_records: usize,
    max_bytes: usize,
    max_linger: Duration,
}

impl MicroBatcher {
    pub fn new(
        queue: Arc<InflightQueue>,
        max_records: usize,
        max_bytes: usize,
        max_linger: Duration,
    ) -> Self {
        MicroBatcher {
            queue,
            max_records,
            max_bytes,
            max_linger,
        }
    }

    /// Assemble the next batch. Blocks indefinitely while the queue is
    /// empty; once the first event arrives, returns as soon as a cap is
    /// hit or `max_linger` has elapsed since that first event, whichever
    /// comes first. Never returns an empty batch.
    pub async fn next_batch(&self) -> Batch {
        let mut events = Vec::new();
        let mut bytes_used = 0usize;
        let mut deadline: Option<Instant> = None;

        loop {
            let wait = match deadline {
                None => self.max_linger,
                Some(d) => d.saturating_duration_since(Instant::now()),
            };

            // Oversize singletons are only admitted as the very first
            // event of a fresh batch (§4.1); once this batch already
            // holds bytes, a lone oversize event at the queue head must
            // wait for the *next* batch rather than burst this one's
            // `max_bytes` cap (§8: the micro-batcher never exceeds a cap).
            let got = self
                .queue
                .get_ready(
                    self.max_records - events.len(),
                    self.max_bytes - bytes_used,
                    wait,
                    events.is_empty(),
                )
                .await;

            if got.is_empty() {
                if events.is_empty() {
                    continue;
                }
                return Batch { events };
            }

            if deadline.is_none() {
                deadline = Some(Instant::now() + self.max_linger);
            }

            for ev in got {
                bytes_used += ev.size();
                events.push(ev);
            }

            if events.len() >= self.max_records || bytes_used >= self.max_bytes {
                return Batch { events };
            }
            if Instant::now() >= deadline.expect("deadline set above") {
                return Batch { events };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;

    fn ev(ack_id: u64, size: usize) -> QueuedEvent {
        QueuedEvent {
            ack_id,
            lsn: Lsn(ack_id),
            partition_key: ack_id.to_string(),
            payload: bytes::Bytes::from(vec![0u8; size]),
        }
    }

    #[tokio::test]
    async fn batch_bounded_by_max_records() {
        let q = Arc::new(InflightQueue::new(100, 1_000_000));
        for i in 1..=5 {
            q.put(ev(i, 10)).await;
        }
        let batcher = MicroBatcher::new(q, 3, 1_000_000, Duration::from_millis(50));
        let batch = batcher.next_batch().await;
        assert_eq!(batch.events.len(), 3);
    }

    #[tokio::test]
    async fn batch_bounded_by_max_linger() {
        let q = Arc::new(InflightQueue::new(100, 1_000_000));
        q.put(ev(1, 10)).await;
        let batcher = MicroBatcher::new(q, 100, 1_000_000, Duration::from_millis(20));
        let start = Instant::now();
        let batch = batcher.next_batch().await;
        assert_eq!(batch.events.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn batch_bounded_by_max_bytes() {
        let q = Arc::new(InflightQueue::new(100, 1_000_000));
        for i in 1..=5 {
            q.put(ev(i, 40)).await;
        }
        let batcher = MicroBatcher::new(q, 100, 100, Duration::from_millis(50));
        let batch = batcher.next_batch().await;
        assert!(batch.total_bytes() <= 100);
        assert!(!batch.events.is_empty());
    }

    #[tokio::test]
    async fn never_returns_empty_batch() {
        let q = Arc::new(InflightQueue::new(100, 1_000_000));
        let q2 = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            q2.put(ev(1, 10)).await;
        });
        let batcher = MicroBatcher::new(q, 10, 1_000_000, Duration::from_millis(10));
        let batch = batcher.next_batch().await;
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test]
    async fn oversize_event_does_not_burst_a_batch_already_in_progress() {
        // The byte cap (100) only tolerates an oversize singleton as the
        // *first* event of a batch. A small event followed by one that's
        // oversize relative to the cap must flush as two separate
        // batches, not one batch exceeding 100 bytes.
        let q = Arc::new(InflightQueue::new(100, 1_000_000));
        q.put(ev(1, 10)).await;
        q.put(ev(2, 200)).await;

        let batcher = MicroBatcher::new(q, 100, 100, Duration::from_millis(30));

        let first = batcher.next_batch().await;
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].ack_id, 1);
        assert!(first.total_bytes() <= 100);

        let second = batcher.next_batch().await;
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].ack_id, 2);
        assert_eq!(second.total_bytes(), 200);
    }
}
