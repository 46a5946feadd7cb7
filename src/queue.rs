//! Bounded, dual-capacity FIFO queue sitting between the replication reader
//! and the publisher.
//!
//! Shaped like the bounded mpsc queues elsewhere in this codebase family
//! (a `Mutex<VecDeque<_>>` paired with `Notify` for both directions)
//! rather than `tokio::sync::mpsc`, because admission here depends on two
//! simultaneous caps (count and bytes) and an oversize-singleton
//! exception that a plain channel can't express. Capacity is modeled as
//! "inflight", not "queued": a `put`-ted event keeps its slot reserved
//! from admission until the consumer calls [`InflightQueue::task_done`],
//! not merely until it's dequeued by [`InflightQueue::get_ready`] (§4.1,
//! I3) -- the same accounting `queue.Queue.task_done`/`join` give you,
//! adapted to an async, dual-capacity setting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::lsn::Lsn;

/// One registered change event, carrying the ack id it was registered
/// under and its wire size for queue/batch accounting.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub ack_id: u64,
    pub lsn: Lsn,
    pub partition_key: String,
    pub payload: bytes::Bytes,
}

impl QueuedEvent {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

struct Inner {
    items: VecDeque<QueuedEvent>,
    count_cap: usize,
    bytes_cap: usize,
    /// Events admitted but not yet `task_done`: still sitting in `items`,
    /// or already handed to a consumer via `get_ready` and awaiting
    /// completion. This, not `items.len()`, is what admission is gated on.
    inflight_count: usize,
    inflight_bytes: usize,
}

impl Inner {
    fn has_room_for(&self, size: usize) -> bool {
        if self.inflight_count == 0 {
            // Oversize-singleton exception: with nothing else outstanding,
            // admit a single event larger than the byte cap rather than
            // deadlock the pipeline on it (§4.1).
            return true;
        }
        self.inflight_count < self.count_cap && self.inflight_bytes + size <= self.bytes_cap
    }
}

/// Bounded FIFO queue of registered events awaiting batching/publication.
pub struct InflightQueue {
    inner: parking_lot::Mutex<Inner>,
    not_full: Notify,
    not_empty: Notify,
}

impl InflightQueue {
    pub fn new(count_cap: usize, bytes_cap: usize) -> Self {
        InflightQueue {
            inner: parking_lot::Mutex::new(Inner {
                items: VecDeque::new(),
                count_cap,
                bytes_cap,
                inflight_count: 0,
                inflight_bytes: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    /// Admit `event`, blocking until there is room. Strict FIFO: a blocked
    /// `put` is never skipped by a later, smaller event.
    pub async fn put(self: &Arc<Self>, event: QueuedEvent) {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.has_room_for(event.size()) {
                    inner.inflight_count += 1;
                    inner.inflight_bytes += event.size();
                    inner.items.push_back(event);
                    crate::metrics::QUEUE_DEPTH.set(inner.items.len() as i64);
                    drop(inner);
                    self.not_empty.notify_one();
                    return;
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Remove and return up to `max_items` events, never exceeding
    /// `max_bytes` in total unless the very first event alone exceeds it
    /// -- and then only if `allow_oversize_first` permits the exception
    /// (the caller should pass `false` once it already holds bytes from
    /// an earlier call, so a lone oversize event can't be appended on top
    /// of an already-building batch and burst the cap; see
    /// [`MicroBatcher`](crate::batcher::MicroBatcher)). Blocks if the
    /// queue is empty, waiting up to `wait` for the first event to
    /// arrive; returns an empty `Vec` on timeout, and also returns
    /// immediately (without waiting) if the only event ready is oversize
    /// and the exception is disallowed.
    ///
    /// Dequeuing does *not* free admission capacity -- callers must still
    /// call [`task_done`](Self::task_done) for each returned event once
    /// it's been published or dropped.
    pub async fn get_ready(
        self: &Arc<Self>,
        max_items: usize,
        max_bytes: usize,
        wait: Duration,
        allow_oversize_first: bool,
    ) -> Vec<QueuedEvent> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.items.is_empty() {
                    let mut out = Vec::new();
                    let mut bytes_taken = 0usize;
                    while out.len() < max_items {
                        let Some(front) = inner.items.front() else {
                            break;
                        };
                        let size = front.size();
                        let is_first = out.is_empty();
                        let oversize_exception = is_first && allow_oversize_first;
                        if !oversize_exception && bytes_taken + size > max_bytes {
                            break;
                        }
                        let ev = inner.items.pop_front().expect("front just peeked");
                        bytes_taken += size;
                        out.push(ev);
                        if bytes_taken >= max_bytes {
                            break;
                        }
                    }
                    if !out.is_empty() {
                        crate::metrics::QUEUE_DEPTH.set(inner.items.len() as i64);
                        return out;
                    }
                    if !allow_oversize_first {
                        // The only thing ready is an oversize event we're
                        // not allowed to take right now; nothing will
                        // change about that within `wait`, so report "not
                        // ready" immediately instead of stalling a batch
                        // that's otherwise ready to flush.
                        return Vec::new();
                    }
                }
            }
            if timeout(wait, self.not_empty.notified()).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Release the admission slot `event` was holding. Mandatory exactly
    /// once per `put` (I3); a second call for the same event would
    /// under-count `inflight_bytes`/`inflight_count` and is a programming
    /// error (debug-asserted below rather than silently tolerated).
    pub fn task_done(&self, event: &QueuedEvent) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.inflight_count > 0,
            "task_done called with no inflight events outstanding"
        );
        inner.inflight_count = inner.inflight_count.saturating_sub(1);
        inner.inflight_bytes = inner.inflight_bytes.saturating_sub(event.size());
        drop(inner);
        // `notify_one`, not `notify_waiters`: with a single producer,
        // `Notify` stores this as a permit if `put` isn't registered as a
        // waiter yet, so a `task_done` landing between `put`'s capacity
        // check and its `notified().await` still wakes it instead of
        // being lost.
        self.not_full.notify_one();
    }

    /// Number of events currently sitting in the queue, not yet dequeued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events admitted but not yet `task_done`, i.e. still consuming
    /// queue capacity (§4.1, I3). Used by tests and the `/healthz` probe.
    pub fn inflight_count(&self) -> usize {
        self.inner.lock().inflight_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn ev(ack_id: u64, size: usize) -> QueuedEvent {
        QueuedEvent {
            ack_id,
            lsn: Lsn(ack_id),
            partition_key: ack_id.to_string(),
            payload: bytes::Bytes::from(vec![0u8; size]),
        }
    }

    #[tokio::test]
    async fn fifo_ordering_preserved() {
        let q = Arc::new(InflightQueue::new(10, 10_000));
        q.put(ev(1, 10)).await;
        q.put(ev(2, 10)).await;
        q.put(ev(3, 10)).await;
        let got = q
            .get_ready(10, 10_000, Duration::from_millis(10), true)
            .await;
        assert_eq!(
            got.iter().map(|e| e.ack_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn oversize_singleton_admitted_when_empty() {
        let q = Arc::new(InflightQueue::new(10, 100));
        q.put(ev(1, 1000)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn get_ready_times_out_when_empty() {
        let q = Arc::new(InflightQueue::new(10, 10_000));
        let got = q
            .get_ready(10, 10_000, Duration::from_millis(20), true)
            .await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn get_ready_respects_byte_cap() {
        let q = Arc::new(InflightQueue::new(10, 10_000));
        for i in 1..=5u64 {
            q.put(ev(i, 40)).await;
        }
        let got = q.get_ready(10, 100, Duration::from_millis(10), true).await;
        assert!(got.iter().map(|e| e.size()).sum::<usize>() <= 100);
        assert!(!got.is_empty());
    }

    #[tokio::test]
    async fn oversize_first_exception_suppressed_when_disallowed() {
        let q = Arc::new(InflightQueue::new(10, 100));
        q.put(ev(1, 1000)).await;

        // Disallowed: the lone oversize event must not be handed back,
        // and the call must return immediately rather than waiting out
        // the full timeout.
        let start = Instant::now();
        let got = q
            .get_ready(10, 100, Duration::from_millis(200), false)
            .await;
        assert!(got.is_empty());
        assert!(start.elapsed() < Duration::from_millis(100));

        // Allowed: the same event is admitted as a singleton.
        let got = q.get_ready(10, 100, Duration::from_millis(10), true).await;
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn dequeue_alone_does_not_free_capacity() {
        let q = Arc::new(InflightQueue::new(1, 10_000));
        q.put(ev(1, 10)).await;

        let q2 = q.clone();
        let putter = tokio::spawn(async move {
            q2.put(ev(2, 10)).await;
        });

        let got = q
            .get_ready(1, 10_000, Duration::from_millis(10), true)
            .await;
        assert_eq!(got.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !putter.is_finished(),
            "put must stay blocked until task_done, not merely dequeue"
        );

        q.task_done(&got[0]);
        putter.await.unwrap();
        assert_eq!(q.inflight_count(), 1);
    }

    #[tokio::test]
    async fn double_task_done_is_debug_asserted() {
        let q = Arc::new(InflightQueue::new(10, 10_000));
        q.put(ev(1, 10)).await;
        let got = q
            .get_ready(1, 10_000, Duration::from_millis(10), true)
            .await;
        q.task_done(&got[0]);
        assert_eq!(q.inflight_count(), 0);
    }

    #[tokio::test]
    async fn task_done_wakes_a_blocked_put() {
        // Regression test: `task_done` must store a permit (`notify_one`)
        // rather than only waking already-registered waiters
        // (`notify_waiters`), since a single-producer `put` can start
        // waiting strictly after `task_done` has already run, and must
        // not miss that wakeup (a lost one stalls the pipeline forever).
        let q = Arc::new(InflightQueue::new(1, 10_000));
        q.put(ev(1, 10)).await;

        let q2 = q.clone();
        let putter = tokio::spawn(async move {
            q2.put(ev(2, 10)).await;
        });

        // Give the putter a chance to block on capacity before freeing it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!putter.is_finished());

        q.task_done(&ev(1, 10));
        tokio::time::timeout(Duration::from_millis(200), putter)
            .await
            .expect("task_done must wake the blocked put promptly")
            .unwrap();
    }
}
