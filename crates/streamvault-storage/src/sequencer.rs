//! WAL Callback Sequencer
//!
//! The WAL serializes offsets internally, but durability acks come back in
//! arbitrary order across streams - and clients require per-stream completion
//! in offset order. All of that reordering happens here, and only here.
//!
//! Each active stream has a FIFO of its in-flight requests (registered at
//! admission, in WAL-offset order). When an ack arrives, the request is
//! marked persisted; if it sits at the head of its stream's queue, the
//! maximal persisted prefix is popped and handed back to the caller for cache
//! insertion and completion. The hot path is O(1) amortized: push to the
//! tail, pop a prefix.
//!
//! The sequencer also tracks the WAL confirm offset - the smallest per-stream
//! "everything at or below is acknowledged" offset across all streams. The
//! upload pipeline stamps it onto archived cache blocks so the WAL is never
//! trimmed past an unacknowledged request.
//!
//! Per-stream calls to `before`/`after` must not run concurrently (the
//! storage layer serializes them with striped callback locks); calls for
//! different streams may.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use crate::request::WalWriteRequest;

/// Sentinel confirm offset before any request has been acknowledged.
pub(crate) const NOOP_OFFSET: i64 = -1;

pub(crate) struct CallbackSequencer {
    streams: DashMap<u64, StreamRequestQueue>,
    wal_confirm_offset: AtomicI64,
}

impl CallbackSequencer {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            wal_confirm_offset: AtomicI64::new(NOOP_OFFSET),
        }
    }

    /// Register a request on the tail of its stream's queue, after its WAL
    /// offset has been assigned. Per stream, calls must be made in
    /// increasing WAL-offset order.
    pub fn before(&self, request: &Arc<WalWriteRequest>) {
        self.streams
            .entry(request.record().stream_id())
            .or_insert_with(|| {
                StreamRequestQueue::new(self.wal_confirm_offset.load(Ordering::Acquire))
            })
            .push(request.clone());
    }

    /// Mark `request` persisted and pop the maximal persisted prefix of its
    /// stream's queue. Empty unless `request` was the head.
    pub fn after(&self, request: &Arc<WalWriteRequest>) -> Vec<Arc<WalWriteRequest>> {
        request.mark_persisted();
        let Some(mut queue) = self.streams.get_mut(&request.record().stream_id()) else {
            return Vec::new();
        };
        queue.pop_persisted_prefix(request.wal_offset())
    }

    /// Inclusive WAL offset below which no unacknowledged request exists.
    pub fn wal_confirm_offset(&self) -> i64 {
        if let Some(min) = self.streams.iter().map(|q| q.confirm_offset).min() {
            self.wal_confirm_offset.store(min, Ordering::Release);
        }
        self.wal_confirm_offset.load(Ordering::Acquire)
    }

    /// Drop a request that will never persist, together with everything
    /// queued behind it on the same stream: once a record is lost, the
    /// records after it would leave a gap in the cache. Returns the removed
    /// successors so the caller can fail their futures too.
    pub fn discard_failed(&self, request: &Arc<WalWriteRequest>) -> Vec<Arc<WalWriteRequest>> {
        let Some(mut queue) = self.streams.get_mut(&request.record().stream_id()) else {
            return Vec::new();
        };
        queue.remove_from(request)
    }

    /// Drop the stream's queue if it has no in-flight requests.
    pub fn try_free(&self, stream_id: u64) {
        self.streams.remove_if(&stream_id, |_, q| q.is_empty());
    }
}

/// In-flight requests of one stream, ordered by WAL offset.
struct StreamRequestQueue {
    queue: VecDeque<Arc<WalWriteRequest>>,
    /// Highest WAL offset popped from this queue.
    confirm_offset: i64,
}

impl StreamRequestQueue {
    fn new(confirm_offset: i64) -> Self {
        Self {
            queue: VecDeque::new(),
            confirm_offset,
        }
    }

    fn push(&mut self, request: Arc<WalWriteRequest>) {
        self.queue.push_back(request);
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop the run of persisted requests at the head, provided the head is
    /// the request acknowledged at `offset`.
    fn pop_persisted_prefix(&mut self, offset: i64) -> Vec<Arc<WalWriteRequest>> {
        match self.queue.front() {
            Some(head) if head.wal_offset() == offset => {}
            _ => return Vec::new(),
        }

        let mut popped = Vec::new();
        let mut confirm = self.confirm_offset;
        while self.queue.front().is_some_and(|head| head.persisted()) {
            if let Some(head) = self.queue.pop_front() {
                confirm = head.wal_offset();
                popped.push(head);
            }
        }
        self.confirm_offset = confirm;
        popped
    }

    /// Remove `request` and everything behind it. Returns the successors;
    /// the caller still owns the removed request itself.
    fn remove_from(&mut self, request: &Arc<WalWriteRequest>) -> Vec<Arc<WalWriteRequest>> {
        let Some(index) = self.queue.iter().position(|r| Arc::ptr_eq(r, request)) else {
            return Vec::new();
        };
        let mut tail = self.queue.split_off(index);
        tail.pop_front();
        tail.into_iter().collect()
    }
}
