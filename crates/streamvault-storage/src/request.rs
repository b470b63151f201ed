//! In-flight append request tracking.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use streamvault_core::StreamRecord;
use tokio::sync::oneshot;

use crate::error::Result;

/// Sentinel WAL offset for a request not yet admitted.
pub(crate) const NO_WAL_OFFSET: i64 = -1;

/// One append moving through the pipeline: the record, the WAL offset it was
/// assigned at admission, the durability flag flipped by the WAL ack, and the
/// completion signal fired once the record is in the cache and acknowledged
/// in per-stream offset order.
pub(crate) struct WalWriteRequest {
    record: StreamRecord,
    wal_offset: AtomicI64,
    persisted: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl WalWriteRequest {
    pub fn new(record: StreamRecord) -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            record,
            wal_offset: AtomicI64::new(NO_WAL_OFFSET),
            persisted: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub fn record(&self) -> &StreamRecord {
        &self.record
    }

    pub fn wal_offset(&self) -> i64 {
        self.wal_offset.load(Ordering::Acquire)
    }

    pub fn set_wal_offset(&self, offset: i64) {
        self.wal_offset.store(offset, Ordering::Release);
    }

    pub fn persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    pub fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::Release);
    }

    /// Resolve the append future. Completing twice is a no-op so a late
    /// failure cannot clobber an earlier acknowledgement.
    pub fn complete(&self, result: Result<()>) {
        if let Some(tx) = self.completion.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}
