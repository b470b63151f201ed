//! Write-Ahead Log Contract
//!
//! The storage core does not implement a WAL device; it drives one through
//! the [`WriteAheadLog`] trait. The device owns durability and offset
//! assignment:
//!
//! - `append` assigns a strictly increasing offset *synchronously* (so the
//!   caller can register the request for in-order acknowledgement before the
//!   write lands) and returns a future that resolves once the bytes are
//!   durable. Acks may resolve in any order across concurrent appends.
//! - `recover` replays everything after the trimmed prefix, in offset order.
//! - `trim` discards all records at or below the given offset. The storage
//!   core only trims up to offsets whose records have been committed to
//!   remote objects.
//! - Over-capacity is a distinguished, transient error: the caller force
//!   flushes the cache and retries.
//!
//! [`MemoryWal`] is the bundled in-process implementation, used by the test
//! suite and by single-process setups that do not need crash durability.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum WalError {
    /// The device is out of space. Transient: flushing the cache trims the
    /// WAL and makes room.
    #[error("wal over capacity")]
    OverCapacity,

    #[error("wal is closed")]
    Closed,

    #[error("wal i/o error: {0}")]
    Io(String),
}

/// Outcome of a WAL append: the offset assigned to the record and the
/// durability acknowledgement.
pub struct WalAppendHandle {
    pub offset: u64,
    pub ack: oneshot::Receiver<Result<(), WalError>>,
}

/// A record replayed from the WAL during recovery.
#[derive(Debug, Clone)]
pub struct RecoveredRecord {
    pub offset: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    /// Open the device. Must be called before `append` or `recover`.
    fn start(&self) -> Result<(), WalError>;

    /// Append a record. The offset is assigned before this returns; the ack
    /// resolves once the record is durable.
    fn append(&self, data: Bytes) -> Result<WalAppendHandle, WalError>;

    /// Replay all records after the trimmed prefix, in offset order.
    fn recover(&self) -> Box<dyn Iterator<Item = RecoveredRecord> + Send>;

    /// Drop all content. Used after recovery has re-uploaded surviving
    /// records.
    async fn reset(&self) -> Result<(), WalError>;

    /// Discard records at or below `offset`.
    fn trim(&self, offset: u64);

    /// Flush and close. Pending acks still resolve.
    fn shutdown_gracefully(&self);
}

/// In-memory WAL with slot offsets and immediate durability acks.
pub struct MemoryWal {
    capacity: u64,
    state: Mutex<MemoryWalState>,
}

struct MemoryWalState {
    started: bool,
    next_offset: u64,
    size: u64,
    entries: VecDeque<(u64, Bytes)>,
    trim_offset: i64,
}

impl MemoryWal {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemoryWalState {
                started: false,
                next_offset: 0,
                size: 0,
                entries: VecDeque::new(),
                trim_offset: -1,
            }),
        }
    }

    /// Highest offset discarded by `trim`, or -1 if never trimmed.
    pub fn trim_offset(&self) -> i64 {
        self.state.lock().unwrap().trim_offset
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}

#[async_trait]
impl WriteAheadLog for MemoryWal {
    fn start(&self) -> Result<(), WalError> {
        self.state.lock().unwrap().started = true;
        Ok(())
    }

    fn append(&self, data: Bytes) -> Result<WalAppendHandle, WalError> {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return Err(WalError::Closed);
        }
        if state.size + data.len() as u64 > self.capacity {
            return Err(WalError::OverCapacity);
        }
        let offset = state.next_offset;
        state.next_offset += 1;
        state.size += data.len() as u64;
        state.entries.push_back((offset, data));

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Ok(WalAppendHandle { offset, ack: rx })
    }

    fn recover(&self) -> Box<dyn Iterator<Item = RecoveredRecord> + Send> {
        let entries: Vec<RecoveredRecord> = self
            .state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|(offset, data)| RecoveredRecord {
                offset: *offset,
                data: data.clone(),
            })
            .collect();
        Box::new(entries.into_iter())
    }

    async fn reset(&self) -> Result<(), WalError> {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.size = 0;
        Ok(())
    }

    fn trim(&self, offset: u64) {
        let mut state = self.state.lock().unwrap();
        loop {
            let len = match state.entries.front() {
                Some((head, data)) if *head <= offset => data.len() as u64,
                _ => break,
            };
            state.size -= len;
            state.entries.pop_front();
        }
        state.trim_offset = state.trim_offset.max(offset as i64);
    }

    fn shutdown_gracefully(&self) {
        self.state.lock().unwrap().started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_assigns_slot_offsets() {
        let wal = MemoryWal::new(1024);
        wal.start().unwrap();
        for expected in 0..5u64 {
            let handle = wal.append(Bytes::from("abc")).unwrap();
            assert_eq!(handle.offset, expected);
            handle.ack.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_recover_returns_untrimmed_entries() {
        let wal = MemoryWal::new(1024);
        wal.start().unwrap();
        for _ in 0..4 {
            wal.append(Bytes::from("data")).unwrap();
        }
        wal.trim(1);
        let offsets: Vec<u64> = wal.recover().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(wal.trim_offset(), 1);
    }

    #[tokio::test]
    async fn test_over_capacity() {
        let wal = MemoryWal::new(10);
        wal.start().unwrap();
        wal.append(Bytes::from("12345678")).unwrap();
        assert!(matches!(
            wal.append(Bytes::from("overflow")),
            Err(WalError::OverCapacity)
        ));
        // Trimming makes room again.
        wal.trim(0);
        assert!(wal.append(Bytes::from("overflow")).is_ok());
    }

    #[tokio::test]
    async fn test_reset_clears_but_offsets_stay_monotonic() {
        let wal = MemoryWal::new(1024);
        wal.start().unwrap();
        wal.append(Bytes::from("a")).unwrap();
        wal.append(Bytes::from("b")).unwrap();
        wal.reset().await.unwrap();
        assert_eq!(wal.entry_count(), 0);
        let handle = wal.append(Bytes::from("c")).unwrap();
        assert_eq!(handle.offset, 2);
    }

    #[test]
    fn test_append_before_start() {
        let wal = MemoryWal::new(1024);
        assert!(matches!(
            wal.append(Bytes::from("x")),
            Err(WalError::Closed)
        ));
    }
}
