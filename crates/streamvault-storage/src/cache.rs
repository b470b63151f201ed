//! Log Cache - Two-Generation Record Cache
//!
//! Every record acknowledged by the WAL is inserted here before its append
//! future completes, so the cache always holds the tail of every stream that
//! has not yet reached a remote object. It serves two masters:
//!
//! - **Reads**: the freshest records are only available here; the read path
//!   consults the cache before falling back to the remote block cache.
//! - **Flushes**: records leave the process grouped by cache block. When the
//!   active block crosses the upload threshold it is rotated out ("archived")
//!   and handed to the upload pipeline as one immutable unit.
//!
//! ## Generations
//!
//! ```text
//!            put()                    archive                  mark_free
//! records ─────────▶ ACTIVE block ─────────────▶ ARCHIVED ─────────────▶ FREED
//!                    (mutable)      (immutable, awaiting upload)   (records dropped)
//! ```
//!
//! At most one block is ACTIVE. Archived blocks remain readable until their
//! upload commits; ordering is by creation, and uploads commit in the same
//! order, so the archived list is always freed from the front.
//!
//! ## Contiguity
//!
//! The callback sequencer only releases records to the cache in per-stream
//! offset order, so within a block each stream's list is strictly contiguous
//! and append-only. Across blocks, a stream's records stay contiguous because
//! blocks are freed oldest-first. `get` exploits this: it scans blocks in
//! creation order and serves the longest contiguous run inside the byte
//! budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use streamvault_core::StreamRecord;

/// Offset sentinel meaning "nothing confirmed yet".
pub const NO_CONFIRM_OFFSET: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Active,
    Archived,
    Freed,
}

/// One generation of the cache.
#[derive(Debug)]
pub struct LogCacheBlock {
    max_size: u64,
    max_stream_count: usize,
    records: DashMap<u64, Vec<StreamRecord>>,
    size: AtomicU64,
    confirm_offset: AtomicI64,
    state: Mutex<BlockState>,
}

impl LogCacheBlock {
    pub fn new(max_size: u64, max_stream_count: usize) -> Self {
        Self {
            max_size,
            max_stream_count,
            records: DashMap::new(),
            size: AtomicU64::new(0),
            confirm_offset: AtomicI64::new(NO_CONFIRM_OFFSET),
            state: Mutex::new(BlockState::Active),
        }
    }

    /// Insert a record. Per-stream calls must be made in offset order (the
    /// callback sequencer guarantees this). Returns true when the block is
    /// full - by byte size or by distinct stream count - and should be
    /// rotated out.
    pub fn put(&self, record: StreamRecord) -> bool {
        let bytes = record.size() as u64;
        self.records
            .entry(record.stream_id())
            .or_default()
            .push(record);
        let new_size = self.size.fetch_add(bytes, Ordering::AcqRel) + bytes;
        new_size >= self.max_size || self.records.len() > self.max_stream_count
    }

    /// Snapshot of one stream's records, in offset order.
    pub fn stream_records(&self, stream_id: u64) -> Vec<StreamRecord> {
        self.records
            .get(&stream_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Snapshot of all records, ordered by stream id.
    pub fn records(&self) -> Vec<(u64, Vec<StreamRecord>)> {
        let mut all: Vec<(u64, Vec<StreamRecord>)> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by_key(|(stream_id, _)| *stream_id);
        all
    }

    pub fn contains_stream(&self, stream_id: u64) -> bool {
        self.records.contains_key(&stream_id)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// WAL offset through which every record in this block is durable.
    pub fn confirm_offset(&self) -> i64 {
        self.confirm_offset.load(Ordering::Acquire)
    }

    pub fn set_confirm_offset(&self, offset: i64) {
        self.confirm_offset.store(offset, Ordering::Release);
    }

    pub fn state(&self) -> BlockState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: BlockState) {
        *self.state.lock().unwrap() = state;
    }

    fn clear(&self) {
        self.records.clear();
        self.size.store(0, Ordering::Release);
    }
}

struct Blocks {
    /// Archived blocks awaiting upload, oldest first.
    archived: VecDeque<Arc<LogCacheBlock>>,
    active: Arc<LogCacheBlock>,
}

/// The two-generation record cache.
pub struct LogCache {
    block_max_size: u64,
    max_block_stream_count: usize,
    blocks: Mutex<Blocks>,
    size: AtomicU64,
    confirm_offset: AtomicI64,
}

impl LogCache {
    pub fn new(block_max_size: u64, max_block_stream_count: usize) -> Self {
        Self {
            block_max_size,
            max_block_stream_count,
            blocks: Mutex::new(Blocks {
                archived: VecDeque::new(),
                active: Arc::new(LogCacheBlock::new(block_max_size, max_block_stream_count)),
            }),
            size: AtomicU64::new(0),
            confirm_offset: AtomicI64::new(NO_CONFIRM_OFFSET),
        }
    }

    /// Insert into the active block. Returns true when the insert filled the
    /// block and the caller should initiate an upload.
    pub fn put(&self, record: StreamRecord) -> bool {
        let active = self.blocks.lock().unwrap().active.clone();
        self.size.fetch_add(record.size() as u64, Ordering::AcqRel);
        active.put(record)
    }

    /// The longest contiguous run of cached records for `stream_id` starting
    /// at or after `start_offset`, bounded by `end_offset` (exclusive) and
    /// `max_bytes` (the record crossing the budget is included).
    ///
    /// A result whose first record starts after `start_offset` signals a
    /// partial hit: the reader fetches the head from remote storage.
    pub fn get(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Vec<StreamRecord> {
        let blocks: Vec<Arc<LogCacheBlock>> = {
            let blocks = self.blocks.lock().unwrap();
            blocks
                .archived
                .iter()
                .cloned()
                .chain(std::iter::once(blocks.active.clone()))
                .collect()
        };

        let mut result: Vec<StreamRecord> = Vec::new();
        let mut size = 0usize;
        'blocks: for block in blocks {
            for record in block.stream_records(stream_id) {
                if record.last_offset() < start_offset {
                    continue;
                }
                if record.base_offset() >= end_offset {
                    break 'blocks;
                }
                if let Some(prev) = result.last() {
                    // Serve the contiguous prefix only.
                    if prev.last_offset() + 1 != record.base_offset() {
                        break 'blocks;
                    }
                }
                if size >= max_bytes {
                    break 'blocks;
                }
                size += record.size();
                result.push(record);
            }
        }
        result
    }

    /// Record the WAL confirm offset; it is stamped onto the active block
    /// when the block is archived.
    pub fn set_confirm_offset(&self, offset: i64) {
        self.confirm_offset.store(offset, Ordering::Release);
    }

    /// Rotate the active block out if it holds any record of `stream_id`
    /// (or any record at all when `None`). The archived block carries the
    /// confirm offset last recorded via [`set_confirm_offset`].
    pub fn archive_current_if_contains(
        &self,
        stream_id: Option<u64>,
    ) -> Option<Arc<LogCacheBlock>> {
        let mut blocks = self.blocks.lock().unwrap();
        let matches = match stream_id {
            Some(id) => blocks.active.contains_stream(id),
            None => blocks.active.size() > 0,
        };
        if !matches {
            return None;
        }
        let archived = std::mem::replace(
            &mut blocks.active,
            Arc::new(LogCacheBlock::new(
                self.block_max_size,
                self.max_block_stream_count,
            )),
        );
        archived.set_state(BlockState::Archived);
        archived.set_confirm_offset(self.confirm_offset.load(Ordering::Acquire));
        blocks.archived.push_back(archived.clone());
        Some(archived)
    }

    /// Free an archived block after its upload commits, dropping its records.
    pub fn mark_free(&self, block: &Arc<LogCacheBlock>) {
        {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.archived.retain(|b| !Arc::ptr_eq(b, block));
        }
        self.free_block(block);
    }

    /// Free the oldest archived blocks until `bytes` have been reclaimed or
    /// no archived block remains. Returns the bytes actually freed.
    pub fn force_free(&self, bytes: u64) -> u64 {
        let mut freed = 0u64;
        while freed < bytes {
            let block = self.blocks.lock().unwrap().archived.pop_front();
            let Some(block) = block else {
                break;
            };
            freed += block.size();
            self.free_block(&block);
        }
        freed
    }

    fn free_block(&self, block: &Arc<LogCacheBlock>) {
        let bytes = block.size();
        block.set_state(BlockState::Freed);
        block.clear();
        self.size.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Total bytes across the active and archived blocks.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}
