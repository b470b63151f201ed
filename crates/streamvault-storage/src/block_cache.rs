//! Remote Block Cache Contract
//!
//! Reads that miss the log cache fall back to the block cache: the component
//! that serves records out of committed remote objects (downloading and
//! caching object ranges as needed). The storage core only consumes its read
//! contract; fetching, eviction, and readahead are the implementation's
//! business.

use async_trait::async_trait;
use dashmap::DashMap;
use streamvault_core::StreamRecord;

use crate::error::Result;

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccessType {
    /// Served entirely out of the log cache.
    WalCacheHit,
    /// The remote portion was resident in the block cache.
    BlockCacheHit,
    /// The remote portion required an object fetch.
    BlockCacheMiss,
}

/// An ordered, contiguous slice of records returned by a read.
#[derive(Debug)]
pub struct ReadDataBlock {
    pub records: Vec<StreamRecord>,
    pub access_type: CacheAccessType,
}

impl ReadDataBlock {
    pub fn new(records: Vec<StreamRecord>, access_type: CacheAccessType) -> Self {
        Self {
            records,
            access_type,
        }
    }

    /// Total encoded bytes across the returned records.
    pub fn size(&self) -> usize {
        self.records.iter().map(|r| r.size()).sum()
    }
}

#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Read records of `stream_id` in `[start_offset, end_offset)`, up to
    /// `max_bytes` (the record crossing the budget is included).
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock>;
}

/// Block cache over a preloaded in-memory record set. Test double standing in
/// for an object-backed implementation.
#[derive(Default)]
pub struct MemoryBlockCache {
    records: DashMap<u64, Vec<StreamRecord>>,
}

impl MemoryBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload records for a stream; must be called in offset order.
    pub fn put(&self, record: StreamRecord) {
        self.records
            .entry(record.stream_id())
            .or_default()
            .push(record);
    }
}

#[async_trait]
impl BlockCache for MemoryBlockCache {
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        let mut records = Vec::new();
        let mut size = 0usize;
        if let Some(stream_records) = self.records.get(&stream_id) {
            for record in stream_records.iter() {
                if record.last_offset() < start_offset {
                    continue;
                }
                if record.base_offset() >= end_offset {
                    break;
                }
                if size >= max_bytes {
                    break;
                }
                size += record.size();
                records.push(record.clone());
            }
        }
        let access_type = if records.is_empty() {
            CacheAccessType::BlockCacheMiss
        } else {
            CacheAccessType::BlockCacheHit
        };
        Ok(ReadDataBlock::new(records, access_type))
    }
}
