//! Object Manager Contract
//!
//! Remote objects become visible to readers only after their manifests are
//! committed through the object manager - the metadata service that owns the
//! object id space. The two-step protocol is what lets the upload pipeline
//! guarantee a monotone object sequence:
//!
//! 1. `prepare` reserves a contiguous id range with a TTL. Ids are allocated
//!    strictly in call order, so the pipeline's serialized prepare stage maps
//!    earlier cache blocks to smaller ids.
//! 2. `commit_wal_object` atomically publishes a stream-set object together
//!    with any stream objects split out of the same cache block. An id whose
//!    TTL expires without a commit is garbage collected by the manager.
//!
//! `commit_stream_object` publishes a standalone stream object built from
//! already-committed source objects; it belongs to the same contract even
//! though the delta WAL path never aggregates existing objects itself.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Manifest of a stream-set object: one remote object holding contiguous
/// record ranges for several streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub object_id: u64,
    /// Object size in bytes.
    pub size: u64,
    /// Per-stream offset ranges, ordered by stream id.
    pub ranges: Vec<StreamRange>,
}

/// The offset range `[start_offset, end_offset)` a stream occupies inside an
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRange {
    pub stream_id: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Manifest of a stream object: one remote object holding a single stream's
/// records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamObjectManifest {
    pub object_id: u64,
    pub stream_id: u64,
    pub start_offset: u64,
    pub end_offset: u64,
    pub size: u64,
}

/// Commit request for one uploaded cache block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalObjectRequest {
    /// The stream-set object, if any streams were aggregated.
    pub object: Option<ObjectManifest>,
    /// Stream objects split out of the block.
    pub stream_objects: Vec<StreamObjectManifest>,
    /// Ids of source objects superseded by this commit (compaction only;
    /// always empty on the delta WAL path).
    pub compacted_object_ids: Vec<u64>,
}

#[async_trait]
pub trait ObjectManager: Send + Sync {
    /// Reserve `object_count` contiguous ids; returns the first. Uncommitted
    /// ids expire after `ttl_ms`.
    async fn prepare(&self, object_count: u32, ttl_ms: u64) -> Result<u64>;

    /// Atomically publish a stream-set object and its split stream objects.
    async fn commit_wal_object(&self, request: WalObjectRequest) -> Result<()>;

    /// Publish a stream object aggregated from committed source objects.
    async fn commit_stream_object(
        &self,
        manifest: StreamObjectManifest,
        source_object_ids: Vec<u64>,
    ) -> Result<()>;
}

/// Key of an object's content in the object store.
pub fn object_key(object_id: u64) -> object_store::path::Path {
    object_store::path::Path::from(format!("data/{:020}", object_id))
}

/// In-memory object manager: a process-local id counter and a commit journal.
#[derive(Default)]
pub struct MemoryObjectManager {
    next_object_id: AtomicU64,
    committed: Mutex<Vec<WalObjectRequest>>,
}

impl MemoryObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits observed so far, in commit order.
    pub fn committed(&self) -> Vec<WalObjectRequest> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectManager for MemoryObjectManager {
    async fn prepare(&self, object_count: u32, _ttl_ms: u64) -> Result<u64> {
        Ok(self
            .next_object_id
            .fetch_add(object_count as u64, Ordering::AcqRel))
    }

    async fn commit_wal_object(&self, request: WalObjectRequest) -> Result<()> {
        self.committed.lock().unwrap().push(request);
        Ok(())
    }

    async fn commit_stream_object(
        &self,
        manifest: StreamObjectManifest,
        _source_object_ids: Vec<u64>,
    ) -> Result<()> {
        self.committed.lock().unwrap().push(WalObjectRequest {
            object: None,
            stream_objects: vec![manifest],
            compacted_object_ids: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_allocates_contiguous_ranges() {
        let manager = MemoryObjectManager::new();
        let first = manager.prepare(3, 1000).await.unwrap();
        let second = manager.prepare(1, 1000).await.unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 3);
    }

    #[tokio::test]
    async fn test_commit_journal_preserves_order() {
        let manager = MemoryObjectManager::new();
        for object_id in 0..3 {
            manager
                .commit_wal_object(WalObjectRequest {
                    object: Some(ObjectManifest {
                        object_id,
                        size: 10,
                        ranges: Vec::new(),
                    }),
                    stream_objects: Vec::new(),
                    compacted_object_ids: Vec::new(),
                })
                .await
                .unwrap();
        }
        let ids: Vec<u64> = manager
            .committed()
            .iter()
            .filter_map(|r| r.object.as_ref().map(|o| o.object_id))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_object_key_is_zero_padded() {
        assert_eq!(object_key(42).as_ref(), "data/00000000000000000042");
    }
}
