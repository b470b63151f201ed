//! Stream Manager Contract
//!
//! The stream manager is the metadata service that knows which streams are
//! open on this node and how far each has been committed. Recovery uses it in
//! two ways: the committed end offsets filter already-uploaded records out of
//! the WAL replay, and every stream left open by the previous process is
//! closed once the surviving records are safely re-uploaded.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

/// Metadata of one open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetadata {
    pub stream_id: u64,
    pub epoch: u64,
    pub start_offset: u64,
    /// Offset up to which records are committed to remote objects
    /// (exclusive).
    pub end_offset: u64,
}

#[async_trait]
pub trait StreamManager: Send + Sync {
    /// Streams currently open on this node.
    async fn get_opening_streams(&self) -> Result<Vec<StreamMetadata>>;

    /// Close a stream at the given epoch.
    async fn close_stream(&self, stream_id: u64, epoch: u64) -> Result<()>;
}

/// In-memory stream manager for tests and single-process setups.
#[derive(Default)]
pub struct MemoryStreamManager {
    streams: Mutex<HashMap<u64, StreamMetadata>>,
    closed: Mutex<Vec<u64>>,
}

impl MemoryStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&self, metadata: StreamMetadata) {
        self.streams
            .lock()
            .unwrap()
            .insert(metadata.stream_id, metadata);
    }

    /// Ids of streams closed so far, in close order.
    pub fn closed(&self) -> Vec<u64> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamManager for MemoryStreamManager {
    async fn get_opening_streams(&self) -> Result<Vec<StreamMetadata>> {
        let mut streams: Vec<StreamMetadata> =
            self.streams.lock().unwrap().values().copied().collect();
        streams.sort_by_key(|s| s.stream_id);
        Ok(streams)
    }

    async fn close_stream(&self, stream_id: u64, _epoch: u64) -> Result<()> {
        self.streams.lock().unwrap().remove(&stream_id);
        self.closed.lock().unwrap().push(stream_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_then_close() {
        let manager = MemoryStreamManager::new();
        manager.add_stream(StreamMetadata {
            stream_id: 3,
            epoch: 1,
            start_offset: 0,
            end_offset: 100,
        });
        manager.add_stream(StreamMetadata {
            stream_id: 1,
            epoch: 1,
            start_offset: 0,
            end_offset: 50,
        });

        let open = manager.get_opening_streams().await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].stream_id, 1);

        manager.close_stream(3, 1).await.unwrap();
        assert_eq!(manager.get_opening_streams().await.unwrap().len(), 1);
        assert_eq!(manager.closed(), vec![3]);
    }
}
