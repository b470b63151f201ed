//! Crash-recovery scenarios: startup replays the WAL, re-uploads surviving
//! records, resets the device, and closes the streams the previous process
//! left open.

use std::sync::Arc;

use bytes::Bytes;
use object_store::memory::InMemory;
use streamvault_core::StreamRecord;
use streamvault_storage::{
    DeltaStorage, Error, MemoryBlockCache, MemoryObjectManager, MemoryStreamManager, MemoryWal,
    StorageConfig, StreamMetadata, WriteAheadLog,
};

fn record(stream_id: u64, base: u64, last: u64) -> StreamRecord {
    StreamRecord::new(stream_id, base, last, Bytes::from(vec![0x5au8; 128]))
}

/// Seed a WAL with encoded records, as if a previous process crashed with
/// them unflushed.
async fn seeded_wal(records: &[StreamRecord]) -> Arc<MemoryWal> {
    let wal = Arc::new(MemoryWal::new(64 * 1024 * 1024));
    wal.start().unwrap();
    for rec in records {
        let handle = wal.append(rec.encoded()).unwrap();
        handle.ack.await.unwrap().unwrap();
    }
    wal
}

fn storage_with(
    wal: Arc<MemoryWal>,
    stream_manager: Arc<MemoryStreamManager>,
    object_manager: Arc<MemoryObjectManager>,
) -> Arc<DeltaStorage> {
    DeltaStorage::new(
        StorageConfig::default(),
        wal,
        stream_manager,
        object_manager,
        Arc::new(InMemory::new()),
        Arc::new(MemoryBlockCache::new()),
    )
}

#[tokio::test]
async fn test_recovery_uploads_surviving_records_and_closes_streams() {
    // WAL holds records [100, 105) for stream 1; the metadata service says
    // the stream is committed through 100.
    let records: Vec<StreamRecord> = (0..5).map(|i| record(1, 100 + i, 100 + i)).collect();
    let wal = seeded_wal(&records).await;

    let stream_manager = Arc::new(MemoryStreamManager::new());
    stream_manager.add_stream(StreamMetadata {
        stream_id: 1,
        epoch: 7,
        start_offset: 0,
        end_offset: 100,
    });
    let object_manager = Arc::new(MemoryObjectManager::new());
    let storage = storage_with(wal.clone(), stream_manager.clone(), object_manager.clone());

    storage.startup().await.unwrap();

    // All five records were re-uploaded in one synchronous task.
    let committed = object_manager.committed();
    assert_eq!(committed.len(), 1);
    let object = committed[0].object.as_ref().unwrap();
    assert_eq!(object.ranges.len(), 1);
    assert_eq!(object.ranges[0].stream_id, 1);
    assert_eq!(object.ranges[0].start_offset, 100);
    assert_eq!(object.ranges[0].end_offset, 105);

    // The WAL was reset and the stream closed.
    assert_eq!(wal.entry_count(), 0);
    assert_eq!(stream_manager.closed(), vec![1]);

    storage.shutdown().await;
}

#[tokio::test]
async fn test_recovery_skips_committed_and_closed_stream_records() {
    // Stream 1 is open with end offset 100: its records below 100 are
    // already committed. Stream 9 is not open at all.
    let records = vec![
        record(1, 98, 98),
        record(1, 99, 99),
        record(1, 100, 100),
        record(9, 0, 0),
    ];
    let wal = seeded_wal(&records).await;

    let stream_manager = Arc::new(MemoryStreamManager::new());
    stream_manager.add_stream(StreamMetadata {
        stream_id: 1,
        epoch: 1,
        start_offset: 0,
        end_offset: 100,
    });
    let object_manager = Arc::new(MemoryObjectManager::new());
    let storage = storage_with(wal, stream_manager, object_manager.clone());

    storage.startup().await.unwrap();

    let committed = object_manager.committed();
    assert_eq!(committed.len(), 1);
    let object = committed[0].object.as_ref().unwrap();
    assert_eq!(
        object.ranges.iter().map(|r| r.stream_id).collect::<Vec<_>>(),
        vec![1]
    );
    assert_eq!(object.ranges[0].start_offset, 100);
    assert_eq!(object.ranges[0].end_offset, 101);

    storage.shutdown().await;
}

#[tokio::test]
async fn test_recovery_gap_aborts_startup() {
    // The WAL starts at 101 but the stream is only committed through 100:
    // offset 100 is lost. Recovery must refuse to proceed.
    let records: Vec<StreamRecord> = (0..4).map(|i| record(1, 101 + i, 101 + i)).collect();
    let wal = seeded_wal(&records).await;

    let stream_manager = Arc::new(MemoryStreamManager::new());
    stream_manager.add_stream(StreamMetadata {
        stream_id: 1,
        epoch: 1,
        start_offset: 0,
        end_offset: 100,
    });
    let object_manager = Arc::new(MemoryObjectManager::new());
    let storage = storage_with(wal.clone(), stream_manager.clone(), object_manager.clone());

    let err = storage.startup().await.unwrap_err();
    assert!(matches!(
        err,
        Error::RecoveryGap {
            stream_id: 1,
            expected: 100,
            actual: 101,
        }
    ));

    // Nothing was published and nothing was closed.
    assert!(object_manager.committed().is_empty());
    assert!(stream_manager.closed().is_empty());

    storage.shutdown().await;
}

#[tokio::test]
async fn test_recovery_with_empty_wal_closes_streams() {
    let wal = Arc::new(MemoryWal::new(1024 * 1024));
    let stream_manager = Arc::new(MemoryStreamManager::new());
    for stream_id in [1u64, 2] {
        stream_manager.add_stream(StreamMetadata {
            stream_id,
            epoch: 1,
            start_offset: 0,
            end_offset: 10,
        });
    }
    let object_manager = Arc::new(MemoryObjectManager::new());
    let storage = storage_with(wal, stream_manager.clone(), object_manager.clone());

    storage.startup().await.unwrap();

    assert!(object_manager.committed().is_empty());
    let mut closed = stream_manager.closed();
    closed.sort_unstable();
    assert_eq!(closed, vec![1, 2]);

    storage.shutdown().await;
}
