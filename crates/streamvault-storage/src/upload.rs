//! Delta Upload Task
//!
//! Turns one archived cache block into remote objects:
//!
//! 1. **Plan** (at construction): streams whose bytes in the block reach the
//!    split threshold get their own stream object; everything else aggregates
//!    into a single stream-set object.
//! 2. **Prepare**: reserve one object id per planned object from the object
//!    manager. Ids are contiguous and the stream-set object takes the first.
//! 3. **Upload**: PUT each object's bytes to the object store, bounded by the
//!    shared I/O semaphore.
//! 4. **Commit**: await every PUT, then publish all manifests atomically
//!    through the object manager.
//!
//! Object data is the concatenation of the records' wire encodings, which are
//! already materialized (records are encoded before WAL admission), so
//! building an object is a buffer copy, never a re-encode.
//!
//! A task is re-runnable after a failure: `prepare` reserves fresh ids,
//! `launch_uploads` re-PUTs only the parts that have not succeeded. The
//! pipeline in [`crate::storage`] relies on this to retry a failed task in
//! place without giving up its queue position.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use object_store::ObjectStore;
use streamvault_core::StreamRecord;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::objects::{
    object_key, ObjectManager, ObjectManifest, StreamObjectManifest, StreamRange, WalObjectRequest,
};

const NO_OBJECT_ID: i64 = -1;

/// A contiguous run of one stream's records, ready for upload.
struct StreamBatch {
    stream_id: u64,
    start_offset: u64,
    /// Exclusive.
    end_offset: u64,
    size: u64,
    records: Vec<StreamRecord>,
}

impl StreamBatch {
    fn from_records(stream_id: u64, records: Vec<StreamRecord>) -> Option<Self> {
        let first = records.first()?;
        let last = records.last()?;
        let (start_offset, end_offset) = (first.base_offset(), last.end_offset());
        let size = records.iter().map(|r| r.size() as u64).sum();
        Some(Self {
            stream_id,
            start_offset,
            end_offset,
            size,
            records,
        })
    }

    fn encode(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(self.size as usize);
        for record in &self.records {
            data.extend_from_slice(&record.encoded());
        }
        data.freeze()
    }
}

/// One remote object being written.
struct UploadPart {
    object_id: u64,
    kind: PartKind,
    data: Bytes,
    uploaded: AtomicBool,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

enum PartKind {
    StreamSet { ranges: Vec<StreamRange> },
    Stream { range: StreamRange },
}

/// Upload of one archived cache block.
pub(crate) struct DeltaUploadTask {
    stream_set: Vec<StreamBatch>,
    split: Vec<StreamBatch>,
    object_manager: Arc<dyn ObjectManager>,
    object_store: Arc<dyn ObjectStore>,
    io_permits: Arc<Semaphore>,
    prepare_ttl_ms: u64,
    first_object_id: AtomicI64,
    parts: Mutex<Vec<Arc<UploadPart>>>,
}

/// Commit failures carry how far the task got: an upload error is retriable,
/// a publish error is not (the object manager may have applied it).
pub(crate) enum CommitError {
    Upload(Error),
    Publish(Error),
}

impl CommitError {
    pub fn into_error(self) -> Error {
        match self {
            CommitError::Upload(e) | CommitError::Publish(e) => e,
        }
    }
}

impl DeltaUploadTask {
    /// Plan the upload of `records` (one entry per stream, offset-ordered).
    pub fn new(
        records: Vec<(u64, Vec<StreamRecord>)>,
        split_threshold: u64,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        io_permits: Arc<Semaphore>,
        prepare_ttl_ms: u64,
    ) -> Self {
        let mut stream_set = Vec::new();
        let mut split = Vec::new();
        for (stream_id, stream_records) in records {
            if let Some(batch) = StreamBatch::from_records(stream_id, stream_records) {
                if batch.size >= split_threshold {
                    split.push(batch);
                } else {
                    stream_set.push(batch);
                }
            }
        }
        Self {
            stream_set,
            split,
            object_manager,
            object_store,
            io_permits,
            prepare_ttl_ms,
            first_object_id: AtomicI64::new(NO_OBJECT_ID),
            parts: Mutex::new(Vec::new()),
        }
    }

    fn object_count(&self) -> u32 {
        (!self.stream_set.is_empty()) as u32 + self.split.len() as u32
    }

    /// Reserve object ids. Retrying after a failure reserves a fresh range.
    pub async fn prepare(&self) -> Result<()> {
        let count = self.object_count();
        if count == 0 {
            return Ok(());
        }
        let first = self
            .object_manager
            .prepare(count, self.prepare_ttl_ms)
            .await?;
        self.first_object_id.store(first as i64, Ordering::Release);
        Ok(())
    }

    /// Start the object PUTs. Parts that already uploaded (from a previous
    /// attempt) are skipped.
    pub fn launch_uploads(&self) {
        let mut parts = self.parts.lock().unwrap();
        if parts.is_empty() {
            *parts = self.build_parts();
        }
        for part in parts.iter() {
            if part.uploaded.load(Ordering::Acquire) {
                continue;
            }
            let mut handle = part.handle.lock().unwrap();
            if handle.is_none() {
                *handle = Some(self.spawn_part(part.clone()));
            }
        }
    }

    /// Await the uploads, then publish every manifest in one atomic commit.
    pub async fn commit(&self) -> std::result::Result<(), CommitError> {
        self.await_uploads().await.map_err(CommitError::Upload)?;
        if self.object_count() == 0 {
            return Ok(());
        }
        let request = self.wal_object_request();
        self.object_manager
            .commit_wal_object(request)
            .await
            .map_err(CommitError::Publish)?;
        Ok(())
    }

    fn build_parts(&self) -> Vec<Arc<UploadPart>> {
        let first = self.first_object_id.load(Ordering::Acquire);
        if first < 0 {
            return Vec::new();
        }
        let mut next_id = first as u64;
        let mut parts = Vec::new();

        if !self.stream_set.is_empty() {
            let mut data = BytesMut::new();
            let mut ranges = Vec::with_capacity(self.stream_set.len());
            for batch in &self.stream_set {
                data.extend_from_slice(&batch.encode());
                ranges.push(StreamRange {
                    stream_id: batch.stream_id,
                    start_offset: batch.start_offset,
                    end_offset: batch.end_offset,
                });
            }
            parts.push(Arc::new(UploadPart {
                object_id: next_id,
                kind: PartKind::StreamSet { ranges },
                data: data.freeze(),
                uploaded: AtomicBool::new(false),
                handle: Mutex::new(None),
            }));
            next_id += 1;
        }

        for batch in &self.split {
            parts.push(Arc::new(UploadPart {
                object_id: next_id,
                kind: PartKind::Stream {
                    range: StreamRange {
                        stream_id: batch.stream_id,
                        start_offset: batch.start_offset,
                        end_offset: batch.end_offset,
                    },
                },
                data: batch.encode(),
                uploaded: AtomicBool::new(false),
                handle: Mutex::new(None),
            }));
            next_id += 1;
        }
        parts
    }

    fn spawn_part(&self, part: Arc<UploadPart>) -> JoinHandle<Result<()>> {
        let store = self.object_store.clone();
        let permits = self.io_permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| Error::Shutdown)?;
            store
                .put(&object_key(part.object_id), part.data.clone())
                .await?;
            part.uploaded.store(true, Ordering::Release);
            Ok(())
        })
    }

    async fn await_uploads(&self) -> Result<()> {
        let parts: Vec<Arc<UploadPart>> = self.parts.lock().unwrap().clone();
        for part in parts {
            if part.uploaded.load(Ordering::Acquire) {
                continue;
            }
            let handle = part.handle.lock().unwrap().take();
            // A part whose previous attempt failed has no live handle;
            // re-launch it.
            let handle = match handle {
                Some(handle) => handle,
                None => self.spawn_part(part.clone()),
            };
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Background(e.to_string())),
            }
        }
        Ok(())
    }

    fn wal_object_request(&self) -> WalObjectRequest {
        let parts = self.parts.lock().unwrap();
        let mut object = None;
        let mut stream_objects = Vec::new();
        for part in parts.iter() {
            match &part.kind {
                PartKind::StreamSet { ranges } => {
                    object = Some(ObjectManifest {
                        object_id: part.object_id,
                        size: part.data.len() as u64,
                        ranges: ranges.clone(),
                    });
                }
                PartKind::Stream { range } => {
                    stream_objects.push(StreamObjectManifest {
                        object_id: part.object_id,
                        stream_id: range.stream_id,
                        start_offset: range.start_offset,
                        end_offset: range.end_offset,
                        size: part.data.len() as u64,
                    });
                }
            }
        }
        WalObjectRequest {
            object,
            stream_objects,
            compacted_object_ids: Vec::new(),
        }
    }
}
