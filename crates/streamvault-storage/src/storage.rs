//! Delta WAL Storage
//!
//! [`DeltaStorage`] is the storage singleton gluing the subsystems together:
//! admission and WAL persistence, the callback sequencer, the log cache, the
//! two-stage upload pipeline, the cache/remote read merge, and startup
//! recovery.
//!
//! ## Append flow
//!
//! ```text
//! append(record)
//!     │  encode eagerly, register with sequencer
//!     ▼
//! admission ──full──▶ backoff queue ◀─────────────┐
//!     │                     │  drain every 100ms  │
//!     ▼                     └─────────────────────┘
//! wal.append() ──over capacity──▶ force flush + backoff
//!     │ ack (any order across streams)
//!     ▼
//! sequencer.after() under the stream's callback stripe
//!     │ per-stream offset-ordered prefix
//!     ▼
//! cache.put() ──block full──▶ upload pipeline
//!     │
//!     ▼
//! complete append future
//! ```
//!
//! ## Upload pipeline
//!
//! Archived cache blocks flow through two FIFO stages with at most one task
//! in flight per stage; prepare(N+1) may overlap commit(N):
//!
//! ```text
//! archive ─▶ [prepare queue] ─▶ reserve ids + start PUTs ─▶ [commit queue] ─▶ publish
//!                                                                │
//!                                              trim WAL, free the cache block
//! ```
//!
//! Because prepares run strictly in archive order and the object manager
//! allocates ids in prepare order, earlier cache blocks always become remote
//! objects with smaller ids - and commits complete in that same order, so
//! downstream consumers observe a monotone object sequence.
//!
//! A failed prepare or upload leaves the task at the head of its stage and
//! the block archived; the next flush re-pumps the stages and retries it in
//! place, preserving the ordering guarantees. Each retry re-arms the task's
//! completion and re-registers it as inflight, so the flush that triggered
//! the retry waits for the actual commit. A commit that fails after
//! publication aborts the process: with a half-published manifest, no later
//! commit could be allowed to proceed.
//!
//! ## Backpressure
//!
//! Admission fails closed once the cache reaches the soft cap: the request
//! parks in the backoff queue (its future stays pending) instead of blocking
//! a thread, and a background task retries the queue head at a fixed cadence.
//! Backpressure warnings are rate-limited to one per second.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use object_store::ObjectStore;
use streamvault_core::{codec, StreamRecord};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::block_cache::{BlockCache, CacheAccessType, ReadDataBlock};
use crate::cache::{LogCache, LogCacheBlock, NO_CONFIRM_OFFSET};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::objects::ObjectManager;
use crate::request::WalWriteRequest;
use crate::sequencer::CallbackSequencer;
use crate::streams::{StreamManager, StreamMetadata};
use crate::upload::{CommitError, DeltaUploadTask};
use crate::wal::{RecoveredRecord, WalError, WriteAheadLog};

/// Capacity of the throwaway block recovery decodes into.
const RECOVERY_BLOCK_CAPACITY: u64 = 1024 * 1024 * 1024;

type UploadOutcome = std::result::Result<(), Arc<Error>>;
type SharedUploadResult = Shared<BoxFuture<'static, UploadOutcome>>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadTaskState {
    Created,
    Prepared,
    Uploading,
    Committed,
    Failed,
}

/// Completion signal of one upload attempt. A failed task is retried in
/// place, so the channel is re-armed per attempt: each retry gets a fresh
/// future that the flush driving it can await.
struct Completion {
    tx: Option<oneshot::Sender<UploadOutcome>>,
    done: SharedUploadResult,
}

impl Completion {
    fn arm() -> Self {
        let (tx, rx) = oneshot::channel::<UploadOutcome>();
        let done = rx
            .map(|received| match received {
                Ok(outcome) => outcome,
                Err(_) => Err(Arc::new(Error::Shutdown)),
            })
            .boxed()
            .shared();
        Self { tx: Some(tx), done }
    }
}

/// One archived block moving through the upload pipeline.
struct UploadTaskContext {
    task: DeltaUploadTask,
    block: Arc<LogCacheBlock>,
    state: Mutex<UploadTaskState>,
    completion: Mutex<Completion>,
}

impl UploadTaskContext {
    fn new(block: Arc<LogCacheBlock>, task: DeltaUploadTask) -> Arc<Self> {
        Arc::new(Self {
            task,
            block,
            state: Mutex::new(UploadTaskState::Created),
            completion: Mutex::new(Completion::arm()),
        })
    }

    /// Completion future of the current attempt.
    fn done(&self) -> SharedUploadResult {
        self.completion.lock().unwrap().done.clone()
    }

    /// Replace the (consumed) completion channel before a retry, so the new
    /// attempt's outcome is observable.
    fn rearm(&self) {
        *self.completion.lock().unwrap() = Completion::arm();
    }

    fn state(&self) -> UploadTaskState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: UploadTaskState) {
        *self.state.lock().unwrap() = state;
    }

    fn complete_ok(&self) {
        self.set_state(UploadTaskState::Committed);
        if let Some(tx) = self.completion.lock().unwrap().tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Fails the current attempt's future. The task itself stays queued;
    /// the pump re-arms the completion when it retries.
    fn fail(&self, error: Arc<Error>) {
        self.set_state(UploadTaskState::Failed);
        if let Some(tx) = self.completion.lock().unwrap().tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// The delta WAL storage core.
///
/// One instance per process, created at startup with its collaborators and
/// torn down with [`shutdown`](Self::shutdown).
pub struct DeltaStorage {
    /// Back-reference for handing owned handles to spawned tasks.
    weak_self: Weak<DeltaStorage>,
    config: StorageConfig,
    wal: Arc<dyn WriteAheadLog>,
    cache: LogCache,
    sequencer: CallbackSequencer,
    stream_manager: Arc<dyn StreamManager>,
    object_manager: Arc<dyn ObjectManager>,
    object_store: Arc<dyn ObjectStore>,
    block_cache: Arc<dyn BlockCache>,

    /// Striped locks serializing per-stream WAL-ack callbacks.
    callback_locks: Vec<Mutex<()>>,
    backoff_queue: Mutex<VecDeque<Arc<WalWriteRequest>>>,

    /// Serializes confirm-offset snapshot + active block rotation.
    rotation_lock: Mutex<()>,
    prepare_queue: Mutex<VecDeque<Arc<UploadTaskContext>>>,
    commit_queue: Mutex<VecDeque<Arc<UploadTaskContext>>>,
    prepare_active: AtomicBool,
    commit_active: AtomicBool,
    inflight_uploads: Mutex<Vec<SharedUploadResult>>,
    io_permits: Arc<Semaphore>,

    drain_token: CancellationToken,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    last_backpressure_log_ms: AtomicU64,
    closed: AtomicBool,
}

impl DeltaStorage {
    pub fn new(
        config: StorageConfig,
        wal: Arc<dyn WriteAheadLog>,
        stream_manager: Arc<dyn StreamManager>,
        object_manager: Arc<dyn ObjectManager>,
        object_store: Arc<dyn ObjectStore>,
        block_cache: Arc<dyn BlockCache>,
    ) -> Arc<Self> {
        let cache = LogCache::new(
            config.wal_upload_threshold,
            config.max_stream_num_per_stream_set_object,
        );
        let callback_locks = (0..config.stream_callback_lock_stripes.max(1))
            .map(|_| Mutex::new(()))
            .collect();
        let io_permits = Arc::new(Semaphore::new(config.upload_io_pool_size.max(1)));

        let storage = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config,
            wal,
            cache,
            sequencer: CallbackSequencer::new(),
            stream_manager,
            object_manager,
            object_store,
            block_cache,
            callback_locks,
            backoff_queue: Mutex::new(VecDeque::new()),
            rotation_lock: Mutex::new(()),
            prepare_queue: Mutex::new(VecDeque::new()),
            commit_queue: Mutex::new(VecDeque::new()),
            prepare_active: AtomicBool::new(false),
            commit_active: AtomicBool::new(false),
            inflight_uploads: Mutex::new(Vec::new()),
            io_permits,
            drain_token: CancellationToken::new(),
            drain_handle: Mutex::new(None),
            last_backpressure_log_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let drain = storage.spawn_backoff_drain();
        *storage.drain_handle.lock().unwrap() = Some(drain);
        storage
    }

    /// Owned handle for spawned tasks. Valid for the storage's lifetime.
    fn shared(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("storage still referenced")
    }

    /// Replay the WAL, re-upload surviving records, and close the streams the
    /// previous process left open. Must complete before serving traffic.
    pub async fn startup(&self) -> Result<()> {
        info!("delta storage starting");
        self.recover().await?;
        info!("delta storage started");
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.wal.start()?;
        let streams = self.stream_manager.get_opening_streams().await?;
        let block = recover_continuous_records(self.wal.recover(), &streams)?;

        let recovered_end_offsets: HashMap<u64, u64> = block
            .records()
            .iter()
            .filter_map(|(stream_id, records)| {
                records.last().map(|record| (*stream_id, record.end_offset()))
            })
            .collect();

        if block.size() > 0 {
            info!(bytes = block.size(), "re-uploading unflushed wal records");
            let task = DeltaUploadTask::new(
                block.records(),
                self.config.stream_split_size,
                self.object_manager.clone(),
                self.object_store.clone(),
                self.io_permits.clone(),
                self.config.object_prepare_ttl_ms,
            );
            task.prepare().await?;
            task.launch_uploads();
            task.commit().await.map_err(CommitError::into_error)?;
        }
        self.wal.reset().await?;

        for stream in &streams {
            let end_offset = recovered_end_offsets
                .get(&stream.stream_id)
                .copied()
                .unwrap_or(stream.end_offset);
            info!(
                stream_id = stream.stream_id,
                end_offset, "closing stream after recovery"
            );
        }
        futures::future::try_join_all(
            streams
                .iter()
                .map(|s| self.stream_manager.close_stream(s.stream_id, s.epoch)),
        )
        .await?;
        Ok(())
    }

    /// Stop the backoff drain, fail parked requests, and close the WAL.
    /// Inflight appends still complete; backoff-queued ones fail with
    /// [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.drain_token.cancel();
        let drain = self.drain_handle.lock().unwrap().take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }
        let parked: Vec<Arc<WalWriteRequest>> =
            self.backoff_queue.lock().unwrap().drain(..).collect();
        if !parked.is_empty() {
            warn!(count = parked.len(), "failing backoff requests at shutdown");
        }
        for request in parked {
            request.complete(Err(Error::Shutdown));
        }
        self.wal.shutdown_gracefully();
    }

    /// Append a record to its stream.
    ///
    /// The future resolves once the record is durable in the WAL, inserted
    /// into the log cache, and every earlier record of the same stream has
    /// been acknowledged - never out of offset order within a stream.
    pub async fn append(&self, record: StreamRecord) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        // Materialize the wire form before admission; the WAL write and the
        // upload both reuse it.
        record.encoded();
        let (request, completion) = WalWriteRequest::new(record);
        self.append_to_wal(&request, false);
        completion.await.map_err(|_| Error::Shutdown)?
    }

    /// Try to hand the request to the WAL. Returns true when the request was
    /// (or stays) parked for backoff.
    fn append_to_wal(&self, request: &Arc<WalWriteRequest>, from_backoff: bool) -> bool {
        if !from_backoff && !self.backoff_queue.lock().unwrap().is_empty() {
            // Keep WAL-offset order: nothing may overtake parked requests.
            self.backoff_queue.lock().unwrap().push_back(request.clone());
            return true;
        }
        if !self.try_acquire_permit() {
            if !from_backoff {
                self.backoff_queue.lock().unwrap().push_back(request.clone());
            }
            self.log_backpressure("log cache is full, backing off appends");
            return true;
        }
        match self.wal.append(request.record().encoded()) {
            Ok(handle) => {
                request.set_wal_offset(handle.offset as i64);
                // Register for in-order acknowledgement only now that the
                // offset is known, and before the ack watcher can run.
                self.sequencer.before(request);
                let storage = self.shared();
                let request = Arc::clone(request);
                tokio::spawn(async move {
                    match handle.ack.await {
                        Ok(Ok(())) => storage.handle_append_callback(&request),
                        Ok(Err(e)) => storage.fail_persist(&request, e.into()),
                        Err(_) => storage.fail_persist(&request, Error::Shutdown),
                    }
                });
                false
            }
            Err(WalError::OverCapacity) => {
                // WAL writes are block aligned: the device can fill while the
                // active cache block is still under the upload threshold.
                let storage = self.shared();
                tokio::spawn(async move {
                    if let Err(e) = storage.force_upload(None).await {
                        warn!(error = %e, "force upload after wal over-capacity failed");
                    }
                });
                if !from_backoff {
                    self.backoff_queue.lock().unwrap().push_back(request.clone());
                }
                self.log_backpressure("wal over capacity, backing off appends");
                true
            }
            Err(e) => {
                // The request was never registered with the sequencer, so it
                // fails alone without wedging the stream's callback queue.
                request.complete(Err(e.into()));
                false
            }
        }
    }

    /// A registered request whose WAL ack failed can never be delivered.
    /// Unregister it together with everything queued behind it on the stream
    /// (those records would leave a gap in the cache) and fail every future.
    fn fail_persist(&self, request: &Arc<WalWriteRequest>, error: Error) {
        let stream_id = request.record().stream_id();
        let successors = {
            let _stripe = self.callback_lock(stream_id).lock().unwrap();
            self.sequencer.discard_failed(request)
        };
        request.complete(Err(error));
        for successor in successors {
            successor.complete(Err(Error::AbortedAppend { stream_id }));
        }
    }

    fn try_acquire_permit(&self) -> bool {
        self.cache.size() < self.config.wal_cache_size
    }

    fn try_drain_backoff_requests(&self) {
        loop {
            let head = self.backoff_queue.lock().unwrap().front().cloned();
            let Some(request) = head else {
                break;
            };
            if self.append_to_wal(&request, true) {
                break;
            }
            self.backoff_queue.lock().unwrap().pop_front();
        }
    }

    /// Runs on WAL-ack delivery, in arbitrary order across streams. The
    /// stream's callback stripe serializes sequencer and cache access per
    /// stream; completions fire outside the stripe.
    fn handle_append_callback(&self, request: &Arc<WalWriteRequest>) {
        let ready = {
            let _stripe = self
                .callback_lock(request.record().stream_id())
                .lock()
                .unwrap();
            let ready = self.sequencer.after(request);
            for waiting in &ready {
                if self.cache.put(waiting.record().clone()) {
                    // Active block crossed the flush threshold.
                    self.upload_log_cache(None);
                }
            }
            ready
        };
        for waiting in ready {
            waiting.complete(Ok(()));
        }
    }

    fn callback_lock(&self, stream_id: u64) -> &Mutex<()> {
        &self.callback_locks[(stream_id % self.callback_locks.len() as u64) as usize]
    }

    /// Read a contiguous slice of `stream_id` in `[start_offset, end_offset)`
    /// bounded by `max_bytes` (inclusive of the record crossing the budget).
    ///
    /// The log cache is consulted first; if it cannot serve the head of the
    /// range, the remote block cache fills `[start_offset, cache_start)` and
    /// cached records are appended up to the remaining budget.
    pub async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        let cache_records = self.cache.get(stream_id, start_offset, end_offset, max_bytes);
        if let Some(first) = cache_records.first() {
            if first.base_offset() <= start_offset {
                return Ok(ReadDataBlock::new(cache_records, CacheAccessType::WalCacheHit));
            }
        }

        let remote_end = cache_records
            .first()
            .map(|r| r.base_offset())
            .unwrap_or(end_offset);
        let remote = self
            .block_cache
            .read(stream_id, start_offset, remote_end, max_bytes)
            .await?;

        let mut records = remote.records;
        let mut remaining =
            max_bytes as i64 - records.iter().map(|r| r.size() as i64).sum::<i64>();
        for record in cache_records {
            if remaining <= 0 {
                // The rest of the cache result is beyond the budget; dropping
                // it here releases the records.
                break;
            }
            remaining -= record.size() as i64;
            records.push(record);
        }

        check_continuity(stream_id, &records)?;
        Ok(ReadDataBlock::new(records, remote.access_type))
    }

    /// Flush cached records of `stream_id` (all streams when `None`) to
    /// remote storage and wait for the resulting uploads to commit.
    pub async fn force_upload(&self, stream_id: Option<u64>) -> Result<()> {
        // Wait for inflight tasks first so a flush storm (e.g. at shutdown)
        // groups records into few objects instead of many tiny ones.
        futures::future::join_all(self.inflight_snapshot()).await;
        self.upload_log_cache(stream_id);
        let results = futures::future::join_all(self.inflight_snapshot()).await;
        if let Some(stream_id) = stream_id {
            self.sequencer.try_free(stream_id);
        }
        for result in results {
            result.map_err(Error::Upload)?;
        }
        Ok(())
    }

    /// Rotate the active cache block (if it holds matching records) into the
    /// upload pipeline, then pump both stages.
    fn upload_log_cache(&self, stream_id: Option<u64>) {
        let block = {
            let _rotation = self.rotation_lock.lock().unwrap();
            self.cache
                .set_confirm_offset(self.sequencer.wal_confirm_offset());
            self.cache.archive_current_if_contains(stream_id)
        };
        if let Some(block) = block {
            let task = DeltaUploadTask::new(
                block.records(),
                self.config.stream_split_size,
                self.object_manager.clone(),
                self.object_store.clone(),
                self.io_permits.clone(),
                self.config.object_prepare_ttl_ms,
            );
            let context = UploadTaskContext::new(block, task);
            self.track_inflight(&context);
            self.prepare_queue.lock().unwrap().push_back(context);
        }
        // Pump unconditionally: a task parked by an earlier failure is
        // retried by the next flush.
        self.pump_prepare();
        self.pump_commit();
    }

    fn inflight_snapshot(&self) -> Vec<SharedUploadResult> {
        self.inflight_uploads.lock().unwrap().clone()
    }

    fn track_inflight(&self, context: &Arc<UploadTaskContext>) {
        let done = context.done();
        self.inflight_uploads.lock().unwrap().push(done.clone());
        let storage = self.weak_self.clone();
        tokio::spawn(async move {
            let _ = done.clone().await;
            if let Some(storage) = storage.upgrade() {
                storage
                    .inflight_uploads
                    .lock()
                    .unwrap()
                    .retain(|inflight| !inflight.ptr_eq(&done));
            }
        });
    }

    /// Drive the prepare stage: at most one prepare in flight, strictly in
    /// queue order.
    fn pump_prepare(&self) {
        loop {
            if self.prepare_active.swap(true, Ordering::AcqRel) {
                return;
            }
            let head = self.prepare_queue.lock().unwrap().front().cloned();
            let Some(context) = head else {
                self.prepare_active.store(false, Ordering::Release);
                if self.prepare_queue.lock().unwrap().is_empty() {
                    return;
                }
                // A task raced in between the check and the release.
                continue;
            };

            if context.state() == UploadTaskState::Failed {
                // Retry in place: re-arm the completion and track it as
                // inflight again so the flush driving this retry awaits it.
                info!("retrying failed upload task prepare");
                context.rearm();
                self.track_inflight(&context);
            }
            let storage = self.shared();
            tokio::spawn(async move {
                match context.task.prepare().await {
                    Ok(()) => {
                        context.set_state(UploadTaskState::Prepared);
                        storage.prepare_queue.lock().unwrap().pop_front();
                        context.task.launch_uploads();
                        context.set_state(UploadTaskState::Uploading);
                        storage.commit_queue.lock().unwrap().push_back(context);
                        storage.prepare_active.store(false, Ordering::Release);
                        storage.pump_commit();
                        storage.pump_prepare();
                    }
                    Err(e) => {
                        error!(error = %e, "upload prepare failed; block stays archived for retry");
                        context.fail(Arc::new(e));
                        storage.prepare_active.store(false, Ordering::Release);
                        // Head stays queued; the next flush retries it.
                    }
                }
            });
            return;
        }
    }

    /// Drive the commit stage: at most one commit in flight, strictly in
    /// queue order, and never past a failed task.
    fn pump_commit(&self) {
        loop {
            if self.commit_active.swap(true, Ordering::AcqRel) {
                return;
            }
            let head = self.commit_queue.lock().unwrap().front().cloned();
            let Some(context) = head else {
                self.commit_active.store(false, Ordering::Release);
                if self.commit_queue.lock().unwrap().is_empty() {
                    return;
                }
                continue;
            };

            if context.state() == UploadTaskState::Failed {
                info!("retrying failed upload task commit");
                context.rearm();
                self.track_inflight(&context);
            }
            let storage = self.shared();
            tokio::spawn(async move {
                match context.task.commit().await {
                    Ok(()) => {
                        storage.commit_queue.lock().unwrap().pop_front();
                        let confirm_offset = context.block.confirm_offset();
                        if confirm_offset > NO_CONFIRM_OFFSET {
                            info!(offset = confirm_offset, "trimming wal after object commit");
                            storage.wal.trim(confirm_offset as u64);
                        }
                        storage.cache.mark_free(&context.block);
                        context.complete_ok();
                        storage.commit_active.store(false, Ordering::Release);
                        storage.pump_commit();
                    }
                    Err(CommitError::Upload(e)) => {
                        warn!(error = %e, "object upload failed; block stays archived for retry");
                        context.fail(Arc::new(e));
                        storage.commit_active.store(false, Ordering::Release);
                        // Head stays queued so later blocks cannot commit
                        // ahead of it.
                    }
                    Err(CommitError::Publish(e)) => {
                        // A half-published commit cannot be reasoned about;
                        // no later block may publish after it.
                        error!(error = %e, "object commit failed after publication, aborting");
                        std::process::abort();
                    }
                }
            });
            return;
        }
    }

    /// Memory-pressure hook: synchronously free up to `bytes` from the oldest
    /// archived cache blocks, returning the bytes actually freed. Takes only
    /// the cache's structural lock, so it cannot deadlock with an upload
    /// commit.
    pub fn handle_memory_pressure(&self, bytes: u64) -> u64 {
        let freed = self.cache.force_free(bytes);
        if freed > 0 {
            warn!(requested = bytes, freed, "freed archived cache blocks under memory pressure");
        }
        freed
    }

    /// Total bytes currently held by the log cache.
    pub fn cache_size(&self) -> u64 {
        self.cache.size()
    }

    /// Inclusive WAL offset below which every append has been acknowledged.
    pub fn wal_confirm_offset(&self) -> i64 {
        self.sequencer.wal_confirm_offset()
    }

    fn spawn_backoff_drain(&self) -> JoinHandle<()> {
        let storage = self.weak_self.clone();
        let token = self.drain_token.clone();
        let interval = Duration::from_millis(self.config.backoff_drain_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(storage) = storage.upgrade() else { break };
                        storage.try_drain_backoff_requests();
                    }
                }
            }
        })
    }

    fn log_backpressure(&self, message: &str) {
        let now = now_ms();
        let last = self.last_backpressure_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= 1000
            && self
                .last_backpressure_log_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                cache_size = self.cache.size(),
                cache_limit = self.config.wal_cache_size,
                "{message}"
            );
        }
    }
}

fn check_continuity(stream_id: u64, records: &[StreamRecord]) -> Result<()> {
    for pair in records.windows(2) {
        let expected = pair[0].end_offset();
        if pair[1].base_offset() != expected {
            return Err(Error::DiscontinuousRead {
                stream_id,
                expected,
                actual: pair[1].base_offset(),
            });
        }
    }
    Ok(())
}

/// Rebuild a cache block from a WAL replay.
///
/// Records of closed streams and records below a stream's committed end
/// offset are dropped. A record that does not extend its stream contiguously
/// is dropped with an error log (trailing duplicates of a torn write). After
/// filtering, each surviving stream must start exactly at its committed end
/// offset - anything else means the WAL lost data, which recovery must not
/// paper over.
pub(crate) fn recover_continuous_records(
    entries: impl Iterator<Item = RecoveredRecord>,
    opening_streams: &[StreamMetadata],
) -> Result<LogCacheBlock> {
    let committed_end_offsets: HashMap<u64, u64> = opening_streams
        .iter()
        .map(|s| (s.stream_id, s.end_offset))
        .collect();

    let block = LogCacheBlock::new(RECOVERY_BLOCK_CAPACITY, usize::MAX);
    let mut log_end_offset = NO_CONFIRM_OFFSET;
    let mut next_offsets: HashMap<u64, u64> = HashMap::new();

    for entry in entries {
        log_end_offset = entry.offset as i64;
        let record = codec::decode(entry.data)?;
        let stream_id = record.stream_id();
        let Some(&committed_end) = committed_end_offsets.get(&stream_id) else {
            // Stream already safely closed; all its records are committed.
            continue;
        };
        if record.base_offset() < committed_end {
            continue;
        }
        match next_offsets.get(&stream_id) {
            Some(&expected) if expected != record.base_offset() => {
                error!(
                    stream_id,
                    expected,
                    base_offset = record.base_offset(),
                    "dropping out-of-sequence wal record"
                );
            }
            _ => {
                next_offsets.insert(stream_id, record.end_offset());
                block.put(record);
            }
        }
    }
    if log_end_offset > NO_CONFIRM_OFFSET {
        block.set_confirm_offset(log_end_offset);
    }

    for (stream_id, records) in block.records() {
        if let Some(first) = records.first() {
            let expected = committed_end_offsets
                .get(&stream_id)
                .copied()
                .unwrap_or(first.base_offset());
            if first.base_offset() != expected {
                return Err(Error::RecoveryGap {
                    stream_id,
                    expected,
                    actual: first.base_offset(),
                });
            }
        }
    }
    Ok(block)
}
