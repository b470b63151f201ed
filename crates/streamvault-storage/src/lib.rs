//! StreamVault Storage Layer
//!
//! This crate implements the delta WAL storage core: the component that takes
//! per-stream record appends, makes them durable in a local write-ahead log,
//! serves them from an in-memory cache, and asynchronously rolls cached
//! batches into immutable objects in S3-compatible storage.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────┐ append            ┌───────────┐ read
//! │  Clients  │──────────┐        │  Clients  │─────────┐
//! └───────────┘          ▼        └───────────┘         ▼
//!                 ┌─────────────┐                ┌─────────────┐
//!                 │ DeltaStorage│                │ read merge  │
//!                 │  admission  │                │ cache+remote│
//!                 └──────┬──────┘                └──────┬──────┘
//!                        │ wal.append                   │
//!                        ▼                              │
//!                 ┌─────────────┐   per-stream order    │
//!                 │  WAL device │──▶ CallbackSequencer   │
//!                 └─────────────┘          │            │
//!                                          ▼            │
//!                                    ┌──────────┐       │
//!                                    │ LogCache │◀──────┘
//!                                    └────┬─────┘
//!                                         │ archived blocks
//!                                         ▼
//!                               ┌──────────────────┐
//!                               │ upload pipeline  │──▶ object store
//!                               │ prepare ▶ commit │──▶ object manager
//!                               └──────────────────┘
//! ```
//!
//! ## Main Components
//!
//! - [`storage::DeltaStorage`]: the process-wide storage singleton; append,
//!   read, force-upload, recovery, shutdown.
//! - [`cache::LogCache`]: the two-generation record cache feeding both reads
//!   and flushes.
//! - [`wal::WriteAheadLog`] / [`objects::ObjectManager`] /
//!   [`streams::StreamManager`] / [`block_cache::BlockCache`]: the
//!   collaborator contracts, each with an in-memory implementation for tests
//!   and single-process use.
//!
//! ## Guarantees
//!
//! - Per stream, append completions are delivered in offset order - the
//!   order records entered the WAL and the cache.
//! - Earlier cache blocks become remote objects with smaller ids and commit
//!   first; consumers observe a monotone object sequence.
//! - The WAL is trimmed only past offsets whose records are committed to
//!   remote objects.
//! - Reads return contiguous record runs or fail with an integrity error.

pub mod block_cache;
pub mod cache;
pub mod config;
pub mod error;
pub mod objects;
pub mod storage;
pub mod streams;
pub mod wal;

mod request;
mod sequencer;
mod upload;

pub use block_cache::{BlockCache, CacheAccessType, MemoryBlockCache, ReadDataBlock};
pub use cache::{BlockState, LogCache, LogCacheBlock};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use objects::{
    MemoryObjectManager, ObjectManager, ObjectManifest, StreamObjectManifest, StreamRange,
    WalObjectRequest,
};
pub use storage::DeltaStorage;
pub use streams::{MemoryStreamManager, StreamManager, StreamMetadata};
pub use wal::{MemoryWal, RecoveredRecord, WalAppendHandle, WalError, WriteAheadLog};
