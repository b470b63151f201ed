//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Transient (the caller's future resolves later or can retry)
//! - Admission rejection and WAL over-capacity never surface here: those park
//!   the request in the backoff queue and the append future stays pending.
//!
//! ### Operation-fatal
//! - `DiscontinuousRead`: the merged read result had an offset gap. Fails the
//!   read, not the process.
//! - `Wal` / `ObjectStore` / collaborator errors: propagated through the
//!   operation future.
//!
//! ### Process-fatal
//! - `RecoveryGap`: the WAL's surviving records do not start at the committed
//!   end offset of an open stream. Startup must not proceed past this.
//! - Object commit failure after publication aborts the process outright and
//!   never materializes as an `Error` value.

use std::sync::Arc;

use thiserror::Error;

use crate::wal::WalError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record codec error: {0}")]
    Codec(#[from] streamvault_core::Error),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("object manager error: {0}")]
    ObjectManager(String),

    #[error("stream manager error: {0}")]
    StreamManager(String),

    #[error("storage is shut down")]
    Shutdown,

    #[error("append on stream {stream_id} aborted: an earlier record failed to persist")]
    AbortedAppend { stream_id: u64 },

    #[error("background task failed: {0}")]
    Background(String),

    #[error("discontinuous records for stream {stream_id}: expected offset {expected}, got {actual}")]
    DiscontinuousRead {
        stream_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error(
        "wal recovery gap for stream {stream_id}: records start at {actual}, \
         committed end offset is {expected}"
    )]
    RecoveryGap {
        stream_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("upload task failed: {0}")]
    Upload(#[source] Arc<Error>),
}
