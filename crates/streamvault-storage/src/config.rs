//! Storage Configuration
//!
//! Tuning knobs for the delta WAL storage core. Every field has a production
//! default and can be deserialized from a config file with partial overrides
//! (missing fields fall back to their defaults).
//!
//! ## The knobs that matter
//!
//! - **wal_cache_size**: soft cap on total log cache bytes. Appends are
//!   admitted only while the cache is below this; beyond it they park in the
//!   backoff queue until uploads free memory (default: 1 GiB).
//! - **wal_upload_threshold**: active cache block size that triggers an
//!   upload of the block (default: 100 MiB).
//! - **stream_split_size**: per-stream byte count above which the upload
//!   planner gives the stream its own object instead of aggregating it into
//!   the stream-set object (default: 16 MiB).
//! - **max_stream_num_per_stream_set_object**: a cache block holding more
//!   distinct streams than this is considered full regardless of size, so a
//!   single stream-set object never aggregates an unbounded number of
//!   streams (default: 10 000).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Soft cap on total cache bytes; admission fails closed above it (default: 1 GiB).
    #[serde(default = "default_wal_cache_size")]
    pub wal_cache_size: u64,

    /// Active-block size that triggers an upload (default: 100 MiB).
    #[serde(default = "default_wal_upload_threshold")]
    pub wal_upload_threshold: u64,

    /// Per-stream byte count that splits the stream into its own object (default: 16 MiB).
    #[serde(default = "default_stream_split_size")]
    pub stream_split_size: u64,

    /// Distinct-stream cap for a single cache block / stream-set object (default: 10 000).
    #[serde(default = "default_max_stream_num_per_stream_set_object")]
    pub max_stream_num_per_stream_set_object: usize,

    /// Concurrency cap for object writes (default: 4).
    #[serde(default = "default_upload_io_pool_size")]
    pub upload_io_pool_size: usize,

    /// Retry cadence of the backoff drain task in milliseconds (default: 100).
    #[serde(default = "default_backoff_drain_interval_ms")]
    pub backoff_drain_interval_ms: u64,

    /// Number of striped per-stream callback locks (default: 128).
    #[serde(default = "default_stream_callback_lock_stripes")]
    pub stream_callback_lock_stripes: usize,

    /// TTL passed to the object manager when reserving object ids (default: 30 min).
    #[serde(default = "default_object_prepare_ttl_ms")]
    pub object_prepare_ttl_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_cache_size: default_wal_cache_size(),
            wal_upload_threshold: default_wal_upload_threshold(),
            stream_split_size: default_stream_split_size(),
            max_stream_num_per_stream_set_object: default_max_stream_num_per_stream_set_object(),
            upload_io_pool_size: default_upload_io_pool_size(),
            backoff_drain_interval_ms: default_backoff_drain_interval_ms(),
            stream_callback_lock_stripes: default_stream_callback_lock_stripes(),
            object_prepare_ttl_ms: default_object_prepare_ttl_ms(),
        }
    }
}

fn default_wal_cache_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_wal_upload_threshold() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_stream_split_size() -> u64 {
    16 * 1024 * 1024 // 16 MiB
}

fn default_max_stream_num_per_stream_set_object() -> usize {
    10_000
}

fn default_upload_io_pool_size() -> usize {
    4
}

fn default_backoff_drain_interval_ms() -> u64 {
    100
}

fn default_stream_callback_lock_stripes() -> usize {
    128
}

fn default_object_prepare_ttl_ms() -> u64 {
    30 * 60 * 1000 // 30 minutes
}
