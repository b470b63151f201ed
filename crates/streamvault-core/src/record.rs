//! Stream record batches.
//!
//! A [`StreamRecord`] is an immutable batch of consecutive records belonging
//! to one stream, covering the inclusive offset range `[base_offset,
//! last_offset]`. The payload is opaque to the storage core.
//!
//! ## Sharing
//!
//! A record is handed from the client to the WAL, kept in the log cache,
//! served to readers, and bundled into upload tasks - often all at once. To
//! make that cheap the record body lives behind an `Arc` and the payload is a
//! `bytes::Bytes`, so a clone is two reference-count bumps and releasing a
//! record is simply dropping the last clone.
//!
//! ## Encoding
//!
//! `encoded()` produces the wire form (see [`crate::codec`]) exactly once and
//! caches it; the same buffer is then written to the WAL and to remote
//! objects. Records built by the decoder retain the buffer they were decoded
//! from, so recovery never re-encodes either.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::codec;

/// An immutable batch of records for a single stream.
#[derive(Clone)]
pub struct StreamRecord {
    inner: Arc<Inner>,
}

struct Inner {
    stream_id: u64,
    base_offset: u64,
    last_offset: u64,
    payload: Bytes,
    encoded: OnceLock<Bytes>,
}

impl StreamRecord {
    /// Create a record batch covering the inclusive range
    /// `[base_offset, last_offset]`.
    pub fn new(stream_id: u64, base_offset: u64, last_offset: u64, payload: Bytes) -> Self {
        debug_assert!(last_offset >= base_offset);
        debug_assert!(last_offset - base_offset <= u32::MAX as u64);
        Self {
            inner: Arc::new(Inner {
                stream_id,
                base_offset,
                last_offset,
                payload,
                encoded: OnceLock::new(),
            }),
        }
    }

    /// Used by the decoder to retain the original wire buffer.
    pub(crate) fn from_decoded(
        stream_id: u64,
        base_offset: u64,
        last_offset: u64,
        payload: Bytes,
        encoded: Bytes,
    ) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(encoded);
        Self {
            inner: Arc::new(Inner {
                stream_id,
                base_offset,
                last_offset,
                payload,
                encoded: cell,
            }),
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.inner.stream_id
    }

    /// First offset covered by this batch (inclusive).
    pub fn base_offset(&self) -> u64 {
        self.inner.base_offset
    }

    /// Last offset covered by this batch (inclusive).
    pub fn last_offset(&self) -> u64 {
        self.inner.last_offset
    }

    /// One past `last_offset`; the base offset the next batch must carry.
    pub fn end_offset(&self) -> u64 {
        self.inner.last_offset + 1
    }

    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    /// Encoded size in bytes. Every byte account in the storage core (cache
    /// sizes, read budgets, upload planning) uses this.
    pub fn size(&self) -> usize {
        codec::HEADER_SIZE + self.inner.payload.len()
    }

    /// Wire form of this record. Computed at most once and cached.
    pub fn encoded(&self) -> Bytes {
        self.inner
            .encoded
            .get_or_init(|| {
                codec::encode(
                    self.inner.stream_id,
                    self.inner.base_offset,
                    self.inner.last_offset,
                    &self.inner.payload,
                )
            })
            .clone()
    }
}

impl std::fmt::Debug for StreamRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRecord")
            .field("stream_id", &self.inner.stream_id)
            .field("base_offset", &self.inner.base_offset)
            .field("last_offset", &self.inner.last_offset)
            .field("payload_len", &self.inner.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_and_size() {
        let rec = StreamRecord::new(7, 100, 104, Bytes::from(vec![0u8; 64]));
        assert_eq!(rec.stream_id(), 7);
        assert_eq!(rec.base_offset(), 100);
        assert_eq!(rec.last_offset(), 104);
        assert_eq!(rec.end_offset(), 105);
        assert_eq!(rec.size(), codec::HEADER_SIZE + 64);
    }

    #[test]
    fn test_encoded_is_cached() {
        let rec = StreamRecord::new(1, 0, 0, Bytes::from("payload"));
        let a = rec.encoded();
        let b = rec.encoded();
        // Same backing buffer, not a re-encode.
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_clone_shares_body() {
        let rec = StreamRecord::new(1, 5, 9, Bytes::from("x"));
        let clone = rec.clone();
        assert_eq!(clone.base_offset(), 5);
        assert_eq!(rec.encoded().as_ptr(), clone.encoded().as_ptr());
    }

    #[test]
    fn test_single_offset_batch() {
        let rec = StreamRecord::new(1, 42, 42, Bytes::from("v"));
        assert_eq!(rec.base_offset(), rec.last_offset());
        assert_eq!(rec.end_offset(), 43);
    }
}
