//! Record wire codec.
//!
//! The same encoding is used on the wire, in the WAL, and inside remote
//! objects:
//!
//! ```text
//! ┌───────┬───────────┬─────────────┬───────────────────┬────────────────┬─────────┐
//! │ magic │ stream_id │ base_offset │ last_offset_delta │ payload_length │ payload │
//! │ (1)   │ (8, BE)   │ (8, BE)     │ (4, BE)           │ (4, BE)        │ (N)     │
//! └───────┴───────────┴─────────────┴───────────────────┴────────────────┴─────────┘
//! ```
//!
//! `last_offset = base_offset + last_offset_delta`. Unknown magic bytes are
//! rejected so the format can evolve behind a version bump.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::record::StreamRecord;

/// Current (and only) format version.
pub const MAGIC_V0: u8 = 0x8f;

/// Fixed header size: magic + stream_id + base_offset + delta + payload_length.
pub const HEADER_SIZE: usize = 1 + 8 + 8 + 4 + 4;

/// Encode a record into its wire form.
pub(crate) fn encode(stream_id: u64, base_offset: u64, last_offset: u64, payload: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(MAGIC_V0);
    buf.put_u64(stream_id);
    buf.put_u64(base_offset);
    buf.put_u32((last_offset - base_offset) as u32);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode one record from `buf`.
///
/// The returned record holds slices of `buf` for both the payload and the
/// cached encoded form; nothing is copied.
pub fn decode(buf: Bytes) -> Result<StreamRecord> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Truncated {
            expected: HEADER_SIZE,
            actual: buf.len(),
        });
    }
    let mut header = buf.clone();
    let magic = header.get_u8();
    if magic != MAGIC_V0 {
        return Err(Error::UnknownMagic(magic));
    }
    let stream_id = header.get_u64();
    let base_offset = header.get_u64();
    let delta = header.get_u32();
    let payload_len = header.get_u32() as usize;

    let total = HEADER_SIZE + payload_len;
    if buf.len() < total {
        return Err(Error::Truncated {
            expected: total,
            actual: buf.len(),
        });
    }

    let payload = buf.slice(HEADER_SIZE..total);
    let encoded = buf.slice(..total);
    Ok(StreamRecord::from_decoded(
        stream_id,
        base_offset,
        base_offset + delta as u64,
        payload,
        encoded,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let rec = StreamRecord::new(42, 1000, 1009, Bytes::from("hello world"));
        let decoded = decode(rec.encoded()).unwrap();
        assert_eq!(decoded.stream_id(), 42);
        assert_eq!(decoded.base_offset(), 1000);
        assert_eq!(decoded.last_offset(), 1009);
        assert_eq!(decoded.payload(), rec.payload());
        assert_eq!(decoded.size(), rec.size());
    }

    #[test]
    fn test_decoded_record_keeps_wire_buffer() {
        let rec = StreamRecord::new(1, 0, 0, Bytes::from("abc"));
        let wire = rec.encoded();
        let decoded = decode(wire.clone()).unwrap();
        assert_eq!(decoded.encoded(), wire);
    }

    #[test]
    fn test_empty_payload() {
        let rec = StreamRecord::new(9, 5, 5, Bytes::new());
        let decoded = decode(rec.encoded()).unwrap();
        assert!(decoded.payload().is_empty());
        assert_eq!(decoded.size(), HEADER_SIZE);
    }

    #[test]
    fn test_reject_unknown_magic() {
        let rec = StreamRecord::new(1, 0, 0, Bytes::from("x"));
        let mut bytes = rec.encoded().to_vec();
        bytes[0] = 0x00;
        assert!(matches!(
            decode(Bytes::from(bytes)),
            Err(Error::UnknownMagic(0x00))
        ));
    }

    #[test]
    fn test_reject_truncated_header() {
        let err = decode(Bytes::from_static(&[MAGIC_V0, 1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn test_reject_truncated_payload() {
        let rec = StreamRecord::new(1, 0, 0, Bytes::from("truncate me"));
        let wire = rec.encoded();
        let short = wire.slice(..wire.len() - 3);
        assert!(matches!(decode(short), Err(Error::Truncated { .. })));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        // WAL entries may be framed with padding after the record.
        let rec = StreamRecord::new(3, 7, 8, Bytes::from("payload"));
        let mut framed = rec.encoded().to_vec();
        framed.extend_from_slice(&[0u8; 16]);
        let decoded = decode(Bytes::from(framed)).unwrap();
        assert_eq!(decoded.last_offset(), 8);
        assert_eq!(decoded.size(), rec.size());
    }
}
