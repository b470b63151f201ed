//! Codec error types.
//!
//! Decoding is the only fallible operation in this crate. Encoding cannot
//! fail: offsets and payload lengths are validated at record construction.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown record magic {0:#04x}")]
    UnknownMagic(u8),

    #[error("truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}
