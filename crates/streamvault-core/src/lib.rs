//! StreamVault Core
//!
//! This crate defines the fundamental data type of StreamVault - the
//! [`StreamRecord`] batch - together with its binary wire codec. Both the
//! write-ahead log and the remote objects store records in exactly this
//! encoding, so the bytes produced here are computed once per record and then
//! shared (never re-encoded) across the WAL, the log cache, and the upload
//! path.
//!
//! The crate is deliberately small and synchronous: no I/O, no async, no
//! collaborator types. Everything that moves records around lives in
//! `streamvault-storage`.

pub mod codec;
pub mod error;
pub mod record;

pub use error::{Error, Result};
pub use record::StreamRecord;
