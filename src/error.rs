//! Errors shared across the crate.

use std::io;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a [`Bitcask`](crate::Bitcask) datastore. Nothing is
/// retried internally; every failure propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required key or value was nil or empty, or a key contains
    /// whitespace and cannot round-trip through the hint file.
    #[error("nil keys or values can't be allowed")]
    NullKeyOrValue,

    /// The key is in neither the pending-write buffer nor the keydir.
    #[error("{0:?}: key doesn't exist")]
    KeyNotExist(String),

    /// A mutating operation was invoked on a read-only handle.
    #[error("you don't have write permissions")]
    HasNoWritePerms,

    /// Another process holds a conflicting lock sentinel on the
    /// datastore directory.
    #[error("datastore is locked by another process")]
    Locked,

    /// An underlying file system operation failed.
    #[error("I/O error - {0}")]
    Io(#[from] io::Error),

    /// A checksum mismatch or bounds violation while decoding on-disk
    /// data.
    #[error("corrupt record - {0}")]
    CorruptRecord(String),
}
