use std::io;

use thiserror::Error;

/// Error yielded while walking the on-disk block chain.
///
/// A [`Traversal::Checksum`] or [`Traversal::Framing`] error marks the
/// logical end of the chain -- the walk stops there, but the blocks read so
/// far remain valid.
#[derive(Debug, Error)]
pub enum Traversal {
    #[error("checksum mismatch at block seq={seq}")]
    Checksum {
        seq: u64,
        #[source]
        source: ChecksumMismatch,
    },
    #[error("invalid record framing at block seq={seq}: {reason}")]
    Framing { seq: u64, reason: &'static str },
    #[error("chain linkage broken at block seq={seq}")]
    Linkage { seq: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A checksum mismatch was detected.
///
/// Usually wrapped in another error, such as [`Traversal`].
#[derive(Debug, Error)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;

/// Error returned by [`crate::IntentLog::suspend`].
#[derive(Debug, Error)]
pub enum SuspendError {
    /// The log still needs replay; it must not be suspended before the
    /// recorded chain has been applied.
    #[error("log has not been replayed")]
    Busy,
    /// The dataset's key is not loaded, so in-flight records cannot be
    /// committed to the chain.
    #[error("encryption key unavailable")]
    Permission,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error surfaced while replaying the chain.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("record seq={seq} has invalid txtype {txtype}")]
    InvalidTxType { seq: u64, txtype: u64 },
    #[error("replay handler failed for record seq={seq} txtype={txtype}")]
    Handler {
        seq: u64,
        txtype: u64,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of the `get_data` callback for an indirect or need-copy write.
///
/// Anything other than [`GetDataError::NotFound`], [`GetDataError::Exists`]
/// or [`GetDataError::Skip`] makes the engine fall back to waiting on the
/// main checkpoint for the record's txg.
#[derive(Debug, Error)]
pub enum GetDataError {
    #[error("i/o error fetching write payload")]
    Io,
    #[error("object no longer exists")]
    NotFound,
    #[error("block already exists")]
    Exists,
    #[error("payload already persisted elsewhere")]
    Skip,
    #[error("unexpected error fetching write payload: {0}")]
    Other(io::ErrorKind),
}
