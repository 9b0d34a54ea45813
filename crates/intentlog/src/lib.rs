//! Per-dataset write-ahead intent log for a copy-on-write filesystem.
//!
//! The engine saves intent records (itxs) of operations that change the
//! file system. Each record carries enough information to replay the
//! operation after a crash. Records are held in memory until either:
//!
//! 1. they are committed to the pool by the main checkpoint (txg), at
//!    which point they can be discarded; or
//! 2. they are committed to the on-disk chain for the dataset (e.g. due
//!    to an fsync, O_DSYNC, or other synchronous requirement).
//!
//! The on-disk format is a single per-dataset header pointing at a chain
//! of zero or more log blocks, each holding zero or more records. Blocks
//! are dynamically allocated and checksum-chained: the verifier of block
//! N+1 is block N's chain identity with the sequence word incremented.
//!
//! [`IntentLog::commit`] is the durability barrier: it returns only once
//! every record queued before the call has reached stable storage (or the
//! caller has been routed to the slow path of waiting on the main
//! checkpoint). After a crash, [`IntentLog::claim`] walks and claims the
//! chain, and [`IntentLog::replay`] re-applies the records the checkpoint
//! never saw.
//!
//! Storage and checkpoint services are abstracted behind the
//! [`Pool`] trait; an in-memory implementation for tests lives behind the
//! `test` feature.

mod blockptr;
mod chain;
mod claim;
mod commit;
pub mod error;
mod io;
mod itxg;
mod log;
mod lwb;
mod metrics;
mod plan;
mod pool;
mod record;
mod replay;
mod writer;

pub use crate::blockptr::{BlockPointer, ChainId, ChainKind, DeviceId, Dva};
pub use crate::log::{
    ChildIo, GetData, HeaderFlags, IntentLog, LogBias, LogHeader, LogShared, SyncMode,
};
pub use crate::metrics::MetricsSnapshot;
pub use crate::pool::{Pool, WritePriority};
pub use crate::record::{
    write_itx, Itx, RecordHeader, WriteHeader, WriteState, TXTYPE_CI, TXTYPE_OOO, TX_COMMIT,
    TX_RENAME, TX_WRITE,
};
pub use crate::replay::{Replay, ReplayRecord};

#[cfg(any(test, feature = "test"))]
pub use crate::pool::MemPool;

/// Smallest block the chain will allocate; also the write-rounding quantum
/// for slim framing.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Records are packed at this alignment, and their lengths are multiples
/// of it.
pub const RECORD_ALIGN: usize = 8;

const _: () = assert!(MIN_BLOCK_SIZE % RECORD_ALIGN == 0);

/// Number of txg slots the engine buckets records into.
pub(crate) const TXG_SIZE: usize = 4;
pub(crate) const TXG_MASK: u64 = TXG_SIZE as u64 - 1;

/// Number of txgs that may concurrently hold un-synced records.
pub(crate) const TXG_CONCURRENT: u64 = 3;

pub(crate) fn round_up(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

/// Engine tunables.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Waiter timeout as a percentage of the observed block-write latency.
    /// When it fires, the waiter closes and issues a still-open block
    /// itself rather than keep waiting for more traffic.
    ///
    /// Default: 10
    pub commit_timeout_pct: u32,
    /// Skip device cache flushes entirely. Unsafe with volatile write
    /// caches: a waiter may be signalled before its data is actually
    /// stable.
    ///
    /// Default: false
    pub nocacheflush: bool,
    /// Bytes of sync-priority log writes per burst before remaining writes
    /// fall to async priority, to limit abuse of a dedicated log device by
    /// a single writer.
    ///
    /// Default: 64 MiB
    pub slog_bulk: u64,
    /// Upper bound on the size of a log block. Clamped to the pool's own
    /// maximum.
    ///
    /// Default: 128 KiB
    pub max_block_size: u32,
    /// Cap on bytes stored inline as [`WriteState::Copied`].
    ///
    /// Default: 7680
    pub max_copied: u32,
    /// Write size at which an indirect write becomes preferable to logging
    /// the data.
    ///
    /// Default: 32 KiB
    pub immediate_write_sz: u32,
    /// Treat the pool's "special" tier as a log device when deciding
    /// write states.
    ///
    /// Default: true
    pub special_is_slog: bool,
    /// Skip replay entirely (testing).
    ///
    /// Default: false
    pub replay_disable: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            commit_timeout_pct: 10,
            nocacheflush: false,
            slog_bulk: 64 * 1024 * 1024,
            max_block_size: 128 * 1024,
            max_copied: 7680,
            immediate_write_sz: 32 * 1024,
            special_is_slog: true,
            replay_disable: false,
        }
    }
}
