//! The engine's view of the storage engine.
//!
//! Everything the log needs from the pool -- block allocation, raw block
//! I/O, device cache flushes, and checkpoint (txg) coordination -- goes
//! through the [`Pool`] trait. This is mainly an internal seam to allow
//! testing against an in-memory representation, but it is also the real
//! integration surface.

use std::io;

use crate::blockptr::{BlockPointer, DeviceId};

/// Scheduling hint for a log-block write. Bulk bursts on a dedicated log
/// device are demoted to async priority so a single writer cannot starve
/// the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WritePriority {
    Sync,
    Async,
}

#[cfg(any(test, feature = "test"))]
pub mod mem;

#[cfg(any(test, feature = "test"))]
pub use mem::MemPool;

/// Storage and checkpoint services backing an intent log.
pub trait Pool: Send + Sync + 'static {
    /// Allocate a log block of `size` bytes, preferring a dedicated log
    /// device. Returns the pointer and whether it landed on one.
    ///
    /// The returned pointer's chain identity and kind are stamped by the
    /// engine afterwards.
    fn alloc_log_block(&self, txg: u64, size: u32) -> io::Result<(BlockPointer, bool)>;

    /// Free a previously allocated log block in `txg`.
    fn free_log_block(&self, txg: u64, bp: &BlockPointer);

    /// Mark `bp` as in use so the allocator will not hand it out again
    /// before replay frees it. With `txg == 0`, only verify that the block
    /// is claimable.
    fn claim_log_block(&self, txg: u64, bp: &BlockPointer) -> io::Result<()>;

    /// Read back the block at `bp`. May return fewer bytes than `bp.size`
    /// if the block was written short (slim framing).
    fn read_block(&self, bp: &BlockPointer) -> io::Result<Vec<u8>>;

    /// Write `data` at `bp` to every device address the pointer carries.
    fn write_block(&self, bp: &BlockPointer, data: &[u8], priority: WritePriority)
        -> io::Result<()>;

    /// Issue a cache-flush command to `device` and wait for it to
    /// acknowledge.
    fn flush_device(&self, device: DeviceId) -> io::Result<()>;

    /// Open a checkpoint transaction; returns the txg it joined.
    fn tx_assign(&self) -> u64;

    /// Close a transaction opened with [`Pool::tx_assign`].
    fn tx_commit(&self, txg: u64);

    /// The txg a new transaction would join.
    fn open_txg(&self) -> u64;

    /// Highest txg fully committed by the main checkpoint.
    fn last_synced_txg(&self) -> u64;

    /// Block until `txg` (or, with `txg == 0`, everything currently open)
    /// has been committed by the main checkpoint.
    fn wait_synced(&self, txg: u64);

    /// Earliest txg whose log blocks may be claimed on import.
    fn min_claim_txg(&self) -> u64 {
        self.last_synced_txg() + 1
    }

    /// Nonzero while the pool is frozen for log testing: records never
    /// reach the main checkpoint past this txg.
    fn freeze_txg(&self) -> u64 {
        u64::MAX
    }

    /// Nonzero when the imported uberblock is a checkpoint; unclaimed log
    /// chains must then be cleared, not claimed.
    fn checkpoint_txg(&self) -> u64 {
        0
    }

    fn writeable(&self) -> bool {
        true
    }

    /// Whether newly allocated blocks use the slim framing.
    fn slim_log_blocks(&self) -> bool {
        true
    }

    /// A dedicated log device is present.
    fn has_slog(&self) -> bool {
        false
    }

    /// A "special" allocation tier is present.
    fn has_special(&self) -> bool {
        false
    }

    /// Largest block the special tier stores for small-block data.
    fn special_smallblock(&self) -> u32 {
        0
    }

    /// Upper bound on any block size in this pool.
    fn max_block_size(&self) -> u32 {
        1 << 24
    }

    /// Whether the first chain block's log device is healthy enough that a
    /// chain check must walk the chain at all.
    fn log_device_ok(&self, bp: &BlockPointer) -> bool {
        let _ = bp;
        true
    }

    /// Whether the dataset's encryption key (if any) is loaded.
    fn key_available(&self) -> bool {
        true
    }
}
