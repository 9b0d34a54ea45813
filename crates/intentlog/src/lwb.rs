//! Log-write-blocks: the unit of chain assembly and issue.
//!
//! An lwb owns the RAM buffer of one on-disk block while it is being
//! assembled, the records committed into it, the waiters to signal once it
//! is stable, and the set of devices whose caches must be flushed before
//! that. Lifecycle:
//!
//! ```text
//! NEW ──open──▶ OPENED ──close──▶ CLOSED ──issue──▶ READY
//!   [issuer]         [issuer]            [issuer+log]
//! READY ──write-submitted──▶ ISSUED ──write-done──▶ WRITE_DONE
//!                 [log]                 [io]
//! WRITE_DONE ──all-flushes-done──▶ FLUSH_DONE
//!                 [io, root task]
//! ```
//!
//! The issuer lock serializes open/close/issue; the log lock covers list
//! membership and state reads from completion callbacks. The state itself
//! is additionally mirrored through an atomic so waiters can peek at it
//! without taking either lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::blockptr::{BlockPointer, ChainKind, DeviceId};
use crate::chain::ChainHeader;
use crate::commit::CommitWaiter;
use crate::io::Task;
use crate::record::Itx;

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd)]
#[repr(u8)]
pub(crate) enum LwbState {
    /// Buffer allocated, no records yet; block pointer may be pending.
    New = 0,
    /// Accepting records; contents may still grow.
    Opened,
    /// No more records will be added; payload is finalized after this.
    Closed,
    /// Payload copied into the buffer; waiting for a block pointer (ours,
    /// or the predecessor filling ours in).
    Ready,
    /// The write has been submitted to storage.
    Issued,
    /// The write completed; cache flushes may now be issued or deferred.
    WriteDone,
    /// All required cache flushes completed; waiters may be signalled.
    FlushDone,
}

impl LwbState {
    fn from_u8(v: u8) -> LwbState {
        match v {
            0 => LwbState::New,
            1 => LwbState::Opened,
            2 => LwbState::Closed,
            3 => LwbState::Ready,
            4 => LwbState::Issued,
            5 => LwbState::WriteDone,
            6 => LwbState::FlushDone,
            _ => unreachable!("invalid lwb state"),
        }
    }
}

pub(crate) struct LwbCore {
    /// On-disk location; a hole until the predecessor's issue step (or our
    /// own allocation) fills it in.
    pub blk: BlockPointer,
    /// Whether the block landed on a dedicated log device.
    pub slog: bool,
    /// Sticky allocation/write error. An erroring lwb still participates
    /// in ordering as a null I/O.
    pub error: Option<std::io::ErrorKind>,
    /// Assembly buffer; taken by the write task at issue.
    pub buf: Option<Vec<u8>>,
    /// Block size in bytes.
    pub size: usize,
    /// Usable byte bound for record placement.
    pub nmax: usize,
    /// Fill cursor: bytes reserved by record placement.
    pub nused: usize,
    /// Commit cursor: bytes actually copied in; `nfilled <= nused`.
    pub nfilled: usize,
    /// Txg the block pointer was allocated in.
    pub alloc_txg: u64,
    /// Highest txg of any record inside.
    pub max_txg: u64,
    /// Txg of the transaction that issued the write.
    pub issued_txg: u64,
    pub issued_at: Option<Instant>,
    pub itxs: Vec<Itx>,
    pub waiters: Vec<Arc<CommitWaiter>>,
    pub root: Option<Arc<Task>>,
    pub write: Option<Arc<Task>>,
    pub child: Option<Arc<Task>>,
}

pub(crate) struct Lwb {
    pub slim: bool,
    state: AtomicU8,
    pub core: Mutex<LwbCore>,
    /// Devices this lwb's data (and any deferred predecessors') landed on.
    pub vdevs: Mutex<BTreeSet<DeviceId>>,
}

impl Lwb {
    /// We may already have a block pointer, in which case size and framing
    /// come from there. Or we may not yet, in which case we choose them
    /// here and later make the block allocation match.
    pub(crate) fn alloc(
        size: usize,
        bp: Option<(BlockPointer, bool)>,
        slim_default: bool,
        txg: u64,
        state: LwbState,
    ) -> Arc<Lwb> {
        let (blk, slog, slim, size) = match bp {
            Some((bp, slog)) => (
                bp,
                slog,
                bp.kind == ChainKind::Slim,
                bp.size as usize,
            ),
            None => (BlockPointer::HOLE, false, slim_default, size),
        };
        let (nmax, ninit) = if slim {
            (size, ChainHeader::LEN)
        } else {
            (size - ChainHeader::LEN, 0)
        };
        Arc::new(Lwb {
            slim,
            state: AtomicU8::new(state as u8),
            core: Mutex::new(LwbCore {
                blk,
                slog,
                error: None,
                buf: Some(vec![0; size]),
                size,
                nmax,
                nused: ninit,
                nfilled: ninit,
                alloc_txg: txg,
                max_txg: 0,
                issued_txg: 0,
                issued_at: None,
                itxs: Vec::new(),
                waiters: Vec::new(),
                root: None,
                write: None,
                child: None,
            }),
            vdevs: Mutex::new(BTreeSet::new()),
        })
    }

    pub(crate) fn state(&self) -> LwbState {
        LwbState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition the state machine. The caller must hold the lock the
    /// transition requires (see the module comment).
    pub(crate) fn set_state(&self, state: LwbState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record the devices `bp` was written to, so their caches can be
    /// flushed once the write completes.
    pub(crate) fn add_block(&self, bp: &BlockPointer, nocacheflush: bool) {
        debug_assert!(self.state() < LwbState::WriteDone);
        if nocacheflush {
            return;
        }
        let mut vdevs = self.vdevs.lock();
        for dva in bp.dvas() {
            vdevs.insert(dva.device);
        }
    }

    pub(crate) fn add_txg(&self, txg: u64) {
        let mut core = self.core.lock();
        core.max_txg = core.max_txg.max(txg);
    }

    /// Defer this lwb's flushes onto `next`: merge our device set into its
    /// and let it cover them.
    pub(crate) fn flush_defer(&self, next: &Lwb) {
        debug_assert_eq!(self.state(), LwbState::WriteDone);
        debug_assert!(next.state() < LwbState::WriteDone);
        let mut src = self.vdevs.lock();
        let mut dst = next.vdevs.lock();
        dst.append(&mut src);
    }

    /// Sanity checks for dropping an lwb from the list. Only NEW (teardown)
    /// and FLUSH_DONE lwbs may be freed.
    pub(crate) fn assert_freeable(&self) {
        debug_assert!(matches!(
            self.state(),
            LwbState::New | LwbState::FlushDone
        ));
        let core = self.core.lock();
        debug_assert!(core.itxs.is_empty());
        debug_assert!(core.waiters.is_empty());
        debug_assert!(core.root.is_none());
        debug_assert!(core.write.is_none());
        debug_assert!(core.child.is_none());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockptr::{ChainId, Dva};

    fn bp(size: u32, kind: ChainKind) -> BlockPointer {
        BlockPointer {
            dvas: [
                Dva {
                    device: 1,
                    offset: 0,
                },
                Dva::default(),
            ],
            ndvas: 1,
            kind,
            size,
            birth_txg: 1,
            chain: ChainId::default(),
        }
    }

    #[test]
    fn slim_geometry() {
        let lwb = Lwb::alloc(0, Some((bp(8192, ChainKind::Slim), false)), true, 1, LwbState::New);
        let core = lwb.core.lock();
        assert_eq!(core.size, 8192);
        assert_eq!(core.nmax, 8192);
        assert_eq!(core.nused, ChainHeader::LEN);
        assert_eq!(core.nfilled, ChainHeader::LEN);
    }

    #[test]
    fn legacy_geometry() {
        let lwb = Lwb::alloc(
            0,
            Some((bp(8192, ChainKind::Legacy), false)),
            true,
            1,
            LwbState::New,
        );
        let core = lwb.core.lock();
        assert_eq!(core.nmax, 8192 - ChainHeader::LEN);
        assert_eq!(core.nused, 0);
    }

    #[test]
    fn pending_allocation_uses_defaults() {
        let lwb = Lwb::alloc(16384, None, true, 0, LwbState::Opened);
        assert!(lwb.core.lock().blk.is_hole());
        assert!(lwb.slim);
        assert_eq!(lwb.state(), LwbState::Opened);
    }

    #[test]
    fn flush_defer_merges_device_sets() {
        let a = Lwb::alloc(4096, None, true, 0, LwbState::New);
        let b = Lwb::alloc(4096, None, true, 0, LwbState::New);
        a.add_block(&bp(4096, ChainKind::Slim), false);
        a.set_state(LwbState::Opened);
        a.set_state(LwbState::Closed);
        a.set_state(LwbState::Ready);
        a.set_state(LwbState::Issued);
        a.set_state(LwbState::WriteDone);
        b.add_block(
            &BlockPointer {
                dvas: [
                    Dva {
                        device: 2,
                        offset: 0,
                    },
                    Dva::default(),
                ],
                ndvas: 1,
                ..bp(4096, ChainKind::Slim)
            },
            false,
        );
        a.flush_defer(&b);
        assert!(a.vdevs.lock().is_empty());
        assert_eq!(
            b.vdevs.lock().iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn nocacheflush_skips_tracking() {
        let a = Lwb::alloc(4096, None, true, 0, LwbState::New);
        a.add_block(&bp(4096, ChainKind::Slim), true);
        assert!(a.vdevs.lock().is_empty());
    }
}
