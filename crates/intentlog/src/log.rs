//! The per-dataset engine state and its lifecycle.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::blockptr::{BlockPointer, ChainId, ChainKind};
use crate::claim::WalkStop;
use crate::error::GetDataError;
use crate::io::{Dispatcher, Task, Taskq};
use crate::itxg::ItxgSlot;
use crate::lwb::{Lwb, LwbState};
use crate::metrics::Metrics;
use crate::plan::BurstHistory;
use crate::pool::Pool;
use crate::record::{Itx, WriteHeader, WriteState, TX_WRITE};
use crate::{Options, MIN_BLOCK_SIZE, TXG_MASK, TXG_SIZE};

bitflags! {
    /// Persisted header flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HeaderFlags: u64 {
        /// The chain was claimed with records in it; replay must run
        /// before the dataset is used.
        const REPLAY_NEEDED = 1 << 0;
        /// `claim_lr_seq` was recorded at claim time (old headers did not).
        const CLAIM_LR_SEQ_VALID = 1 << 1;
        /// The chain may carry extended record types.
        const EXTENSION_ACTIVE = 1 << 2;
    }
}

/// The persisted per-dataset log header.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LogHeader {
    /// Txg at which the chain was claimed on import.
    pub claim_txg: u64,
    /// Highest record seq already applied by replay.
    pub replay_seq: u64,
    /// First block of the chain, or a hole.
    pub log: BlockPointer,
    /// Highest block seq observed at claim.
    pub claim_blk_seq: u64,
    pub flags: HeaderFlags,
    /// Highest record seq observed at claim.
    pub claim_lr_seq: u64,
}

impl LogHeader {
    pub const LEN: usize = 192;

    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= Self::LEN);
        let out = &mut out[..Self::LEN];
        out.fill(0);
        out[0..8].copy_from_slice(&self.claim_txg.to_le_bytes());
        out[8..16].copy_from_slice(&self.replay_seq.to_le_bytes());
        self.log.encode(&mut out[16..16 + BlockPointer::LEN]);
        let base = 16 + BlockPointer::LEN;
        out[base..base + 8].copy_from_slice(&self.claim_blk_seq.to_le_bytes());
        out[base + 8..base + 16].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[base + 16..base + 24].copy_from_slice(&self.claim_lr_seq.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short log header",
            ));
        }
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let base = 16 + BlockPointer::LEN;
        Ok(LogHeader {
            claim_txg: u64_at(0),
            replay_seq: u64_at(8),
            log: BlockPointer::decode(&buf[16..16 + BlockPointer::LEN])?,
            claim_blk_seq: u64_at(base),
            flags: HeaderFlags::from_bits_truncate(u64_at(base + 8)),
            claim_lr_seq: u64_at(base + 16),
        })
    }
}

/// Synchronous-semantics setting for a log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum SyncMode {
    /// Honor explicit synchronous requests.
    #[default]
    Standard = 0,
    /// Treat every operation as synchronous.
    Always = 1,
    /// Never wait; durability comes only from the main checkpoint.
    Disabled = 2,
}

/// Hint trading log latency against main-pool throughput.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum LogBias {
    #[default]
    Latency = 0,
    Throughput = 1,
}

/// Handle through which `get_data` enrolls externally issued data writes
/// under the log block's child aggregator, so the block's flushes wait for
/// them.
pub struct ChildIo {
    pub(crate) task: Arc<Task>,
    pub(crate) dispatch: crossbeam_channel::Sender<Arc<Task>>,
    pub(crate) lwb: Arc<Lwb>,
    pub(crate) nocacheflush: bool,
}

impl ChildIo {
    /// Run `work` as a child of the aggregator. The owning block's write
    /// completes (and its cache flushes start) only after `work` finishes.
    pub fn enroll(&self, work: impl FnOnce() -> io::Result<()> + Send + 'static) {
        let task = Task::run(&self.dispatch, work, None, true);
        Task::add_child(&self.task, &task);
        Task::submit(&task);
    }

    /// Record the devices `bp` landed on, so the owning block's cache
    /// flushes cover the externally written data too.
    pub fn cover_block(&self, bp: &BlockPointer) {
        self.lwb.add_block(bp, self.nocacheflush);
    }
}

/// Callback fetching the payload of indirect and need-copy writes while a
/// block is being filled.
///
/// For need-copy writes `buf` is the in-block destination to fill; for
/// indirect writes `buf` is `None` and the callback must stamp the data's
/// block pointer into `header`, enrolling any writes it issues via `child`.
pub trait GetData: Send + Sync {
    fn get_data(
        &self,
        gen: u64,
        header: &mut WriteHeader,
        buf: Option<&mut [u8]>,
        child: &ChildIo,
    ) -> Result<(), GetDataError>;
}

/// State owned by the issuer lock: commit staging and burst accounting.
/// Only one thread at a time builds and submits blocks.
pub(crate) struct IssuerCore {
    pub commit_list: VecDeque<Itx>,
    /// Record sequence counter; stamped as records are placed.
    pub lr_seq: u64,
    /// Total bytes of the burst being committed.
    pub cur_size: u64,
    /// Bytes of the burst not yet charged to a block.
    pub cur_left: u64,
    /// Largest single record of the burst.
    pub cur_max: u64,
    /// Decaying count of bursts that looked multi-threaded; while nonzero
    /// the tail block is left open for write aggregation.
    pub parallel: u32,
    pub history: BurstHistory,
}

/// State owned by the log lock.
pub(crate) struct LogCore {
    /// All live lwbs, in creation = chain order.
    pub lwbs: VecDeque<Arc<Lwb>>,
    pub last_opened: Option<Arc<Lwb>>,
    /// Txg in which the chain is being destroyed; guards double destroy.
    pub destroy_txg: u64,
    /// Keep the first block through the destroy (replay of an empty log).
    pub keep_first: bool,
    pub suspending: bool,
    pub replaying: bool,
    /// Seq of the record currently being replayed.
    pub replaying_seq: u64,
    /// Per-txg replayed-seq markers, persisted by `sync`.
    pub replayed_seq: [u64; TXG_SIZE],
    /// Extension-feature activation waiting to be persisted.
    pub feature_pending: bool,
}

pub(crate) struct LwbIo {
    pub inflight: [u64; TXG_SIZE],
    pub max_issued_txg: u64,
}

/// One dataset's intent log.
///
/// A cheap-clone handle; clones share the same engine. Completion
/// callbacks hold clones, so the engine lives until its last in-flight
/// I/O has drained.
pub struct IntentLog<P: Pool> {
    shared: Arc<LogShared<P>>,
}

impl<P: Pool> Clone for IntentLog<P> {
    fn clone(&self) -> Self {
        IntentLog {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Pool> std::ops::Deref for IntentLog<P> {
    type Target = LogShared<P>;

    fn deref(&self) -> &LogShared<P> {
        &self.shared
    }
}

pub struct LogShared<P: Pool> {
    pool: Arc<P>,
    objset: u64,
    opts: Options,
    /// Effective block-size ceiling: the tunable clamped to the pool.
    max_block_size: u64,
    get_data: Box<dyn GetData>,
    is_snapshot: bool,
    metrics: Metrics,
    pub(crate) issuer: Mutex<IssuerCore>,
    pub(crate) inner: Mutex<LogCore>,
    /// Signalled when a suspend finishes; paired with `inner`.
    pub(crate) suspend_cv: Condvar,
    header: Mutex<LogHeader>,
    pub(crate) lwb_io: Mutex<LwbIo>,
    pub(crate) lwb_io_cv: Condvar,
    itxgs: [Mutex<ItxgSlot>; TXG_SIZE],
    suspend_count: AtomicU32,
    sync_mode: AtomicU8,
    logbias: AtomicU8,
    /// EMA of block write-to-stable latency, nanoseconds.
    latency: AtomicU64,
    dirty_max_txg: AtomicU64,
    /// Racy mirror of the issuer's burst size, for write-priority
    /// decisions at issue time.
    cur_burst_size: AtomicU64,
    io: Dispatcher,
    cleaner: Taskq,
}

impl<P: Pool> IntentLog<P> {
    /// Open the log for `objset`, resuming from the persisted `header`.
    pub fn open(
        pool: Arc<P>,
        objset: u64,
        header: LogHeader,
        get_data: impl GetData + 'static,
        opts: Options,
    ) -> IntentLog<P> {
        let max_block_size = (opts.max_block_size as u64)
            .min(pool.max_block_size() as u64)
            .max(MIN_BLOCK_SIZE as u64)
            & !(MIN_BLOCK_SIZE as u64 - 1);
        let shared = Arc::new(LogShared {
            pool,
            objset,
            opts,
            max_block_size,
            get_data: Box::new(get_data),
            is_snapshot: false,
            metrics: Metrics::default(),
            issuer: Mutex::new(IssuerCore {
                commit_list: VecDeque::new(),
                lr_seq: 0,
                cur_size: 0,
                cur_left: 0,
                cur_max: 0,
                parallel: 0,
                history: BurstHistory::new(max_block_size),
            }),
            inner: Mutex::new(LogCore {
                lwbs: VecDeque::new(),
                last_opened: None,
                destroy_txg: 0,
                keep_first: false,
                suspending: false,
                replaying: false,
                replaying_seq: 0,
                replayed_seq: [0; TXG_SIZE],
                feature_pending: false,
            }),
            suspend_cv: Condvar::new(),
            header: Mutex::new(header),
            lwb_io: Mutex::new(LwbIo {
                inflight: [0; TXG_SIZE],
                max_issued_txg: 0,
            }),
            lwb_io_cv: Condvar::new(),
            itxgs: Default::default(),
            suspend_count: AtomicU32::new(0),
            sync_mode: AtomicU8::new(SyncMode::Standard as u8),
            logbias: AtomicU8::new(LogBias::Latency as u8),
            latency: AtomicU64::new(0),
            dirty_max_txg: AtomicU64::new(0),
            cur_burst_size: AtomicU64::new(0),
            io: Dispatcher::new("intentlog-io"),
            cleaner: Taskq::new("intentlog-clean"),
        });
        IntentLog { shared }
    }

    pub fn objset(&self) -> u64 {
        self.objset
    }

    /// The persisted header as of the last `sync`.
    pub fn header(&self) -> LogHeader {
        *self.header.lock()
    }

    pub(crate) fn header_mut(&self) -> parking_lot::MutexGuard<'_, LogHeader> {
        self.header.lock()
    }

    pub fn metrics(&self) -> crate::MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn set_sync(&self, mode: SyncMode) {
        self.sync_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn set_logbias(&self, bias: LogBias) {
        self.logbias.store(bias as u8, Ordering::Relaxed);
    }

    pub fn sync_mode(&self) -> SyncMode {
        match self.sync_mode.load(Ordering::Relaxed) {
            1 => SyncMode::Always,
            2 => SyncMode::Disabled,
            _ => SyncMode::Standard,
        }
    }

    pub fn logbias(&self) -> LogBias {
        if self.logbias.load(Ordering::Relaxed) == 1 {
            LogBias::Throughput
        } else {
            LogBias::Latency
        }
    }

    pub(crate) fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    pub(crate) fn options(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn metrics_ref(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn get_data_cb(&self) -> &dyn GetData {
        &*self.get_data
    }

    pub(crate) fn cleaner(&self) -> &Taskq {
        &self.cleaner
    }

    pub(crate) fn io_dispatch(&self) -> &crossbeam_channel::Sender<Arc<Task>> {
        self.io.sender()
    }

    pub(crate) fn itxgs(&self) -> &[Mutex<ItxgSlot>; TXG_SIZE] {
        &self.itxgs
    }

    pub(crate) fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    pub(crate) fn suspended(&self) -> bool {
        self.suspend_count.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn max_block_size(&self) -> u64 {
        self.max_block_size
    }

    /// Maximum record bytes one block can carry alongside a record header
    /// of `hdrsize` bytes.
    pub fn max_log_data(&self, hdrsize: usize) -> u64 {
        crate::plan::max_log_data(self.max_block_size, hdrsize as u64)
    }

    /// Cap on bytes a [`WriteState::Copied`] record may inline.
    pub fn max_copied_data(&self) -> u64 {
        self.max_log_data(WriteHeader::LEN).min(self.opts.max_copied as u64)
    }

    /// Choose how a write of `size` bytes into an object with `blocksize`
    /// blocks should travel, given whether the caller bypasses the cache
    /// (`o_direct`) and whether it will commit immediately.
    pub fn write_state(
        &self,
        size: u64,
        blocksize: u32,
        o_direct: bool,
        commit: bool,
    ) -> WriteState {
        if self.logbias() == LogBias::Throughput || o_direct {
            return WriteState::Indirect;
        }

        // Don't use indirect for small writes, to reduce overhead. Don't
        // use indirect for less than half a block if it commits
        // immediately: the next write might rewrite the same block,
        // causing inflation. Without a commit the next writes might
        // coalesce, and so the indirect may be perfect.
        let mut indirect = size >= self.opts.immediate_write_sz as u64
            && (size >= blocksize as u64 / 2 || !commit);

        if self.pool.has_slog() {
            // Dedicated log devices: never use indirect.
            indirect = false;
        } else if self.pool.has_special() {
            // Special tier: only when beneficial.
            let on_special = blocksize <= self.pool.special_smallblock();
            indirect &= on_special || !self.opts.special_is_slog;
        }

        if indirect {
            WriteState::Indirect
        } else if commit {
            if size <= self.max_copied_data() {
                WriteState::Copied
            } else {
                WriteState::NeedCopy
            }
        } else {
            WriteState::NeedCopy
        }
    }

    /// Record that the log holds work for `txg`, so the per-txg cleaner
    /// runs for it.
    pub(crate) fn dirty(&self, txg: u64) {
        debug_assert!(!self.is_snapshot, "dirtying a snapshot's log");
        self.dirty_max_txg.fetch_max(txg, Ordering::Relaxed);
    }

    pub(crate) fn update_latency(&self, sample_nanos: u64) {
        let prev = self.latency.load(Ordering::Relaxed);
        let next = (prev * 7 + sample_nanos) / 8;
        self.latency.store(next, Ordering::Relaxed);
    }

    pub(crate) fn latency_nanos(&self) -> u64 {
        self.latency.load(Ordering::Relaxed)
    }

    pub(crate) fn cur_burst_size(&self) -> u64 {
        self.cur_burst_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cur_burst_size(&self, size: u64) {
        self.cur_burst_size.store(size, Ordering::Relaxed);
    }

    /// Allocate an lwb and link it at the chain tail.
    pub(crate) fn alloc_lwb(
        &self,
        size: usize,
        bp: Option<(BlockPointer, bool)>,
        txg: u64,
        state: LwbState,
    ) -> Arc<Lwb> {
        let lwb = Lwb::alloc(size, bp, self.pool.slim_log_blocks(), txg, state);
        let mut inner = self.inner.lock();
        inner.lwbs.push_back(Arc::clone(&lwb));
        if state != LwbState::New {
            inner.last_opened = Some(Arc::clone(&lwb));
        }
        lwb
    }

    /// Create an on-disk chain: allocate the first block if the header
    /// does not already point at one, stamp a fresh chain identity, and
    /// wait for the header update to sync out.
    ///
    /// Returns `None` if block allocation failed; the caller then treats
    /// every record as having no block, and stalls.
    pub(crate) fn create_chain(&self) -> Option<Arc<Lwb>> {
        // Wait for any previous destroy to complete.
        let destroy_txg = self.inner.lock().destroy_txg;
        if destroy_txg != 0 {
            self.pool.wait_synced(destroy_txg);
        }

        let zh = self.header();
        debug_assert_eq!(zh.claim_txg, 0);
        debug_assert_eq!(zh.replay_seq, 0);

        let mut blk = zh.log;
        let mut slog = false;
        let mut tx = None;
        let mut error = None;

        if blk.is_hole() {
            let txg = self.pool.tx_assign();
            tx = Some(txg);
            match self.pool.alloc_log_block(txg, MIN_BLOCK_SIZE as u32) {
                Ok((mut bp, s)) => {
                    bp.kind = if self.pool.slim_log_blocks() {
                        ChainKind::Slim
                    } else {
                        ChainKind::Legacy
                    };
                    bp.chain = self.fresh_chain_id();
                    blk = bp;
                    slog = s;
                }
                Err(e) => {
                    warn!("chain create: block allocation failed: {e}");
                    error = Some(e.kind());
                }
            }
        }

        let lwb = if error.is_none() {
            Some(self.alloc_lwb(0, Some((blk, slog)), tx.unwrap_or(0), LwbState::New))
        } else {
            None
        };

        if let Some(txg) = tx {
            // The header lives in the main checkpoint; commit our
            // transaction and wait for `sync` to stuff the block pointer
            // into it.
            self.inner.lock().feature_pending = true;
            self.pool.tx_commit(txg);
            self.pool.wait_synced(txg);
        } else {
            self.activate_extension_feature();
        }

        lwb
    }

    fn fresh_chain_id(&self) -> ChainId {
        ChainId {
            guid: [rand::random::<u64>(), rand::random::<u64>()],
            objset: self.objset,
            seq: 1,
        }
    }

    /// Activate the extended-record-types feature on a chain that already
    /// exists (created before the feature was enabled).
    pub(crate) fn activate_extension_feature(&self) {
        if self.header().flags.contains(HeaderFlags::EXTENSION_ACTIVE) {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.feature_pending {
            return;
        }
        inner.feature_pending = true;
        drop(inner);
        let txg = self.pool.tx_assign();
        self.pool.tx_commit(txg);
        self.pool.wait_synced(txg);
    }

    /// Free every lwb and, unless `keep_first` is set, walk the on-disk
    /// chain freeing its blocks. Returns whether there was a chain at all.
    ///
    /// With `keep_first`, a replayed-but-empty log retains its first block
    /// so the next synchronous transaction does not need to wait for the
    /// main checkpoint before writing.
    pub fn destroy(&self, keep_first: bool) -> bool {
        // Wait for any previous destroy to complete.
        let destroy_txg = self.inner.lock().destroy_txg;
        if destroy_txg != 0 {
            self.pool.wait_synced(destroy_txg);
        }

        let zh = self.header();
        if zh.log.is_hole() {
            return false;
        }

        let txg = self.pool.tx_assign();
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.destroy_txg < txg);
            inner.destroy_txg = txg;
            inner.keep_first = keep_first;

            if !inner.lwbs.is_empty() {
                debug_assert_eq!(zh.claim_txg, 0);
                debug_assert!(!keep_first);
                while let Some(lwb) = inner.lwbs.pop_front() {
                    let mut core = lwb.core.lock();
                    core.buf = None;
                    if !core.blk.is_hole() {
                        self.pool.free_log_block(txg, &core.blk);
                    }
                    drop(core);
                    self.free_lwb(&mut inner, &lwb);
                }
            } else if !keep_first {
                drop(inner);
                self.destroy_sync(txg);
            }
        }
        self.pool.tx_commit(txg);
        true
    }

    /// Free the chain's on-disk blocks by walking it. Used when no lwbs
    /// are in memory (import-time destroy after replay).
    pub(crate) fn destroy_sync(&self, txg: u64) {
        debug_assert!(self.inner.lock().lwbs.is_empty());
        let zh = self.header();
        let claim_txg = zh.claim_txg;
        let mut seen = HashSet::new();
        let outcome = self.parse_chain(
            &zh,
            |bp| {
                self.pool.free_log_block(txg, bp);
                Ok(())
            },
            |hdr, bytes| {
                // Free the data blocks of claimed indirect writes.
                if claim_txg == 0 || hdr.kind() != TX_WRITE {
                    return Ok(());
                }
                let wh = WriteHeader::decode(bytes).map_err(WalkStop::from)?;
                let bp = wh.blkptr;
                if bp.birth_txg >= claim_txg && !bp.is_hole() && seen.insert(bp.dvas[0]) {
                    self.pool.free_log_block(txg, &bp);
                }
                Ok(())
            },
        );
        if let Some(e) = outcome.error {
            debug!("destroy walk ended early: {e}");
        }
    }

    pub(crate) fn free_lwb(&self, inner: &mut LogCore, lwb: &Arc<Lwb>) {
        lwb.assert_freeable();
        // Clear the last-opened pointer so it cannot dangle past the
        // lwb's removal from the list.
        if let Some(last) = &inner.last_opened {
            if Arc::ptr_eq(last, lwb) {
                inner.last_opened = None;
            }
        }
    }

    /// Wait for completion of every issued write and flush of `txg`.
    pub(crate) fn flush_wait_all(&self, txg: u64) {
        let mut io = self.lwb_io.lock();
        while io.inflight[(txg & TXG_MASK) as usize] > 0 {
            self.lwb_io_cv.wait(&mut io);
        }
    }

    /// Runs in checkpoint-sync context: persist replay markers, advance
    /// the header past synced blocks, and free their lwbs.
    pub fn sync(&self, txg: u64) {
        self.flush_wait_all(txg);

        let mut inner = self.inner.lock();
        let mut zh = self.header.lock();

        let replayed = inner.replayed_seq[(txg & TXG_MASK) as usize];
        if replayed != 0 {
            debug_assert!(zh.replay_seq < replayed);
            zh.replay_seq = replayed;
            inner.replayed_seq[(txg & TXG_MASK) as usize] = 0;
        }

        if inner.feature_pending {
            zh.flags |= HeaderFlags::EXTENSION_ACTIVE;
            inner.feature_pending = false;
        }

        if inner.destroy_txg == txg {
            let blk = zh.log;
            debug_assert!(inner.lwbs.is_empty());

            *zh = LogHeader::default();
            inner.replayed_seq = [0; TXG_SIZE];

            if inner.keep_first {
                // The kept block may have been part of a chain that could
                // not be claimed because a device was missing. Give the
                // new chain a fresh identity so whatever the block holds
                // cannot revalidate.
                let mut blk = blk;
                blk.chain = self.fresh_chain_id();
                zh.log = blk;
            }
            // Otherwise the zeroed flags deactivate the extension feature
            // until a new chain activates it again.
        }

        while let Some(lwb) = inner.lwbs.front().cloned() {
            let core = lwb.core.lock();
            zh.log = core.blk;
            if lwb.state() != LwbState::FlushDone
                || core.alloc_txg > txg
                || core.max_txg > txg
            {
                break;
            }
            let blk = core.blk;
            drop(core);
            inner.lwbs.pop_front();
            if !blk.is_hole() {
                self.pool.free_log_block(txg, &blk);
            }
            self.free_lwb(&mut inner, &lwb);

            // Nothing left: after an allocation failure the header must
            // not keep pointing at a freed block.
            if inner.lwbs.is_empty() {
                zh.log = BlockPointer::HOLE;
            }
        }
    }

    /// Suspend the log: commit in-flight work, drain the chain, and make
    /// subsequent commits fall back to the main checkpoint until
    /// [`IntentLog::resume`].
    pub fn suspend(&self) -> Result<(), crate::error::SuspendError> {
        use crate::error::SuspendError;

        let mut inner = self.inner.lock();
        let zh = self.header();

        if zh.flags.contains(HeaderFlags::REPLAY_NEEDED) {
            return Err(SuspendError::Busy);
        }

        let prev = self.suspend_count.fetch_add(1, Ordering::Relaxed);
        if prev > 0 {
            // Someone else is already suspending it; just wait for them
            // to finish.
            while inner.suspending {
                self.suspend_cv.wait(&mut inner);
            }
            return Ok(());
        }

        if zh.log.is_hole() {
            // No on-disk chain, so the log cannot be active; nothing to
            // clean up.
            return Ok(());
        }

        if !self.pool.key_available() {
            self.suspend_count.fetch_sub(1, Ordering::Relaxed);
            return Err(SuspendError::Permission);
        }

        inner.suspending = true;
        drop(inner);

        self.metrics.bump(&self.metrics.commit_suspend_count);

        // Commit directly rather than through `commit`, which would see
        // the raised suspend count and only wait on the checkpoint --
        // without draining OPENED/CLOSED/READY blocks to FLUSH_DONE.
        self.commit_impl(0);
        self.pool.wait_synced(0);

        self.destroy(false);

        let mut inner = self.inner.lock();
        inner.suspending = false;
        self.suspend_cv.notify_all();
        Ok(())
    }

    pub fn resume(&self) {
        let prev = self.suspend_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Close the log: final commit, wait for everything it produced to
    /// reach the main checkpoint, and drop the remaining empty block.
    pub fn close(&self) {
        if !self.is_snapshot {
            self.commit(0);
        }

        let mut txg = self.dirty_max_txg.load(Ordering::Relaxed);
        {
            let inner = self.inner.lock();
            if let Some(lwb) = inner.lwbs.back() {
                let core = lwb.core.lock();
                txg = txg.max(core.alloc_txg).max(core.max_txg);
            }
        }
        // The transaction that allocated a block may be newer than any
        // record inside it.
        txg = txg.max(self.lwb_io.lock().max_issued_txg);

        if txg != 0 {
            self.pool.wait_synced(txg);
        }

        let mut inner = self.inner.lock();
        if let Some(lwb) = inner.lwbs.pop_front() {
            debug_assert!(inner.lwbs.is_empty());
            debug_assert_eq!(lwb.state(), LwbState::New);
            lwb.core.lock().buf = None;
            self.free_lwb(&mut inner, &lwb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemPool;
    use pretty_assertions::assert_eq;

    struct NoData;
    impl GetData for NoData {
        fn get_data(
            &self,
            _gen: u64,
            _header: &mut WriteHeader,
            _buf: Option<&mut [u8]>,
            _child: &ChildIo,
        ) -> Result<(), GetDataError> {
            Err(GetDataError::NotFound)
        }
    }

    fn open_log(pool: &Arc<MemPool>) -> IntentLog<MemPool> {
        IntentLog::open(
            Arc::clone(pool),
            1,
            LogHeader::default(),
            NoData,
            Options::default(),
        )
    }

    #[test]
    fn header_roundtrip() {
        let hdr = LogHeader {
            claim_txg: 9,
            replay_seq: 4,
            log: BlockPointer::HOLE,
            claim_blk_seq: 17,
            flags: HeaderFlags::REPLAY_NEEDED | HeaderFlags::CLAIM_LR_SEQ_VALID,
            claim_lr_seq: 23,
        };
        let mut buf = [0u8; LogHeader::LEN];
        hdr.encode(&mut buf);
        assert_eq!(hdr, LogHeader::decode(&buf).unwrap());
    }

    #[test]
    fn write_state_heuristics() {
        let pool = MemPool::new();
        let log = open_log(&pool);

        // Small writes inline.
        assert_eq!(log.write_state(512, 4096, false, true), WriteState::Copied);
        // Small writes without an immediate commit defer the copy.
        assert_eq!(
            log.write_state(512, 4096, false, false),
            WriteState::NeedCopy
        );
        // Large writes go indirect.
        assert_eq!(
            log.write_state(64 * 1024, 128 * 1024, false, true),
            WriteState::Indirect
        );
        // O_DIRECT always goes indirect.
        assert_eq!(log.write_state(512, 4096, true, true), WriteState::Indirect);
        // Throughput bias always goes indirect.
        log.set_logbias(LogBias::Throughput);
        assert_eq!(log.write_state(512, 4096, false, true), WriteState::Indirect);
        log.set_logbias(LogBias::Latency);
        // An inline write above the copied cap degrades to need-copy.
        assert_eq!(
            log.write_state(16 * 1024, 128 * 1024, false, true),
            WriteState::NeedCopy
        );
    }

    #[test]
    fn write_state_with_slog() {
        let pool = MemPool::with_config(2, true, true);
        let log = open_log(&pool);
        // Dedicated log devices never use indirect.
        assert_eq!(
            log.write_state(64 * 1024, 128 * 1024, false, false),
            WriteState::NeedCopy
        );
    }

    #[test]
    fn latency_ema_converges() {
        let pool = MemPool::new();
        let log = open_log(&pool);
        for _ in 0..64 {
            log.update_latency(8_000);
        }
        let ema = log.latency_nanos();
        assert!((7_000..=8_000).contains(&ema), "ema={ema}");
    }
}
