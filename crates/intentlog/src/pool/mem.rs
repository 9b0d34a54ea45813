//! In-memory [`Pool`] for testing.
//!
//! Models the parts of the storage engine the log engine can observe: a
//! per-device bump allocator, a volatile write cache that only a cache
//! flush makes durable, claim bookkeeping, and a miniature checkpoint
//! (txg) machine whose `wait_synced` drives registered sync hooks -- the
//! stand-in for the main checkpoint engine calling back into
//! `IntentLog::sync` and `IntentLog::clean`.
//!
//! Failure injection covers block allocation and block writes, and
//! [`MemPool::crash`] drops the volatile cache to simulate power loss.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::blockptr::{BlockPointer, DeviceId, Dva};
use crate::pool::{Pool, WritePriority};

type SyncHook = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Store {
    next_offset: HashMap<DeviceId, u64>,
    stable: HashMap<Dva, Vec<u8>>,
    volatile: HashMap<Dva, Vec<u8>>,
    claimed: HashSet<Dva>,
    freed: HashSet<Dva>,
    alloc_failures: (u64, u64), // fail `1` allocations after skipping `0`
    write_failures: u64,
    allocs: u64,
    flushes: u64,
}

struct TxgState {
    open: u64,
    synced: u64,
    refs: HashMap<u64, usize>,
    syncing: bool,
}

pub struct MemPool {
    store: Mutex<Store>,
    txg: Mutex<TxgState>,
    txg_cv: Condvar,
    hooks: Mutex<Vec<SyncHook>>,
    devices: Vec<DeviceId>,
    slog: bool,
    slim: bool,
    checkpoint_txg: AtomicU64,
}

impl MemPool {
    pub fn new() -> Arc<MemPool> {
        MemPool::with_config(2, false, true)
    }

    /// `ndevices` data devices; with `slog`, device 0 is a dedicated log
    /// device and all log blocks land on it.
    pub fn with_config(ndevices: usize, slog: bool, slim: bool) -> Arc<MemPool> {
        assert!(ndevices > 0);
        Arc::new(MemPool {
            store: Mutex::new(Store::default()),
            txg: Mutex::new(TxgState {
                open: 1,
                synced: 0,
                refs: HashMap::new(),
                syncing: false,
            }),
            txg_cv: Condvar::new(),
            hooks: Mutex::new(Vec::new()),
            devices: (0..ndevices as u64).collect(),
            slog,
            slim,
            checkpoint_txg: AtomicU64::new(0),
        })
    }

    /// Pretend the imported uberblock is a checkpoint taken at `txg`.
    pub fn set_checkpoint_txg(&self, txg: u64) {
        self.checkpoint_txg.store(txg, Ordering::Relaxed);
    }

    /// Initialise logging once for tests that want `RUST_LOG` output.
    #[cfg(feature = "test")]
    pub fn init_test_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Register a hook run for every txg the checkpoint machine syncs.
    /// This is where a test harness wires `IntentLog::sync` and
    /// `IntentLog::clean`.
    pub fn on_sync(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        self.hooks.lock().push(Box::new(hook));
    }

    pub fn clear_sync_hooks(&self) {
        self.hooks.lock().clear();
    }

    /// Fail the next `count` block allocations after skipping `skip` more.
    pub fn fail_allocs_after(&self, skip: u64, count: u64) {
        self.store.lock().alloc_failures = (skip, count);
    }

    /// Fail the next `count` block writes.
    pub fn fail_next_writes(&self, count: u64) {
        self.store.lock().write_failures = count;
    }

    /// Drop everything that has not been flushed to stable storage.
    pub fn crash(&self) {
        self.store.lock().volatile.clear();
        self.hooks.lock().clear();
    }

    /// Flush every device's cache.
    pub fn flush_all(&self) {
        for dev in &self.devices {
            let _ = self.flush_device(*dev);
        }
    }

    pub fn claimed_count(&self) -> usize {
        self.store.lock().claimed.len()
    }

    pub fn freed_count(&self) -> usize {
        self.store.lock().freed.len()
    }

    pub fn alloc_count(&self) -> u64 {
        self.store.lock().allocs
    }

    pub fn flush_count(&self) -> u64 {
        self.store.lock().flushes
    }

    /// Whether the block is present on stable storage.
    pub fn is_stable(&self, bp: &BlockPointer) -> bool {
        let store = self.store.lock();
        bp.dvas().iter().all(|dva| store.stable.contains_key(dva))
    }

    fn run_hooks(&self, txg: u64) {
        // Snapshot outside any pool lock: hooks call back into the engine,
        // which in turn calls back into the pool.
        let hooks = self.hooks.lock();
        for hook in hooks.iter() {
            hook(txg);
        }
    }
}

impl Pool for MemPool {
    fn alloc_log_block(&self, txg: u64, size: u32) -> io::Result<(BlockPointer, bool)> {
        let mut store = self.store.lock();
        match &mut store.alloc_failures {
            (0, 0) => {}
            (0, count) => {
                *count -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::StorageFull,
                    "injected allocation failure",
                ));
            }
            (skip, _) => *skip -= 1,
        }
        let device = if self.slog {
            self.devices[0]
        } else {
            self.devices[(store.allocs % self.devices.len() as u64) as usize]
        };
        store.allocs += 1;
        let offset_slot = store.next_offset.entry(device).or_insert(0);
        let offset = *offset_slot;
        *offset_slot += u64::from(size);
        let mut bp = BlockPointer {
            size,
            birth_txg: txg,
            ndvas: 1,
            ..BlockPointer::HOLE
        };
        bp.dvas[0] = Dva { device, offset };
        Ok((bp, self.slog))
    }

    fn free_log_block(&self, _txg: u64, bp: &BlockPointer) {
        let mut store = self.store.lock();
        for dva in bp.dvas() {
            store.stable.remove(dva);
            store.volatile.remove(dva);
            store.claimed.remove(dva);
            store.freed.insert(*dva);
        }
    }

    fn claim_log_block(&self, txg: u64, bp: &BlockPointer) -> io::Result<()> {
        let mut store = self.store.lock();
        for dva in bp.dvas() {
            if !store.stable.contains_key(dva) && !store.volatile.contains_key(dva) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "claiming a block that was never written",
                ));
            }
            if txg != 0 {
                store.claimed.insert(*dva);
            }
        }
        Ok(())
    }

    fn read_block(&self, bp: &BlockPointer) -> io::Result<Vec<u8>> {
        let store = self.store.lock();
        for dva in bp.dvas() {
            if let Some(data) = store.volatile.get(dva).or_else(|| store.stable.get(dva)) {
                return Ok(data.clone());
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, "block not written"))
    }

    fn write_block(&self, bp: &BlockPointer, data: &[u8], _priority: WritePriority) -> io::Result<()> {
        let mut store = self.store.lock();
        if store.write_failures > 0 {
            store.write_failures -= 1;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            ));
        }
        assert!(data.len() <= bp.size as usize, "write exceeds block");
        for dva in bp.dvas() {
            store.volatile.insert(*dva, data.to_vec());
        }
        Ok(())
    }

    fn flush_device(&self, device: DeviceId) -> io::Result<()> {
        let mut store = self.store.lock();
        store.flushes += 1;
        let flushed: Vec<Dva> = store
            .volatile
            .keys()
            .filter(|dva| dva.device == device)
            .copied()
            .collect();
        for dva in flushed {
            if let Some(data) = store.volatile.remove(&dva) {
                store.stable.insert(dva, data);
            }
        }
        Ok(())
    }

    fn tx_assign(&self) -> u64 {
        let mut txg = self.txg.lock();
        let t = txg.open;
        *txg.refs.entry(t).or_insert(0) += 1;
        t
    }

    fn tx_commit(&self, t: u64) {
        let mut txg = self.txg.lock();
        let refs = txg.refs.get_mut(&t).expect("tx_commit without tx_assign");
        *refs -= 1;
        if *refs == 0 {
            txg.refs.remove(&t);
            self.txg_cv.notify_all();
        }
    }

    fn open_txg(&self) -> u64 {
        self.txg.lock().open
    }

    fn last_synced_txg(&self) -> u64 {
        self.txg.lock().synced
    }

    fn wait_synced(&self, target: u64) {
        let mut txg = self.txg.lock();
        let target = if target == 0 { txg.open } else { target };
        while txg.synced < target {
            if txg.syncing {
                self.txg_cv.wait(&mut txg);
                continue;
            }
            txg.syncing = true;
            let t = txg.synced + 1;
            if txg.open == t {
                txg.open = t + 1;
            }
            // Quiesce: wait for transactions still open in `t`.
            while txg.refs.get(&t).copied().unwrap_or(0) > 0 {
                self.txg_cv.wait(&mut txg);
            }
            drop(txg);
            self.run_hooks(t);
            txg = self.txg.lock();
            txg.synced = t;
            txg.syncing = false;
            self.txg_cv.notify_all();
        }
    }

    fn slim_log_blocks(&self) -> bool {
        self.slim
    }

    fn has_slog(&self) -> bool {
        self.slog
    }

    fn checkpoint_txg(&self) -> u64 {
        self.checkpoint_txg.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn volatile_until_flushed() {
        let pool = MemPool::new();
        let (bp, _) = pool.alloc_log_block(1, 4096).unwrap();
        pool.write_block(&bp, &[7u8; 4096], WritePriority::Sync).unwrap();

        assert!(!pool.is_stable(&bp));
        assert_eq!(pool.read_block(&bp).unwrap()[0], 7);

        pool.flush_device(bp.dvas[0].device).unwrap();
        assert!(pool.is_stable(&bp));

        // A crash now loses nothing.
        pool.crash();
        assert_eq!(pool.read_block(&bp).unwrap()[0], 7);
    }

    #[test]
    fn crash_drops_unflushed_writes() {
        let pool = MemPool::new();
        let (bp, _) = pool.alloc_log_block(1, 4096).unwrap();
        pool.write_block(&bp, &[7u8; 4096], WritePriority::Sync).unwrap();
        pool.crash();
        assert!(pool.read_block(&bp).is_err());
    }

    #[test]
    fn alloc_failure_injection() {
        let pool = MemPool::new();
        pool.fail_allocs_after(1, 1);
        assert!(pool.alloc_log_block(1, 4096).is_ok());
        assert!(pool.alloc_log_block(1, 4096).is_err());
        assert!(pool.alloc_log_block(1, 4096).is_ok());
    }

    #[test]
    fn wait_synced_runs_hooks_in_order() {
        let pool = MemPool::new();
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        pool.on_sync(move |txg| {
            assert_eq!(s.load(Ordering::SeqCst) + 1, txg);
            s.store(txg, Ordering::SeqCst);
        });

        assert_eq!(pool.last_synced_txg(), 0);
        pool.wait_synced(0);
        let synced = pool.last_synced_txg();
        assert!(synced >= 1);
        assert_eq!(seen.load(Ordering::SeqCst), synced);

        pool.wait_synced(synced + 2);
        assert_eq!(pool.last_synced_txg(), synced + 2);
    }

    #[test]
    fn tx_holds_back_sync() {
        let pool = MemPool::new();
        let t = pool.tx_assign();
        let p2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || p2.wait_synced(t));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(pool.last_synced_txg() < t);
        pool.tx_commit(t);
        waiter.join().unwrap();
        assert!(pool.last_synced_txg() >= t);
    }
}
