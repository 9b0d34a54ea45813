//! Per-txg record buckets.
//!
//! Records live here between assignment and either commit (moved onto the
//! commit list) or cleanup (their txg reached the main checkpoint, so the
//! log no longer needs them). Each slot has its own lock; producers on
//! different txgs never contend.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};

use crate::commit::CommitWaiter;
use crate::log::{IntentLog, IssuerCore};
use crate::pool::Pool;
use crate::record::{Itx, TX_COMMIT, TX_RENAME};
use crate::{TXG_CONCURRENT, TXG_MASK};

#[derive(Default)]
pub(crate) struct ItxgSlot {
    /// Txg this slot currently buffers; zero when empty.
    pub txg: u64,
    /// Synchronous records, FIFO.
    pub sync: VecDeque<Itx>,
    /// Asynchronous records, FIFO per object.
    pub async_: BTreeMap<u64, VecDeque<Itx>>,
}

impl ItxgSlot {
    fn take(&mut self) -> (VecDeque<Itx>, BTreeMap<u64, VecDeque<Itx>>) {
        self.txg = 0;
        (
            std::mem::take(&mut self.sync),
            std::mem::take(&mut self.async_),
        )
    }
}

/// Destroy a detached slot's records. Runs on the cleanup worker (or
/// inline when dispatch fails), so it must not touch engine locks beyond
/// the waiters being skipped.
pub(crate) fn itxg_clean(sync: VecDeque<Itx>, async_: BTreeMap<u64, VecDeque<Itx>>) {
    for mut itx in sync {
        // Commit records can be found here when a commit races the main
        // checkpoint: the marker was assigned, but the txg synced before
        // the commit writer got to it. Their waiters must still be
        // signalled; the records they were waiting on are in the
        // checkpoint.
        if itx.header().kind() == TX_COMMIT {
            if let Some(waiter) = itx.waiter.take() {
                CommitWaiter::skip(&waiter);
            }
        }
        itx.destroy();
    }
    for (_, list) in async_ {
        for itx in list {
            debug_assert_ne!(itx.header().kind(), TX_COMMIT);
            itx.destroy();
        }
    }
}

impl<P: Pool> IntentLog<P> {
    /// Bind `itx` to the checkpoint txg it was produced in and queue it
    /// for commit.
    pub fn assign(&self, mut itx: Itx, txg: u64) {
        // Ensure the data of a renamed file is committed before the
        // rename.
        if itx.header().kind() == TX_RENAME {
            self.async_to_sync(itx.object);
        }

        let mut stale = None;
        {
            let mut slot = self.itxg_slot(txg).lock();
            if slot.txg != txg {
                if slot.txg != 0 {
                    // The cleanup callback hasn't got around to this slot
                    // yet. Detach its contents for release below; this
                    // should be rare.
                    debug!("missed itxg cleanup for txg {}", slot.txg);
                    stale = Some(slot.take());
                }
                slot.txg = txg;
            }
            itx.hdr.txg = txg;
            if itx.sync {
                slot.sync.push_back(itx);
            } else {
                slot.async_.entry(itx.object).or_default().push_back(itx);
            }
        }
        self.dirty(txg);

        // Release the old records now that we've dropped the lock.
        if let Some((sync, async_)) = stale {
            itxg_clean(sync, async_);
        }
    }

    /// Strip pending async records for an unlinked object from every live
    /// slot, so stale records for a reused object id are not replayed.
    pub fn remove_async(&self, object: u64) {
        debug_assert_ne!(object, 0);
        let mut clean = VecDeque::new();
        let otxg = self.pool().last_synced_txg() + 1;
        for txg in otxg..otxg + TXG_CONCURRENT {
            let mut slot = self.itxg_slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            if let Some(mut list) = slot.async_.remove(&object) {
                clean.append(&mut list);
            }
        }
        for itx in clean {
            itx.destroy();
        }
    }

    /// Splice the named object's async records (or every object's, for
    /// `object == 0`) onto the sync lists, preserving per-object order.
    pub fn async_to_sync(&self, object: u64) {
        let otxg = self.pool().last_synced_txg() + 1;
        for txg in otxg..otxg + TXG_CONCURRENT {
            let mut slot = self.itxg_slot(txg).lock();
            if slot.txg != txg {
                continue;
            }
            // Append to the end rather than the beginning, to ensure the
            // create has happened.
            if object != 0 {
                if let Some(mut list) = slot.async_.remove(&object) {
                    slot.sync.append(&mut list);
                }
            } else {
                let all = std::mem::take(&mut slot.async_);
                for (_, mut list) in all {
                    slot.sync.append(&mut list);
                }
            }
        }
    }

    /// Free records whose txg has reached the main checkpoint. Dispatched
    /// to the cleanup worker; falls back to inline cleanup if dispatch
    /// fails.
    pub fn clean(&self, synced_txg: u64) {
        let detached = {
            let mut slot = self.itxg_slot(synced_txg).lock();
            if slot.txg == 0 {
                return;
            }
            debug_assert!(slot.txg <= synced_txg);
            slot.take()
        };
        let job = Box::new(move || itxg_clean(detached.0, detached.1));
        if let Err(job) = self.cleaner().dispatch(job) {
            warn!("itxg cleanup dispatch failed; cleaning inline");
            job();
        }
    }

    /// Move every live slot's sync list onto the commit list, charging the
    /// burst accumulators. If the log is suspending, records stay in place
    /// and the highest affected txg is returned so the caller waits on the
    /// main checkpoint instead.
    pub(crate) fn get_commit_list(&self, iss: &mut IssuerCore) -> u64 {
        let mut wtxg = 0;
        // Inherently racy: nothing prevents the last synced txg from
        // moving. That's okay, we'll only commit things in the future.
        let otxg = self.pool().last_synced_txg() + 1;
        for txg in otxg..otxg + TXG_CONCURRENT {
            let mut slot = self.itxg_slot(txg).lock();
            if slot.txg != txg {
                continue;
            }

            if self.suspended() {
                // The log was just suspended, but we lost the race. Allow
                // all earlier records to be committed, but ask the caller
                // to wait on the checkpoint for any new ones.
                if !slot.sync.is_empty() {
                    wtxg = wtxg.max(txg);
                }
                continue;
            }

            let start = iss.commit_list.len();
            iss.commit_list.append(&mut slot.sync);
            drop(slot);

            for itx in iss.commit_list.iter().skip(start) {
                let s = itx.full_size();
                iss.cur_size += s;
                iss.cur_left += s;
                iss.cur_max = iss.cur_max.max(itx.record_size());
            }
        }
        self.set_cur_burst_size(iss.cur_size);
        wtxg
    }

    pub(crate) fn itxg_slot(&self, txg: u64) -> &parking_lot::Mutex<ItxgSlot> {
        &self.itxgs()[(txg & TXG_MASK) as usize]
    }
}
