//! The commit path: turning "make everything up to now durable" into
//! ordered block writes and a signalled waiter.
//!
//! A caller's commit creates a commit-marker record carrying a waiter and
//! assigns it like any other record, so the marker sits in the queue
//! between already-queued and future records. The commit writer (serialized
//! by the issuer lock) drains the queues into blocks; the waiter's `done`
//! flip happens in the FLUSH_DONE callback of the block the marker landed
//! in, which the task graph orders after every earlier block's FLUSH_DONE.
//!
//! The commit list is FIFO, the block list is FIFO, and root-task edges
//! chain completion; together these make a waiter's wakeup causally follow
//! durability of every record queued before it.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::lwb::{Lwb, LwbState};
use crate::log::{IntentLog, IssuerCore};
use crate::plan::BURSTS;
use crate::pool::Pool;
use crate::record::{Itx, TX_COMMIT};
use crate::SyncMode;

pub(crate) struct WaiterState {
    pub done: bool,
    pub error: Option<io::ErrorKind>,
    /// The block this waiter is attached to; `None` if the engine skipped
    /// it (its records were already in the main checkpoint).
    pub lwb: Option<Arc<Lwb>>,
}

/// Links a committing thread to the durability of a specific block.
pub(crate) struct CommitWaiter {
    pub state: Mutex<WaiterState>,
    pub cv: Condvar,
}

impl CommitWaiter {
    pub(crate) fn new() -> Arc<CommitWaiter> {
        Arc::new(CommitWaiter {
            state: Mutex::new(WaiterState {
                done: false,
                error: None,
                lwb: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Attach the waiter to `lwb`; from here on the block's completion
    /// owns it.
    pub(crate) fn attach(zcw: &Arc<CommitWaiter>, lwb: &Arc<Lwb>) {
        debug_assert_ne!(lwb.state(), LwbState::New);
        debug_assert_ne!(lwb.state(), LwbState::FlushDone);
        lwb.core.lock().waiters.push(Arc::clone(zcw));
        let mut ws = zcw.state.lock();
        debug_assert!(ws.lwb.is_none());
        ws.lwb = Some(Arc::clone(lwb));
    }

    /// Mark a waiter done without a block: everything it was waiting on
    /// has already completed (or there never was anything).
    pub(crate) fn skip(zcw: &Arc<CommitWaiter>) {
        let mut ws = zcw.state.lock();
        debug_assert!(!ws.done);
        ws.done = true;
        zcw.cv.notify_all();
    }

    /// Called from the owning block's FLUSH_DONE.
    pub(crate) fn finish(&self, lwb: &Arc<Lwb>, error: Option<io::ErrorKind>) {
        let mut ws = self.state.lock();
        debug_assert!(ws
            .lwb
            .as_ref()
            .map(|l| Arc::ptr_eq(l, lwb))
            .unwrap_or(false));
        ws.lwb = None;
        // Errors from the block's write (or from dependent blocks) arrive
        // through the root task. Flush errors do not; see DESIGN.md.
        ws.error = error;
        debug_assert!(!ws.done);
        ws.done = true;
        self.cv.notify_all();
    }

    pub(crate) fn error(&self) -> Option<io::ErrorKind> {
        self.state.lock().error
    }

    fn attached_or_done(&self) -> bool {
        let ws = self.state.lock();
        ws.lwb.is_some() || ws.done
    }
}

impl<P: Pool> IntentLog<P> {
    /// Durability barrier: returns only once every record queued before
    /// the call is stable -- via the log, or via the main checkpoint when
    /// the log cannot serve (pool read-only, log suspended, write error).
    ///
    /// With `object == 0`, async records of every object are committed as
    /// well; otherwise only the named object's.
    pub fn commit(&self, object: u64) {
        // A snapshot can have no in-flight records, and must not be
        // dirtied by a commit marker.
        debug_assert!(!self.is_snapshot(), "commit on a snapshot");

        if self.sync_mode() == SyncMode::Disabled {
            return;
        }

        if !self.pool().writeable() {
            // There can be nothing pending: nothing could have been
            // queued against an unwritable pool.
            debug_assert!(self.inner.lock().lwbs.is_empty());
            return;
        }

        if self.suspended() {
            // Don't dirty the log with a marker; the checkpoint wait
            // provides the same guarantee, just slower.
            self.metrics_ref().bump(&self.metrics_ref().commit_suspend_count);
            self.pool().wait_synced(0);
            return;
        }

        self.commit_impl(object);
    }

    pub(crate) fn commit_impl(&self, object: u64) {
        self.metrics_ref().bump(&self.metrics_ref().commit_count);

        // Promote the object's async records first; they must be durable
        // before this call returns.
        self.async_to_sync(object);

        let zcw = CommitWaiter::new();
        self.commit_itx_assign(&zcw);

        let wtxg = self.commit_writer(&zcw);
        self.commit_waiter(&zcw);

        if let Some(err) = zcw.error() {
            // The block this thread was waiting on failed to write; fall
            // back to the main checkpoint for the same guarantee.
            self.metrics_ref().bump(&self.metrics_ref().commit_error_count);
            debug!("commit falling back to checkpoint wait: {err:?}");
            self.pool().wait_synced(0);
        } else if wtxg != 0 {
            // Lost a race with suspend; some records stayed queued.
            self.metrics_ref().bump(&self.metrics_ref().commit_suspend_count);
            self.pool().wait_synced(wtxg);
        }
    }

    /// Create the commit marker carrying `zcw` and queue it, so it lands
    /// in the sync list between already-queued and future records.
    fn commit_itx_assign(&self, zcw: &Arc<CommitWaiter>) {
        let txg = self.pool().tx_assign();
        let mut itx = Itx::new(TX_COMMIT, 0);
        itx.sync = true;
        itx.waiter = Some(Arc::clone(zcw));
        self.assign(itx, txg);
        self.pool().tx_commit(txg);
    }

    /// Drain the queues into blocks. Returns the highest txg the caller
    /// must wait on when a suspend stole part of the queue.
    fn commit_writer(&self, zcw: &Arc<CommitWaiter>) -> u64 {
        let mut ilwbs = Vec::new();
        let mut wtxg = 0;
        {
            let mut iss = self.issuer.lock();
            // While we waited for the issuer lock, another thread may
            // have committed our waiter to a block; processing the queue
            // again would only add contention.
            if !zcw.attached_or_done() {
                self.metrics_ref().bump(&self.metrics_ref().commit_writer_count);
                wtxg = self.get_commit_list(&mut iss);
                self.prune_commit_list(&mut iss);
                self.process_commit_list(&mut iss, zcw, &mut ilwbs);
            }
        }
        for lwb in ilwbs {
            self.lwb_write_issue(lwb);
        }
        wtxg
    }

    /// Drop commit markers at the head of the commit list -- no data
    /// precedes them, so they need no block of their own. Their waiters
    /// attach to the last opened block, or complete immediately.
    fn prune_commit_list(&self, iss: &mut IssuerCore) {
        while let Some(head) = iss.commit_list.front() {
            if head.header().kind() != TX_COMMIT {
                break;
            }
            let mut itx = iss.commit_list.pop_front().expect("non-empty front");
            let waiter = itx.waiter.take().expect("commit marker without waiter");
            {
                let inner = self.inner.lock();
                match &inner.last_opened {
                    Some(lwb) if lwb.state() != LwbState::FlushDone => {
                        CommitWaiter::attach(&waiter, lwb);
                    }
                    _ => {
                        // Everything this waiter could have been waiting
                        // on has already completed.
                        CommitWaiter::skip(&waiter);
                    }
                }
            }
            itx.destroy();
        }
    }

    /// Walk the commit list in order, packing records into blocks and
    /// putting full blocks on the caller's to-issue list.
    fn process_commit_list(
        &self,
        iss: &mut IssuerCore,
        zcw: &Arc<CommitWaiter>,
        ilwbs: &mut Vec<Arc<Lwb>>,
    ) {
        let mut lwb_opt = self.inner.lock().lwbs.back().cloned();
        if let Some(lwb) = &lwb_opt {
            self.activate_extension_feature();
            debug_assert!(matches!(lwb.state(), LwbState::New | LwbState::Opened));
            // A still-open tail means the workload is multi-threaded and
            // we won the chance of write aggregation. A tail whose
            // predecessor hasn't flushed means the same, but with too
            // much time between commits to aggregate; keep trying, with
            // less hope.
            if lwb.state() == LwbState::Opened {
                iss.parallel = BURSTS as u32;
            } else {
                let prev = {
                    let inner = self.inner.lock();
                    let n = inner.lwbs.len();
                    n.checked_sub(2).and_then(|i| inner.lwbs.get(i).cloned())
                };
                if prev.map(|p| p.state() != LwbState::FlushDone).unwrap_or(false) {
                    iss.parallel = iss.parallel.max(BURSTS as u32 / 2);
                }
            }
        } else {
            // Return before dirtying the pool if there's nothing to
            // commit.
            if iss.commit_list.is_empty() {
                return;
            }
            lwb_opt = self.create_chain();
        }

        let mut nolwb_itxs = Vec::new();
        let mut nolwb_waiters = Vec::new();

        while let Some(mut itx) = iss.commit_list.pop_front() {
            let txg = itx.header().txg;
            debug_assert_ne!(txg, 0);
            let is_commit = itx.header().kind() == TX_COMMIT;
            let synced = txg <= self.pool().last_synced_txg();
            let frozen = txg > self.pool().freeze_txg();

            // A record whose txg already synced needs no block: its
            // effect is in the main checkpoint. (Racy, but committing an
            // already-synced record is merely an unnecessary write.)
            // Commit markers are the exception -- they are always placed,
            // so an OPENED block always carries at least one waiter and
            // cannot linger open forever.
            if frozen || !synced || is_commit {
                match lwb_opt.take() {
                    Some(lwb) => match self.lwb_assign(iss, lwb, itx, ilwbs) {
                        Ok((lwb, remaining)) => {
                            iss.cur_left = iss.cur_left.saturating_sub(remaining);
                            let moved = {
                                let ws = zcw.state.lock();
                                ws.done
                                    || ws
                                        .lwb
                                        .as_ref()
                                        .map(|l| !Arc::ptr_eq(l, &lwb))
                                        .unwrap_or(false)
                            };
                            lwb_opt = Some(lwb);
                            if moved {
                                // Our block is done; leave the rest of
                                // the list to somebody who cares.
                                iss.parallel = BURSTS as u32;
                                break;
                            }
                        }
                        Err(itx) => {
                            iss.cur_left = iss.cur_left.saturating_sub(itx.full_size());
                            nolwb_itxs.push(itx);
                        }
                    },
                    None => {
                        if is_commit {
                            let w = itx.waiter.take().expect("commit marker without waiter");
                            nolwb_waiters.push(w);
                        }
                        iss.cur_left = iss.cur_left.saturating_sub(itx.full_size());
                        nolwb_itxs.push(itx);
                    }
                }
            } else {
                debug_assert!(!is_commit);
                iss.cur_left = iss.cur_left.saturating_sub(itx.full_size());
                itx.destroy();
            }
        }

        match lwb_opt {
            None => {
                // Block allocation failed somewhere along the chain. The
                // pipeline must stall; and without a block, the waiters
                // and records that found none are finished here instead
                // of in a FLUSH_DONE callback.
                for lwb in ilwbs.drain(..) {
                    self.lwb_write_issue(lwb);
                }
                self.commit_writer_stall();
                for w in nolwb_waiters {
                    CommitWaiter::skip(&w);
                }
                for itx in nolwb_itxs {
                    itx.destroy();
                }
            }
            Some(lwb) => {
                debug_assert!(nolwb_waiters.is_empty());
                debug_assert!(matches!(
                    lwb.state(),
                    LwbState::New | LwbState::Opened
                ));

                // Leave an open tail in place while the workload looks
                // multi-threaded: the next committer (or the waiter
                // timeout) will close it fuller than we would now, using
                // fewer, better-packed writes.
                if lwb.state() == LwbState::Opened
                    && (iss.parallel == 0 || self.suspended())
                {
                    self.burst_done(iss);
                    ilwbs.push(Arc::clone(&lwb));
                    if self.lwb_write_close(iss, &lwb, LwbState::New).is_none() {
                        for lwb in ilwbs.drain(..) {
                            self.lwb_write_issue(lwb);
                        }
                        self.commit_writer_stall();
                    }
                }
            }
        }
    }

    /// When block allocation fails, the previously issued block has no
    /// pointer to a successor. Wait for the main checkpoint to drain and
    /// free the whole chain, so the next writer starts a fresh one --
    /// otherwise a newly allocated "next" block could leak on crash.
    ///
    /// Holding the issuer lock across the wait keeps new writers out
    /// until the list is empty.
    pub(crate) fn commit_writer_stall(&self) {
        self.metrics_ref().bump(&self.metrics_ref().commit_stall_count);
        self.pool().wait_synced(0);
        debug_assert!(self.inner.lock().lwbs.is_empty());
    }

    /// Block until `zcw` is done. If the block it is attached to is still
    /// open once the latency-scaled timeout fires, close and issue it
    /// ourselves rather than keep hoping for more traffic.
    fn commit_waiter(&self, zcw: &Arc<CommitWaiter>) {
        let pct = self.options().commit_timeout_pct.max(1) as u64;
        let sleep = Duration::from_nanos(self.latency_nanos() * pct / 100);
        let deadline = Instant::now() + sleep;
        let mut timedout = false;

        let mut ws = zcw.state.lock();
        while !ws.done {
            let lwb = ws.lwb.clone();

            // `lwb` may be None: a commit marker swept up by the per-txg
            // cleaner has its waiter skipped from there, possibly after
            // we started waiting. No timeout needed then -- the skip is
            // imminent.
            let open = lwb
                .as_ref()
                .map(|l| l.state() == LwbState::Opened)
                .unwrap_or(false);
            if let Some(l) = &lwb {
                debug_assert_ne!(l.state(), LwbState::New);
            }

            if open && !timedout {
                let res = zcw.cv.wait_until(&mut ws, deadline);
                if !res.timed_out() || ws.done {
                    continue;
                }
                timedout = true;
                drop(ws);
                self.commit_waiter_timeout(zcw);
                ws = zcw.state.lock();
                if !ws.done {
                    debug_assert!(ws
                        .lwb
                        .as_ref()
                        .map(|l| l.state() != LwbState::Opened)
                        .unwrap_or(true));
                }
            } else {
                // Already closed or issued (or no block at all): just
                // wait for the completion path to signal us.
                zcw.cv.wait(&mut ws);
            }
        }
    }

    /// The timeout half of [`IntentLog::commit_waiter`]: close and issue
    /// the still-open block this waiter is attached to.
    fn commit_waiter_timeout(&self, zcw: &Arc<CommitWaiter>) {
        let mut iss = self.issuer.lock();

        // Re-check under the issuer lock: the waiter may have been
        // finished, or its block closed, while we acquired it. Holding
        // the issuer lock is what makes the OPENED check stable -- and
        // the waiter lock is dropped before closing, because completion
        // callbacks of blocks we issue here may need it.
        let lwb = {
            let ws = zcw.state.lock();
            if ws.done {
                return;
            }
            let lwb = ws.lwb.clone().expect("open block implies attached waiter");
            if lwb.state() != LwbState::Opened {
                return;
            }
            lwb
        };

        self.burst_done(&mut iss);
        match self.lwb_write_close(&mut iss, &lwb, LwbState::New) {
            None => {
                // Allocation failure: issue what we have and stall, still
                // under the issuer lock.
                self.lwb_write_issue(lwb);
                self.commit_writer_stall();
            }
            Some(_) => {
                drop(iss);
                self.lwb_write_issue(lwb);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lwb::Lwb;

    #[test]
    fn skip_completes_without_block() {
        let zcw = CommitWaiter::new();
        assert!(!zcw.attached_or_done());
        CommitWaiter::skip(&zcw);
        assert!(zcw.attached_or_done());
        assert_eq!(zcw.error(), None);
    }

    #[test]
    fn finish_records_error() {
        let lwb = Lwb::alloc(4096, None, true, 0, LwbState::Opened);
        let zcw = CommitWaiter::new();
        CommitWaiter::attach(&zcw, &lwb);
        assert!(zcw.attached_or_done());

        zcw.finish(&lwb, Some(io::ErrorKind::Other));
        assert_eq!(zcw.error(), Some(io::ErrorKind::Other));
        assert!(zcw.state.lock().lwb.is_none());
    }
}
