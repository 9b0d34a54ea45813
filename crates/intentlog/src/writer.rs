//! Block assembly and issue.
//!
//! Record placement (under the issuer lock) reserves space and splits
//! need-copy payloads across blocks; the fill step copies the bytes and
//! fetches write payloads; issue allocates the successor's block pointer
//! inside a fresh checkpoint transaction, wires the completion-ordering
//! edges, and submits the write. Completion callbacks run on the I/O
//! dispatcher and drive WRITE_DONE / FLUSH_DONE.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::warn;

use crate::blockptr::{BlockPointer, ChainKind};
use crate::chain::{finalize_block, ChainHeader};
use crate::commit::CommitWaiter;
use crate::error::GetDataError;
use crate::io::Task;
use crate::log::{ChildIo, IntentLog, IssuerCore};
use crate::lwb::{Lwb, LwbState};
use crate::plan::{lwb_plan, max_waste_space, predict};
use crate::pool::{Pool, WritePriority};
use crate::record::{Itx, RecordHeader, WriteHeader, WriteState, TX_COMMIT, TX_WRITE};
use crate::{round_up, MIN_BLOCK_SIZE, RECORD_ALIGN, TXG_MASK};

impl<P: Pool> IntentLog<P> {
    /// Open an lwb so it accepts records. Idempotent.
    fn lwb_write_open(&self, lwb: &Arc<Lwb>) {
        if lwb.state() != LwbState::New {
            debug_assert_eq!(lwb.state(), LwbState::Opened);
            return;
        }
        let mut inner = self.inner.lock();
        lwb.set_state(LwbState::Opened);
        inner.last_opened = Some(Arc::clone(lwb));
    }

    /// Close the block for issue and allocate the next one, sized from
    /// what is left of this burst and the previous history.
    ///
    /// Returns `None` if this block carries an allocation error; the
    /// caller must then stall.
    pub(crate) fn lwb_write_close(
        &self,
        iss: &mut IssuerCore,
        lwb: &Arc<Lwb>,
        state: LwbState,
    ) -> Option<Arc<Lwb>> {
        debug_assert_eq!(lwb.state(), LwbState::Opened);
        lwb.set_state(LwbState::Closed);

        // An allocation failure may not have happened yet; this is
        // inherently racy, and re-checked when the error surfaces.
        if lwb.core.lock().error.is_some() {
            return None;
        }

        let max = self.max_block_size();
        let plan = if iss.cur_left > 0 {
            // Mid-burst: we know how much is left, but a multi-threaded
            // workload may add more soon. Plan for the worst case.
            let (p, _) = lwb_plan(max, iss.cur_max, iss.cur_left);
            if iss.parallel > 0 {
                let more = predict(&iss.history, max, iss.cur_size, iss.cur_max);
                let (p2, _) = lwb_plan(max, iss.cur_max, iss.cur_left + more);
                p.max(p2)
            } else {
                p
            }
        } else {
            // The previous burst is done; we can only predict what comes
            // next.
            predict(&iss.history, max, iss.cur_size, iss.cur_max)
        };
        let blksz = round_up(plan as usize + ChainHeader::LEN, MIN_BLOCK_SIZE)
            .min(max as usize);
        Some(self.alloc_lwb(blksz, None, 0, state))
    }

    /// Record the burst's plan into the history once the commit list has
    /// drained, and reset the accumulators.
    pub(crate) fn burst_done(&self, iss: &mut IssuerCore) {
        if !iss.commit_list.is_empty() || iss.cur_size == 0 {
            return;
        }
        iss.parallel = iss.parallel.saturating_sub(1);
        let (opt, min) = lwb_plan(self.max_block_size(), iss.cur_max, iss.cur_size);
        iss.history.record(opt, min);
        iss.cur_size = 0;
        iss.cur_max = 0;
        iss.cur_left = 0;
        self.set_cur_burst_size(0);
    }

    /// Reserve space in `lwb` for `itx`, opening new blocks as the record
    /// (or its split payload) requires. Does not touch the payload bytes.
    ///
    /// On success returns the (possibly new) open block plus the bytes the
    /// record still accounts for in the burst; on allocation failure the
    /// record is handed back for the no-block path.
    pub(crate) fn lwb_assign(
        &self,
        iss: &mut IssuerCore,
        mut lwb: Arc<Lwb>,
        mut itx: Itx,
        ilwbs: &mut Vec<Arc<Lwb>>,
    ) -> Result<(Arc<Lwb>, u64), Itx> {
        self.lwb_write_open(&lwb);

        // A commit marker doesn't represent any on-disk state; it is a
        // placeholder that attaches its waiter to the right block so the
        // waiter is signalled when that block completes.
        if itx.header().kind() == TX_COMMIT {
            let waiter = itx.waiter.clone().expect("commit marker without waiter");
            CommitWaiter::attach(&waiter, &lwb);
            lwb.core.lock().itxs.push(itx);
            return Ok((lwb, 0));
        }

        let reclen = itx.header().reclen;
        debug_assert!(reclen >= RecordHeader::LEN as u64);
        debug_assert!(reclen <= self.max_log_data(0));
        let mut dlen = itx.data_size();
        let max_log_data = self.max_log_data(WriteHeader::LEN);
        let waste = max_waste_space(self.max_block_size());

        let space = |lwb: &Arc<Lwb>| {
            let core = lwb.core.lock();
            (core.nmax - core.nused) as u64
        };

        loop {
            // If this record won't fit in the current block, start a new
            // one. For need-copy, optimize the layout for a minimal
            // number of chunks.
            let mut lwb_sp = space(&lwb);
            if reclen > lwb_sp
                || (reclen + dlen > lwb_sp
                    && lwb_sp < waste
                    && (dlen % max_log_data == 0 || lwb_sp < reclen + dlen % max_log_data))
            {
                ilwbs.push(Arc::clone(&lwb));
                lwb = match self.lwb_write_close(iss, &lwb, LwbState::Opened) {
                    Some(next) => next,
                    None => return Err(itx),
                };
                self.lwb_write_open(&lwb);
                lwb_sp = space(&lwb);
            }

            // There must be room for the header now. An inlined record
            // fits whole; a need-copy record needs only a word of payload
            // per block, since the header is repeated per chunk.
            debug_assert!(reclen + dlen.min(RECORD_ALIGN as u64) <= lwb_sp);

            // We're actually making an entry, so this stamps the record
            // sequence number. It is generally not equal to any itx
            // order, because not every record is synchronous and
            // sometimes the main checkpoint gets there first.
            iss.lr_seq += 1;

            let dnow = dlen.min(lwb_sp - reclen);
            if dlen > dnow {
                // Split: a clone carries this chunk, the original record
                // continues into the next block with its range advanced.
                debug_assert_eq!(itx.header().kind(), TX_WRITE);
                debug_assert_eq!(itx.write_state, WriteState::NeedCopy);
                let mut citx = itx.clone_record();
                let mut cwh = citx.write_header().expect("split source is a write");
                let mut owh = itx.write_header().expect("split source is a write");
                cwh.length = dnow;
                owh.offset += dnow;
                owh.length -= dnow;
                citx.set_write_header(&cwh);
                itx.set_write_header(&owh);
                citx.hdr.seq = iss.lr_seq;
                iss.cur_left = iss.cur_left.saturating_sub(dnow);

                let mut core = lwb.core.lock();
                core.nused += (reclen + dnow) as usize;
                debug_assert!(core.nused <= core.nmax);
                debug_assert_eq!(core.nused % RECORD_ALIGN, 0);
                core.max_txg = core.max_txg.max(citx.header().txg);
                core.itxs.push(citx);
                drop(core);

                dlen -= dnow;
                continue;
            }

            // Final (or only) slice: the record itself is placed.
            itx.hdr.seq = iss.lr_seq;
            let remaining = itx.full_size();
            let txg = itx.header().txg;
            {
                let mut core = lwb.core.lock();
                core.nused += (reclen + dnow) as usize;
                debug_assert!(core.nused <= core.nmax);
                debug_assert_eq!(core.nused % RECORD_ALIGN, 0);
                core.max_txg = core.max_txg.max(txg);
                core.itxs.push(itx);
            }
            if txg > self.pool().freeze_txg() {
                self.pool().wait_synced(txg);
            }
            return Ok((lwb, remaining));
        }
    }

    /// Copy every placed record's bytes into the buffer, fetching write
    /// payloads as needed, then hand the block a root task and mark it
    /// READY. If its block pointer is still pending, a predecessor's
    /// issue step will take it from there.
    ///
    /// Returns whether the caller should proceed to submit the write.
    fn lwb_fill(&self, lwb: &Arc<Lwb>) -> bool {
        debug_assert_eq!(lwb.state(), LwbState::Closed);

        let (mut buf, itxs, mut nfilled, mut child) = {
            let mut core = lwb.core.lock();
            (
                core.buf.take().expect("filling a block without a buffer"),
                std::mem::take(&mut core.itxs),
                core.nfilled,
                core.child.take(),
            )
        };

        for itx in &itxs {
            self.fill_one(lwb, &mut buf, itx, &mut nfilled, &mut child);
        }

        let me = self.clone();
        let l = Arc::clone(lwb);
        let root = Task::null(
            self.io_dispatch(),
            Some(Box::new(move |err| me.lwb_flush_done(&l, err))),
        );

        {
            let mut core = lwb.core.lock();
            core.buf = Some(buf);
            core.itxs = itxs;
            core.nfilled = nfilled;
            // Skipped payload fetches shrink the block to what was
            // actually filled.
            core.nused = nfilled;
            debug_assert!(core.nused <= core.nmax);
            core.child = child;
            core.root = Some(root);
        }

        // The block can be submitted only once it has its on-disk
        // pointer, or the allocation failed. Otherwise some other thread
        // will submit it after allocating the pointer while issuing the
        // previous block.
        let _inner = self.inner.lock();
        lwb.set_state(LwbState::Ready);
        let core = lwb.core.lock();
        !(core.blk.is_hole() && core.error.is_none())
    }

    fn fill_one(
        &self,
        lwb: &Arc<Lwb>,
        buf: &mut [u8],
        itx: &Itx,
        nfilled: &mut usize,
        child: &mut Option<Arc<Task>>,
    ) {
        if itx.header().kind() == TX_COMMIT {
            return;
        }

        let reclen = itx.header().reclen as usize;
        let dlen = itx.data_size() as usize;
        let at = *nfilled;

        itx.header().encode(&mut buf[at..]);
        buf[at + RecordHeader::LEN..at + reclen]
            .copy_from_slice(&itx.body()[..reclen - RecordHeader::LEN]);

        self.metrics_ref().bump(&self.metrics_ref().itx_count);

        if itx.header().kind() == TX_WRITE {
            match itx.write_state {
                WriteState::Copied => {
                    let wh = WriteHeader::decode(&buf[at..]).expect("copied write header");
                    self.metrics_ref().bump(&self.metrics_ref().itx_copied_count);
                    self.metrics_ref()
                        .add(&self.metrics_ref().itx_copied_bytes, wh.length);
                }
                WriteState::NeedCopy | WriteState::Indirect => {
                    let mut wh =
                        WriteHeader::decode(&buf[at..]).expect("write header fits its record");
                    if itx.write_state == WriteState::NeedCopy {
                        wh.common.reclen += dlen as u64;
                        self.metrics_ref().bump(&self.metrics_ref().itx_needcopy_count);
                        self.metrics_ref()
                            .add(&self.metrics_ref().itx_needcopy_bytes, dlen as u64);
                    } else {
                        self.metrics_ref().bump(&self.metrics_ref().itx_indirect_count);
                        self.metrics_ref()
                            .add(&self.metrics_ref().itx_indirect_bytes, wh.length);
                    }

                    // The aggregator becomes a child of the block's write
                    // task, so the write waits for externally fetched
                    // blocks, and the flushes for their completion.
                    if child.is_none() {
                        *child = Some(Task::null(self.io_dispatch(), None));
                    }
                    let child_io = ChildIo {
                        task: Arc::clone(child.as_ref().expect("just created")),
                        dispatch: self.io_dispatch().clone(),
                        lwb: Arc::clone(lwb),
                        nocacheflush: self.options().nocacheflush,
                    };

                    let res = {
                        let dbuf = if itx.write_state == WriteState::NeedCopy {
                            Some(&mut buf[at + reclen..at + reclen + dlen])
                        } else {
                            None
                        };
                        self.get_data_cb().get_data(itx.gen, &mut wh, dbuf, &child_io)
                    };
                    match res {
                        Ok(()) => {
                            if itx.write_state == WriteState::NeedCopy {
                                // Zero any padding bytes in the last chunk.
                                let filled = wh.length as usize;
                                buf[at + reclen + filled..at + reclen + dlen].fill(0);
                            }
                            wh.encode(&mut buf[at..]);
                        }
                        Err(GetDataError::NotFound)
                        | Err(GetDataError::Exists)
                        | Err(GetDataError::Skip) => {
                            // The operation is moot (object gone, block
                            // already persisted); drop this slice.
                            return;
                        }
                        Err(e) => {
                            // Neither an inline nor an indirect write
                            // happened; fall back to the main checkpoint
                            // for this record's txg.
                            warn!("get_data failed ({e}); falling back to checkpoint wait");
                            self.pool().wait_synced(itx.header().txg);
                            return;
                        }
                    }
                }
            }
        }

        *nfilled += reclen + dlen;
        debug_assert_eq!(*nfilled % RECORD_ALIGN, 0);
    }

    /// Finalize a closed block and submit its write, then hand the
    /// successor its freshly allocated block pointer -- and issue the
    /// successor too, if it was already READY waiting for us.
    pub(crate) fn lwb_write_issue(&self, lwb: Arc<Lwb>) {
        if !self.lwb_fill(&lwb) {
            return;
        }
        let mut lwb = lwb;
        while let Some(next) = self.issue_one(&lwb) {
            lwb = next;
        }
    }

    fn issue_one(&self, lwb: &Arc<Lwb>) -> Option<Arc<Lwb>> {
        let (buf, bp, nused, slog, error, root, child) = {
            let mut core = lwb.core.lock();
            (
                core.buf.take(),
                core.blk,
                core.nused,
                core.slog,
                core.error,
                core.root.clone().expect("issuing a block without a root"),
                core.child.clone(),
            )
        };

        // Open a transaction to allocate the next block pointer in.
        let txg = self.pool().tx_assign();
        let nlwb = self.next_lwb(lwb);

        let mut next_bp = BlockPointer::HOLE;
        let mut next_err = error;
        let mut next_slog = false;
        if error.is_none() {
            if let Some(n) = &nlwb {
                let nsize = n.core.lock().size as u32;
                match self.pool().alloc_log_block(txg, nsize) {
                    Ok((mut bp_alloc, s)) => {
                        bp_alloc.kind = if n.slim {
                            ChainKind::Slim
                        } else {
                            ChainKind::Legacy
                        };
                        bp_alloc.chain = bp.chain.next();
                        next_bp = bp_alloc;
                        next_slog = s;
                    }
                    Err(e) => next_err = Some(e.kind()),
                }
            }
        }

        let me = self.clone();
        let l = Arc::clone(lwb);
        let done: Box<dyn FnOnce(Option<io::ErrorKind>) + Send> =
            Box::new(move |err| me.lwb_write_done(&l, err));
        let write = match error {
            None => {
                let mut data = buf.expect("issuing a block without a buffer");
                let wsz = finalize_block(&mut data, lwb.slim, nused, bp.chain, next_bp);
                data.truncate(wsz);
                lwb.add_block(&bp, self.options().nocacheflush);

                let m = self.metrics_ref();
                if slog {
                    m.bump(&m.blocks_allocated_slog);
                    m.add(&m.bytes_written_slog, wsz as u64);
                } else {
                    m.bump(&m.blocks_allocated_normal);
                    m.add(&m.bytes_written_normal, wsz as u64);
                }

                // Bulk slog bursts fall to async priority.
                let priority = if !slog
                    || self.cur_burst_size() <= self.options().slog_bulk
                {
                    WritePriority::Sync
                } else {
                    WritePriority::Async
                };
                let pool = Arc::clone(self.pool());
                Task::run(
                    self.io_dispatch(),
                    move || pool.write_block(&bp, &data, priority),
                    Some(done),
                    true,
                )
            }
            Some(kind) => {
                // We can't write the block after an allocation failure;
                // issue a null task instead, just to maintain the
                // ordering edges.
                let task = Task::run(self.io_dispatch(), || Ok(()), Some(done), true);
                task.set_error(kind);
                task
            }
        };
        Task::add_child(&root, &write);
        if let Some(c) = &child {
            Task::add_child(&write, c);
        }
        lwb.core.lock().write = Some(Arc::clone(&write));

        // Keep the transaction open only long enough to record the
        // in-flight write; `sync` waits for the counter to drain.
        {
            let mut io = self.lwb_io.lock();
            lwb.core.lock().issued_txg = txg;
            io.inflight[(txg & TXG_MASK) as usize] += 1;
            io.max_issued_txg = io.max_issued_txg.max(txg);
        }
        self.pool().tx_commit(txg);

        // We've completed all potentially blocking operations. Wire the
        // ordering edges, and hand the successor its pointer so it can
        // proceed.
        let next_ready = {
            let inner = self.inner.lock();
            self.set_task_dependencies(&inner.lwbs, lwb, &root, &write);
            lwb.set_state(LwbState::Issued);
            let mut next_ready = None;
            if let Some(n) = &nlwb {
                let mut nc = n.core.lock();
                nc.blk = next_bp;
                nc.error = next_err;
                nc.slog = next_slog;
                nc.alloc_txg = txg;
                if n.state() == LwbState::Ready {
                    next_ready = Some(Arc::clone(n));
                }
            }
            next_ready
        };

        lwb.core.lock().issued_at = Some(Instant::now());
        if let Some(c) = child {
            Task::submit(&c);
        }
        Task::submit(&write);
        Task::submit(&root);

        // If the successor was READY when we gave it the pointer, it is
        // on us to issue it (and possibly the ones after it).
        next_ready
    }

    /// Build the completion-ordering edges: this block's root completes
    /// only after the predecessor's, so waiters fire in sequence order.
    /// If the predecessor's write is still outstanding and its flushes
    /// may be deferred onto us, our write also waits for its write --
    /// otherwise we could flush devices its data has not reached yet.
    fn set_task_dependencies(
        &self,
        lwbs: &std::collections::VecDeque<Arc<Lwb>>,
        lwb: &Arc<Lwb>,
        root: &Arc<Task>,
        write: &Arc<Task>,
    ) {
        let pos = lwbs
            .iter()
            .position(|l| Arc::ptr_eq(l, lwb))
            .expect("issued lwb not on the list");
        let prev = match pos.checked_sub(1).and_then(|p| lwbs.get(p)) {
            Some(prev) => prev,
            None => return,
        };
        if prev.state() == LwbState::FlushDone {
            return;
        }

        if prev.state() == LwbState::Issued {
            let pc = prev.core.lock();
            if pc.waiters.is_empty() {
                if let Some(pw) = &pc.write {
                    Task::add_child(write, pw);
                }
            }
        } else {
            debug_assert_eq!(prev.state(), LwbState::WriteDone);
        }
        if let Some(pr) = &prev.core.lock().root {
            Task::add_child(root, pr);
        }
    }

    fn next_lwb(&self, lwb: &Arc<Lwb>) -> Option<Arc<Lwb>> {
        let inner = self.inner.lock();
        next_of(&inner.lwbs, lwb)
    }

    /// The write completed: issue the flush commands for the devices the
    /// block's data (and any deferred predecessors') landed on -- or
    /// defer them to the successor when nobody is waiting on this block.
    fn lwb_write_done(&self, lwb: &Arc<Lwb>, err: Option<io::ErrorKind>) {
        let nlwb = {
            let inner = self.inner.lock();
            debug_assert_eq!(lwb.state(), LwbState::Issued);
            lwb.set_state(LwbState::WriteDone);
            let mut core = lwb.core.lock();
            core.write = None;
            core.child = None;
            drop(core);
            // If the successor is not ISSUED yet, its dependency setup
            // has not run, so it cannot order its flushes after our
            // write; don't defer onto it.
            next_of(&inner.lwbs, lwb).filter(|n| n.state() == LwbState::Issued)
        };

        if lwb.vdevs.lock().is_empty() {
            return;
        }

        // After a failed write there is no reason to flush; the error
        // reaches the waiters through the root task.
        if err.is_some() {
            lwb.vdevs.lock().clear();
            return;
        }

        // Nobody is waiting on this block: let the successor cover our
        // devices with its own flushes. This coalesces flush commands
        // under async-heavy loads.
        let no_waiters = lwb.core.lock().waiters.is_empty();
        if no_waiters {
            if let Some(n) = &nlwb {
                lwb.flush_defer(n);
                return;
            }
        }

        let root = lwb
            .core
            .lock()
            .root
            .clone()
            .expect("write-done before root teardown");
        let devices: Vec<_> = std::mem::take(&mut *lwb.vdevs.lock()).into_iter().collect();
        for device in devices {
            let pool = Arc::clone(self.pool());
            // Flush failures are not propagated to the root; see
            // DESIGN.md.
            let flush = Task::run(
                self.io_dispatch(),
                move || {
                    pool.flush_device(device).inspect_err(|e| {
                        warn!("cache flush failed on device {device}: {e}");
                    })
                },
                None,
                false,
            );
            Task::add_child(&root, &flush);
            Task::submit(&flush);
        }
    }

    /// All required flushes completed: the block's contents are stable.
    /// Destroy its records (running their callbacks) and signal the
    /// waiters.
    fn lwb_flush_done(&self, lwb: &Arc<Lwb>, err: Option<io::ErrorKind>) {
        if let Some(at) = lwb.core.lock().issued_at {
            self.update_latency(at.elapsed().as_nanos() as u64);
        }

        let (itxs, waiters, txg) = {
            let _inner = self.inner.lock();
            let mut core = lwb.core.lock();
            core.root = None;
            debug_assert_eq!(lwb.state(), LwbState::WriteDone);
            lwb.set_state(LwbState::FlushDone);
            (
                std::mem::take(&mut core.itxs),
                std::mem::take(&mut core.waiters),
                core.issued_txg,
            )
        };

        for itx in itxs {
            itx.destroy();
        }
        for waiter in waiters {
            waiter.finish(lwb, err);
        }

        // Once the count drops the lwb may be freed by `sync`.
        let mut io = self.lwb_io.lock();
        let slot = &mut io.inflight[(txg & TXG_MASK) as usize];
        debug_assert!(*slot > 0);
        *slot -= 1;
        if *slot == 0 {
            self.lwb_io_cv.notify_all();
        }
    }
}

fn next_of(
    lwbs: &std::collections::VecDeque<Arc<Lwb>>,
    lwb: &Arc<Lwb>,
) -> Option<Arc<Lwb>> {
    let pos = lwbs.iter().position(|l| Arc::ptr_eq(l, lwb))?;
    lwbs.get(pos + 1).cloned()
}
