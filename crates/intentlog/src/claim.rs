//! Chain walking: parse, claim, check.
//!
//! On pool import each dataset's chain is walked starting at the header's
//! first-block pointer. Every block is strongly validated -- embedded
//! checksum, chain identity with the sequence word incremented, used-byte
//! bounds, record framing -- and the walk stops at the first invalid
//! block: that is the logical end of the chain. Claiming additionally
//! marks each block in use so the allocator cannot hand it out again
//! before replay frees it.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

use log::warn;

use crate::blockptr::BlockPointer;
use crate::chain;
use crate::error::Traversal;
use crate::log::{HeaderFlags, IntentLog, LogHeader};
use crate::pool::Pool;
use crate::record::{RecordHeader, WriteHeader, TX_WRITE};

/// Why a chain-walk callback ended the walk.
pub(crate) enum WalkStop {
    /// Stop without recording an error (e.g. a block past the rewind
    /// point during a clear).
    Halt,
    Fail(Traversal),
}

impl From<io::Error> for WalkStop {
    fn from(e: io::Error) -> WalkStop {
        WalkStop::Fail(Traversal::Io(e))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ParseOutcome {
    pub max_blk_seq: u64,
    pub max_lr_seq: u64,
    pub blk_count: u64,
    pub lr_count: u64,
    pub error: Option<Traversal>,
}

impl<P: Pool> IntentLog<P> {
    /// Walk the chain described by `zh`, invoking `on_block` for every
    /// block pointer and `on_record` for every record within.
    ///
    /// If the chain has been claimed, the walk is bounded by the claimed
    /// block/record sequence numbers, so a partially readable log cannot
    /// be replayed or destroyed past what claim saw.
    pub(crate) fn parse_chain(
        &self,
        zh: &LogHeader,
        mut on_block: impl FnMut(&BlockPointer) -> Result<(), WalkStop>,
        mut on_record: impl FnMut(&RecordHeader, &[u8]) -> Result<(), WalkStop>,
    ) -> ParseOutcome {
        let claimed = zh.claim_txg != 0;
        let claim_blk_seq = if claimed { zh.claim_blk_seq } else { u64::MAX };
        // Old headers didn't record the claimed record seq.
        let claim_lr_seq = if claimed && zh.flags.contains(HeaderFlags::CLAIM_LR_SEQ_VALID) {
            zh.claim_lr_seq
        } else {
            u64::MAX
        };

        let mut out = ParseOutcome::default();
        let mut blk = zh.log;

        'walk: while !blk.is_hole() {
            let blk_seq = blk.chain.seq;
            if blk_seq > claim_blk_seq {
                break;
            }

            match on_block(&blk) {
                Ok(()) => {}
                Err(WalkStop::Halt) => break,
                Err(WalkStop::Fail(e)) => {
                    out.error = Some(e);
                    break;
                }
            }
            debug_assert!(out.max_blk_seq < blk_seq);
            out.max_blk_seq = blk_seq;
            out.blk_count += 1;

            if out.max_lr_seq == claim_lr_seq && out.max_blk_seq == claim_blk_seq {
                break;
            }

            let data = match self.pool().read_block(&blk) {
                Ok(data) => data,
                Err(e) => {
                    if claimed {
                        warn!(
                            "objset {}: log block read error at seq {blk_seq}: {e}",
                            self.objset()
                        );
                    }
                    out.error = Some(Traversal::Io(e));
                    break;
                }
            };
            let (region, next) = match chain::decode_block(&blk, &data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    if claimed {
                        warn!(
                            "objset {}: invalid log block at seq {blk_seq}: {e}",
                            self.objset()
                        );
                    }
                    out.error = Some(e);
                    break;
                }
            };

            for record in chain::records(region, blk_seq) {
                let (hdr, bytes) = match record {
                    Ok(rec) => rec,
                    Err(e) => {
                        warn!("objset {}: {e}", self.objset());
                        out.error = Some(e);
                        break 'walk;
                    }
                };
                if hdr.seq > claim_lr_seq {
                    break 'walk;
                }
                match on_record(&hdr, bytes) {
                    Ok(()) => {}
                    Err(WalkStop::Halt) => break 'walk,
                    Err(WalkStop::Fail(e)) => {
                        out.error = Some(e);
                        break 'walk;
                    }
                }
                debug_assert!(out.max_lr_seq < hdr.seq);
                out.max_lr_seq = hdr.seq;
                out.lr_count += 1;
            }

            blk = next;
        }

        out
    }

    /// Read back the data block of an indirect write. A hole pointer
    /// yields zeroes. With `buf == None`, only readability is verified.
    pub(crate) fn read_log_data(
        &self,
        wh: &WriteHeader,
        buf: Option<&mut Vec<u8>>,
    ) -> io::Result<()> {
        let bp = &wh.blkptr;
        if bp.is_hole() {
            if let Some(buf) = buf {
                buf.clear();
                buf.resize((bp.size as u64).max(wh.length) as usize, 0);
            }
            return Ok(());
        }
        let data = self.pool().read_block(bp)?;
        if let Some(buf) = buf {
            *buf = data;
        }
        Ok(())
    }

    /// Claim the chain on import: mark every reachable block (and every
    /// claimed indirect write's data block) as in use, and record how far
    /// the chain reached so later walks are bounded.
    ///
    /// Special case: when the imported uberblock is a checkpoint and this
    /// chain was never claimed before it, the blocks may alias data
    /// rewritten after the checkpoint -- they are cleared, not claimed.
    pub fn claim(&self, tx_txg: u64) -> io::Result<()> {
        let first_txg = self.pool().min_claim_txg();
        let zh = self.header();

        if self.pool().checkpoint_txg() != 0 && zh.claim_txg == 0 {
            if !zh.log.is_hole() {
                let mut seen = HashSet::new();
                let _ = self.parse_chain(
                    &zh,
                    |bp| {
                        // Rewinding to a checkpoint: blocks born after it
                        // are invalid, don't even read them.
                        if bp.birth_txg >= first_txg {
                            return Err(WalkStop::Halt);
                        }
                        if seen.insert(bp.dvas[0]) {
                            self.pool().free_log_block(first_txg, bp);
                        }
                        Ok(())
                    },
                    |_, _| Ok(()),
                );
            }
            self.header_mut().log = BlockPointer::HOLE;
            return Ok(());
        }

        debug_assert!(zh.claim_txg <= first_txg);
        if zh.claim_txg == 0 && !zh.log.is_hole() {
            let seen = RefCell::new(HashSet::new());
            let outcome = self.parse_chain(
                &zh,
                |bp| self.claim_block(tx_txg, first_txg, bp, &mut seen.borrow_mut()),
                |hdr, bytes| {
                    self.claim_record(tx_txg, first_txg, hdr, bytes, &mut seen.borrow_mut())
                },
            );

            let mut zh = self.header_mut();
            zh.claim_txg = first_txg;
            zh.claim_blk_seq = outcome.max_blk_seq;
            zh.claim_lr_seq = outcome.max_lr_seq;
            if outcome.lr_count > 0 || outcome.blk_count > 1 {
                zh.flags |= HeaderFlags::REPLAY_NEEDED;
            }
            zh.flags |= HeaderFlags::CLAIM_LR_SEQ_VALID;
        }

        Ok(())
    }

    /// Claim `bp` if not already committed and not already claimed. With
    /// `tx_txg == 0`, only verify that the block is claimable.
    fn claim_block(
        &self,
        tx_txg: u64,
        first_txg: u64,
        bp: &BlockPointer,
        seen: &mut HashSet<crate::blockptr::Dva>,
    ) -> Result<(), WalkStop> {
        if bp.is_hole() || bp.birth_txg < first_txg || !seen.insert(bp.dvas[0]) {
            return Ok(());
        }
        self.pool()
            .claim_log_block(tx_txg, bp)
            .map_err(WalkStop::from)
    }

    fn claim_record(
        &self,
        tx_txg: u64,
        first_txg: u64,
        hdr: &RecordHeader,
        bytes: &[u8],
        seen: &mut HashSet<crate::blockptr::Dva>,
    ) -> Result<(), WalkStop> {
        if hdr.kind() != TX_WRITE {
            return Ok(());
        }
        let wh = WriteHeader::decode(bytes).map_err(WalkStop::from)?;

        // If the data block is not readable, don't claim the record. This
        // can happen in normal operation when a log block reaches disk
        // before some of the data blocks it points to; the transaction
        // cannot have been acknowledged to anyone, so this is the end of
        // the log.
        if wh.blkptr.birth_txg >= first_txg {
            self.read_log_data(&wh, None).map_err(WalkStop::from)?;
        }
        self.claim_block(tx_txg, first_txg, &wh.blkptr, seen)
    }

    /// Walk the chain without claiming, to report its integrity.
    /// Checksum or end-of-device errors just mark the end of the chain
    /// and are not reported.
    pub fn check_log_chain(&self) -> io::Result<()> {
        let zh = self.header();

        if !zh.log.is_hole() {
            // If the first block sits on a log device that was removed or
            // faulted before this import, its content has already been
            // synced to the pool; nothing to check.
            if !self.pool().log_device_ok(&zh.log) {
                return Ok(());
            }
            // A checkpointed uberblock with an unclaimed chain: the
            // blocks may predate the rewind, skip verifying them.
            if self.pool().checkpoint_txg() != 0 && zh.claim_txg == 0 {
                return Ok(());
            }
        }

        let first_txg = if zh.claim_txg != 0 {
            u64::MAX
        } else {
            self.pool().min_claim_txg()
        };
        let seen = RefCell::new(HashSet::new());
        let outcome = self.parse_chain(
            &zh,
            |bp| self.claim_block(0, first_txg, bp, &mut seen.borrow_mut()),
            |hdr, bytes| self.claim_record(0, first_txg, hdr, bytes, &mut seen.borrow_mut()),
        );

        match outcome.error {
            None => Ok(()),
            Some(Traversal::Checksum { .. })
            | Some(Traversal::Framing { .. })
            | Some(Traversal::Linkage { .. }) => Ok(()),
            Some(Traversal::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Some(Traversal::Io(e)) => Err(e),
        }
    }
}
