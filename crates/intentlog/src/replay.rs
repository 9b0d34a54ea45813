//! Replay: re-apply persisted records the main checkpoint never saw.
//!
//! Records are applied in sequence order, skipping anything at or below
//! the header's replayed-seq marker and anything whose txg predates the
//! claim. The handler applies each record inside a checkpoint transaction
//! and calls [`IntentLog::replaying`] with that transaction's txg, which
//! records the per-txg replay marker `sync` later persists -- making the
//! application and the marker update atomic.

use std::io;

use log::warn;

use crate::claim::WalkStop;
use crate::error::{ReplayError, Traversal};
use crate::log::{HeaderFlags, IntentLog};
use crate::pool::Pool;
use crate::record::{RecordHeader, WriteHeader, TXTYPE_CI, TX_COMMIT, TX_WRITE};
use crate::{SyncMode, TXG_MASK};

/// One record as handed to a [`Replay`] handler.
#[derive(Debug)]
pub struct ReplayRecord<'a> {
    pub header: RecordHeader,
    /// The whole record, header included.
    pub bytes: &'a [u8],
    /// For indirect writes, the data block read back from the pool.
    pub data: Option<&'a [u8]>,
}

/// Caller-supplied record application, dispatched by record type.
pub trait Replay {
    /// Apply one record. `txtype` has the case-insensitivity bit already
    /// stripped. The implementation must open a checkpoint transaction,
    /// apply the operation, and call [`IntentLog::replaying`] with the
    /// transaction's txg before committing it.
    fn replay(&mut self, txtype: u64, record: &ReplayRecord<'_>) -> io::Result<()>;

    /// Whether `object` still exists. Consulted for record types flagged
    /// out-of-order, whose target may legitimately be gone.
    fn object_exists(&mut self, object: u64) -> io::Result<bool> {
        let _ = object;
        Ok(true)
    }
}

impl<P: Pool> IntentLog<P> {
    /// If this log has a non-empty chain, replay it and destroy it.
    /// Returns whether there were any entries to replay.
    pub fn replay(&self, handler: &mut dyn Replay) -> bool {
        let zh = self.header();
        if self.options().replay_disable {
            return self.destroy(false);
        }
        if !zh.flags.contains(HeaderFlags::REPLAY_NEEDED) {
            return self.destroy(true);
        }

        // Wait for in-progress removes to sync before starting replay, so
        // claims against reused object ids cannot spuriously collide.
        self.pool().wait_synced(0);

        self.inner.lock().replaying = true;
        let mut staging = Vec::new();
        let outcome = self.parse_chain(
            &zh,
            |_| Ok(()),
            |hdr, bytes| self.replay_record(handler, hdr, bytes, &mut staging),
        );
        if let Some(e) = outcome.error {
            match e {
                Traversal::Checksum { .. } | Traversal::Framing { .. } | Traversal::Linkage { .. } => {}
                e => warn!("objset {}: replay stopped: {e}", self.objset()),
            }
        }

        self.destroy(false);
        let destroy_txg = self.inner.lock().destroy_txg;
        if destroy_txg != 0 {
            self.pool().wait_synced(destroy_txg);
        }
        self.inner.lock().replaying = false;

        true
    }

    fn replay_record(
        &self,
        handler: &mut dyn Replay,
        hdr: &RecordHeader,
        bytes: &[u8],
        staging: &mut Vec<u8>,
    ) -> Result<(), WalkStop> {
        let zh = self.header();
        self.inner.lock().replaying_seq = hdr.seq;

        if hdr.seq <= zh.replay_seq {
            // Already replayed.
            return Ok(());
        }
        if hdr.txg < zh.claim_txg {
            // Already committed by the main checkpoint.
            return Ok(());
        }

        // The case-insensitivity bit is still present in persisted
        // records; the handler dispatches on the bare type.
        let txtype = hdr.txtype & !TXTYPE_CI;
        if hdr.kind() == TX_COMMIT {
            return Err(self.replay_error(
                hdr,
                ReplayError::InvalidTxType {
                    seq: hdr.seq,
                    txtype: hdr.txtype,
                },
            ));
        }

        // A record type that can be logged out of order may target an
        // object that no longer exists. That's legitimate, not an error.
        if hdr.is_ooo() {
            let object = WriteHeader::decode(bytes)
                .map(|wh| wh.object)
                .unwrap_or(0);
            match handler.object_exists(object) {
                Ok(false) => return Ok(()),
                Ok(true) => {}
                Err(e) => return Err(self.replay_error(hdr, ReplayError::Io(e))),
            }
        }

        // An indirect write stores only a block pointer; stage the data
        // so the handler sees the payload.
        let mut data = None;
        if hdr.kind() == TX_WRITE && hdr.reclen as usize == WriteHeader::LEN {
            let wh = WriteHeader::decode(bytes).map_err(WalkStop::from)?;
            if let Err(e) = self.read_log_data(&wh, Some(staging)) {
                return Err(self.replay_error(hdr, ReplayError::Io(e)));
            }
            data = Some(staging.as_slice());
        }

        let record = ReplayRecord {
            header: *hdr,
            bytes,
            data,
        };

        if let Err(first) = handler.replay(txtype, &record) {
            // The checkpoint may not have seen removes yet, so a replayed
            // create can spuriously collide. Sync out anything pending
            // and retry once.
            warn!(
                "objset {}: replay of seq {} failed ({first}), retrying after sync",
                self.objset(),
                hdr.seq
            );
            self.pool().wait_synced(0);
            if let Err(second) = handler.replay(txtype, &record) {
                return Err(self.replay_error(
                    hdr,
                    ReplayError::Handler {
                        seq: hdr.seq,
                        txtype,
                        source: second,
                    },
                ));
            }
        }
        Ok(())
    }

    fn replay_error(&self, hdr: &RecordHeader, e: ReplayError) -> WalkStop {
        // We didn't actually replay this one.
        self.inner.lock().replaying_seq = hdr.seq.saturating_sub(1);
        warn!(
            "objset {}: replay error at seq {:#x} txtype {}: {e}",
            self.objset(),
            hdr.seq,
            hdr.txtype & !TXTYPE_CI,
        );
        WalkStop::Fail(Traversal::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    /// Called by replay handlers from inside their checkpoint
    /// transaction. Records the replay marker for `txg` and reports
    /// whether the operation is a replay (or moot because sync is
    /// disabled), in which case the handler must not log it again.
    pub fn replaying(&self, txg: u64) -> bool {
        if self.sync_mode() == SyncMode::Disabled {
            return true;
        }
        let mut inner = self.inner.lock();
        if inner.replaying {
            let seq = inner.replaying_seq;
            inner.replayed_seq[(txg & TXG_MASK) as usize] = seq;
            true
        } else {
            false
        }
    }
}
