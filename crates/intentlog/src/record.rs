use std::fmt;
use std::io;
use std::sync::Arc;

use crate::blockptr::BlockPointer;
use crate::commit::CommitWaiter;
use crate::round_up;

/// Reserved record type: a commit marker. Never written to disk; it only
/// positions a waiter within the stream of queued records.
pub const TX_COMMIT: u64 = 0;

/// Record type the engine understands structurally: a data-bearing write.
/// Everything else is an opaque payload behind the common header.
pub const TX_WRITE: u64 = 1;

/// Record type for renames. Recognised so that a rename target's earlier
/// async records can be promoted to sync before the rename marker lands.
pub const TX_RENAME: u64 = 2;

/// Case-insensitivity marker carried in the txtype word by some front ends.
/// Stripped before replay dispatch.
pub const TXTYPE_CI: u64 = 1 << 63;

/// Marks a record type whose replay may legitimately happen out of order
/// with respect to other objects (e.g. the target object may already be
/// gone).
pub const TXTYPE_OOO: u64 = 1 << 62;

const TXTYPE_FLAGS: u64 = TXTYPE_CI | TXTYPE_OOO;

/// The header common to every log record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecordHeader {
    /// Record type plus flag bits ([`TXTYPE_CI`], [`TXTYPE_OOO`]).
    pub txtype: u64,
    /// Total record length in bytes, header included. Always a multiple of
    /// eight and at least [`RecordHeader::LEN`].
    pub reclen: u64,
    /// Checkpoint epoch the record was produced in.
    pub txg: u64,
    /// Sequence number, stamped when the record is placed into a block.
    pub seq: u64,
}

impl RecordHeader {
    pub const LEN: usize = 32;

    /// The record type with flag bits stripped.
    pub fn kind(&self) -> u64 {
        self.txtype & !TXTYPE_FLAGS
    }

    pub fn is_ooo(&self) -> bool {
        self.txtype & TXTYPE_OOO != 0
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.txtype.to_le_bytes());
        out[8..16].copy_from_slice(&self.reclen.to_le_bytes());
        out[16..24].copy_from_slice(&self.txg.to_le_bytes());
        out[24..32].copy_from_slice(&self.seq.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short record header",
            ));
        }
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        Ok(RecordHeader {
            txtype: u64_at(0),
            reclen: u64_at(8),
            txg: u64_at(16),
            seq: u64_at(24),
        })
    }
}

/// Body of a [`TX_WRITE`] record: common header plus object, byte range and
/// (for indirect writes) the pointer to the externally written data block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WriteHeader {
    pub common: RecordHeader,
    pub object: u64,
    pub offset: u64,
    pub length: u64,
    pub blkptr: BlockPointer,
}

impl WriteHeader {
    pub const LEN: usize = RecordHeader::LEN + 24 + BlockPointer::LEN;

    pub fn encode(&self, out: &mut [u8]) {
        self.common.encode(out);
        out[32..40].copy_from_slice(&self.object.to_le_bytes());
        out[40..48].copy_from_slice(&self.offset.to_le_bytes());
        out[48..56].copy_from_slice(&self.length.to_le_bytes());
        self.blkptr.encode(&mut out[56..56 + BlockPointer::LEN]);
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short write record",
            ));
        }
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        Ok(WriteHeader {
            common: RecordHeader::decode(buf)?,
            object: u64_at(32),
            offset: u64_at(40),
            length: u64_at(48),
            blkptr: BlockPointer::decode(&buf[56..56 + BlockPointer::LEN])?,
        })
    }
}

/// How a write record's payload travels to stable storage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WriteState {
    /// Payload inlined into the record at creation time. Never split across
    /// blocks; oversized records degrade to [`WriteState::NeedCopy`].
    #[default]
    Copied,
    /// Payload fetched via `get_data` when the block is filled; may be
    /// split across blocks, repeating only the header.
    NeedCopy,
    /// Only a block pointer is logged; the data block is written separately
    /// under the log block's child aggregator.
    Indirect,
}

/// An intent record: the common header, an opaque payload, and the engine's
/// bookkeeping fields.
pub struct Itx {
    pub(crate) hdr: RecordHeader,
    /// Type-specific bytes following the common header. Its length is
    /// `reclen - RecordHeader::LEN`.
    pub(crate) body: Vec<u8>,
    /// Queue on the per-txg sync list rather than the async tree.
    pub sync: bool,
    pub write_state: WriteState,
    /// Target object; keys the async tree and rename promotion.
    pub object: u64,
    /// Generation handed through to `get_data`.
    pub gen: u64,
    pub(crate) callback: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) waiter: Option<Arc<CommitWaiter>>,
}

impl Itx {
    /// Create a record of `txtype` whose type-specific content occupies
    /// `body_len` bytes after the common header. The total length is
    /// rounded up to an 8-byte multiple and the tail zeroed.
    pub fn new(txtype: u64, body_len: usize) -> Itx {
        let reclen = round_up(RecordHeader::LEN + body_len, crate::RECORD_ALIGN);
        Itx {
            hdr: RecordHeader {
                txtype,
                reclen: reclen as u64,
                txg: 0,
                seq: 0,
            },
            body: vec![0; reclen - RecordHeader::LEN],
            sync: true,
            write_state: WriteState::Copied,
            object: 0,
            gen: 0,
            callback: None,
            waiter: None,
        }
    }

    /// Register a callback invoked when the record becomes durable or is
    /// discarded. Commit markers never carry one.
    pub fn on_done(&mut self, callback: impl FnOnce() + Send + 'static) {
        debug_assert_ne!(self.hdr.kind(), TX_COMMIT);
        self.callback = Some(Box::new(callback));
    }

    pub fn header(&self) -> &RecordHeader {
        &self.hdr
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.body
    }

    /// Bitwise copy for payload splitting. The callback stays with the
    /// original record.
    pub(crate) fn clone_record(&self) -> Itx {
        Itx {
            hdr: self.hdr,
            body: self.body.clone(),
            sync: self.sync,
            write_state: self.write_state,
            object: self.object,
            gen: self.gen,
            callback: None,
            waiter: None,
        }
    }

    /// Run the completion callback (if any) and drop the record.
    pub(crate) fn destroy(mut self) {
        debug_assert!(self.hdr.kind() != TX_COMMIT || self.callback.is_none());
        if let Some(cb) = self.callback.take() {
            cb();
        }
    }

    pub(crate) fn write_header(&self) -> io::Result<WriteHeader> {
        debug_assert_eq!(self.hdr.kind(), TX_WRITE);
        const TAIL: usize = WriteHeader::LEN - RecordHeader::LEN;
        let mut buf = vec![0; WriteHeader::LEN];
        self.hdr.encode(&mut buf);
        buf[RecordHeader::LEN..].copy_from_slice(&self.body[..TAIL]);
        WriteHeader::decode(&buf)
    }

    pub(crate) fn set_write_header(&mut self, wh: &WriteHeader) {
        debug_assert_eq!(self.hdr.kind(), TX_WRITE);
        const TAIL: usize = WriteHeader::LEN - RecordHeader::LEN;
        let mut buf = vec![0; WriteHeader::LEN];
        wh.encode(&mut buf);
        self.hdr = wh.common;
        self.body[..TAIL].copy_from_slice(&buf[RecordHeader::LEN..]);
    }

    /// Bytes of header+inline payload this record occupies in a block.
    /// Commit markers occupy nothing.
    pub(crate) fn record_size(&self) -> u64 {
        if self.hdr.kind() == TX_COMMIT {
            return 0;
        }
        debug_assert!(self.hdr.reclen >= RecordHeader::LEN as u64);
        self.hdr.reclen
    }

    /// Bytes of deferred payload a need-copy write will add at fill time.
    pub(crate) fn data_size(&self) -> u64 {
        if self.hdr.kind() == TX_WRITE && self.write_state == WriteState::NeedCopy {
            debug_assert_eq!(self.hdr.reclen as usize, WriteHeader::LEN);
            let length = u64::from_le_bytes(self.body[16..24].try_into().unwrap());
            return round_up(length as usize, crate::RECORD_ALIGN) as u64;
        }
        0
    }

    pub(crate) fn full_size(&self) -> u64 {
        if self.hdr.kind() == TX_COMMIT {
            return 0;
        }
        self.record_size() + self.data_size()
    }
}

impl fmt::Debug for Itx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Itx")
            .field("hdr", &self.hdr)
            .field("sync", &self.sync)
            .field("write_state", &self.write_state)
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

/// Build a write record. The payload is inlined for [`WriteState::Copied`];
/// for the other states only the write header is logged and the data is
/// fetched (or referenced) at fill time.
pub fn write_itx(
    object: u64,
    offset: u64,
    length: u64,
    state: WriteState,
    payload: &[u8],
) -> Itx {
    let body_len = WriteHeader::LEN - RecordHeader::LEN
        + if state == WriteState::Copied {
            payload.len()
        } else {
            0
        };
    let mut itx = Itx::new(TX_WRITE, body_len);
    itx.object = object;
    itx.write_state = state;
    let wh = WriteHeader {
        common: itx.hdr,
        object,
        offset,
        length,
        blkptr: BlockPointer::HOLE,
    };
    let mut buf = vec![0; WriteHeader::LEN];
    wh.encode(&mut buf);
    itx.body[..WriteHeader::LEN - RecordHeader::LEN]
        .copy_from_slice(&buf[RecordHeader::LEN..]);
    if state == WriteState::Copied {
        itx.body[WriteHeader::LEN - RecordHeader::LEN
            ..WriteHeader::LEN - RecordHeader::LEN + payload.len()]
            .copy_from_slice(payload);
    }
    itx
}
