//! On-disk framing of a log block.
//!
//! Two framings exist. Slim blocks carry the [`ChainHeader`] at offset 0
//! and only `nused` rounded up to the minimum block size is written; legacy
//! blocks carry the header as a trailer at the block's end and are written
//! whole. The header stores the pointer to the next block in the chain, the
//! block's own chain identity (the checksum seed), the used byte count and
//! an embedded crc32c over the written bytes.

use crate::blockptr::{BlockPointer, ChainId, ChainKind};
use crate::error::{ChecksumMismatch, Traversal};
use crate::record::RecordHeader;
use crate::round_up;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ChainHeader {
    /// Pointer to the next block. Stamped when this block is issued; its
    /// chain identity must be this block's identity with the seq word
    /// incremented.
    pub next: BlockPointer,
    /// This block's own identity. A stale block left at the same location
    /// by an earlier chain carries a different identity and terminates the
    /// walk.
    pub self_id: ChainId,
    /// Bytes of the block in use, header included for slim framing.
    pub nused: u64,
    pub cksum: u32,
}

impl ChainHeader {
    pub(crate) const LEN: usize = BlockPointer::LEN + /* self_id */ 32 + /* nused */ 8 + /* cksum + pad */ 8;

    fn encode(&self, out: &mut [u8]) {
        self.next.encode(&mut out[..BlockPointer::LEN]);
        let mut off = BlockPointer::LEN;
        for word in [
            self.self_id.guid[0],
            self.self_id.guid[1],
            self.self_id.objset,
            self.self_id.seq,
            self.nused,
        ] {
            out[off..off + 8].copy_from_slice(&word.to_le_bytes());
            off += 8;
        }
        out[off..off + 4].copy_from_slice(&self.cksum.to_le_bytes());
        out[off + 4..off + 8].fill(0);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let next = BlockPointer::decode(&buf[..BlockPointer::LEN]).ok()?;
        let u64_at =
            |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let base = BlockPointer::LEN;
        Some(ChainHeader {
            next,
            self_id: ChainId {
                guid: [u64_at(base), u64_at(base + 8)],
                objset: u64_at(base + 16),
                seq: u64_at(base + 24),
            },
            nused: u64_at(base + 32),
            cksum: u32::from_le_bytes(buf[base + 40..base + 44].try_into().unwrap()),
        })
    }
}

/// crc32c over `buf` with the embedded checksum field (at `cksum_off`)
/// treated as zero.
fn block_crc(buf: &[u8], cksum_off: usize) -> u32 {
    let crc = crc32c::crc32c(&buf[..cksum_off]);
    let crc = crc32c::crc32c_append(crc, &[0; 4]);
    crc32c::crc32c_append(crc, &buf[cksum_off + 4..])
}

fn cksum_offset(buf_len: usize, slim: bool) -> usize {
    let base = if slim { 0 } else { buf_len - ChainHeader::LEN };
    base + BlockPointer::LEN + 40
}

/// Stamp the chain header into `buf` and return the number of bytes that
/// must actually be written to the device.
pub(crate) fn finalize_block(
    buf: &mut [u8],
    slim: bool,
    nused: usize,
    self_id: ChainId,
    next: BlockPointer,
) -> usize {
    let wsz = if slim {
        round_up(nused, crate::MIN_BLOCK_SIZE).min(buf.len())
    } else {
        buf.len()
    };
    // Zero any padding bytes past the used region.
    buf[nused..wsz].fill(0);
    if !slim {
        debug_assert!(nused <= buf.len() - ChainHeader::LEN);
    }

    let mut hdr = ChainHeader {
        next,
        self_id,
        nused: nused as u64,
        cksum: 0,
    };
    let hdr_off = if slim { 0 } else { buf.len() - ChainHeader::LEN };
    hdr.encode(&mut buf[hdr_off..hdr_off + ChainHeader::LEN]);
    hdr.cksum = block_crc(&buf[..wsz], cksum_offset(buf.len(), slim));
    hdr.encode(&mut buf[hdr_off..hdr_off + ChainHeader::LEN]);

    wsz
}

/// Validate the block read via `bp` and return its record region together
/// with the pointer to the next block.
///
/// Any failure here is the logical end of the chain.
pub(crate) fn decode_block<'a>(
    bp: &BlockPointer,
    data: &'a [u8],
) -> Result<(&'a [u8], BlockPointer), Traversal> {
    let seq = bp.chain.seq;
    let slim = bp.kind == ChainKind::Slim;
    let framing = |reason| Traversal::Framing { seq, reason };

    if data.len() > bp.size as usize {
        return Err(framing("block longer than its pointer"));
    }
    let hdr_off = if slim {
        0
    } else {
        if data.len() != bp.size as usize {
            return Err(framing("legacy block not written whole"));
        }
        data.len() - ChainHeader::LEN
    };
    if data.len() < hdr_off + ChainHeader::LEN {
        return Err(framing("block shorter than chain header"));
    }
    let hdr = ChainHeader::decode(&data[hdr_off..hdr_off + ChainHeader::LEN])
        .ok_or(framing("bad chain header"))?;

    let (lo, hi) = if slim {
        (ChainHeader::LEN, bp.size as usize)
    } else {
        (0, bp.size as usize - ChainHeader::LEN)
    };
    if (hdr.nused as usize) < lo || hdr.nused as usize > hi {
        return Err(framing("nused out of bounds"));
    }
    let verified = if slim {
        round_up(hdr.nused as usize, crate::MIN_BLOCK_SIZE).min(data.len())
    } else {
        data.len()
    };
    if verified > data.len() || (slim && (hdr.nused as usize) > data.len()) {
        return Err(framing("short block"));
    }
    if block_crc(&data[..verified], cksum_offset(data.len(), slim)) != hdr.cksum {
        return Err(Traversal::Checksum {
            seq,
            source: ChecksumMismatch,
        });
    }
    // The block must be the link we followed, not a stale block an earlier
    // chain left at the same location.
    if hdr.self_id != bp.chain {
        return Err(Traversal::Linkage { seq });
    }
    // And its next pointer, if stamped, must continue this chain.
    if hdr.next.chain != bp.chain.next() {
        return Err(Traversal::Linkage { seq });
    }

    let records = if slim {
        &data[ChainHeader::LEN..hdr.nused as usize]
    } else {
        &data[..hdr.nused as usize]
    };
    Ok((records, hdr.next))
}

/// Iterate the records packed into a block's record region.
///
/// Yields `(header, record_bytes)` pairs, where `record_bytes` covers the
/// whole record including the header. Stops with a framing error when the
/// remaining bytes cannot hold a valid record.
pub(crate) fn records<'a>(
    region: &'a [u8],
    blk_seq: u64,
) -> impl Iterator<Item = Result<(RecordHeader, &'a [u8]), Traversal>> + 'a {
    let mut off = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || off >= region.len() {
            return None;
        }
        let rest = &region[off..];
        if rest.len() < RecordHeader::LEN {
            failed = true;
            return Some(Err(Traversal::Framing {
                seq: blk_seq,
                reason: "record header overruns block",
            }));
        }
        let hdr = match RecordHeader::decode(rest) {
            Ok(hdr) => hdr,
            Err(_) => {
                failed = true;
                return Some(Err(Traversal::Framing {
                    seq: blk_seq,
                    reason: "bad record header",
                }));
            }
        };
        let reclen = hdr.reclen as usize;
        if reclen < RecordHeader::LEN || reclen > rest.len() || reclen % crate::RECORD_ALIGN != 0 {
            failed = true;
            return Some(Err(Traversal::Framing {
                seq: blk_seq,
                reason: "record has an invalid reclen",
            }));
        }
        let bytes = &rest[..reclen];
        off += reclen;
        Some(Ok((hdr, bytes)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockptr::Dva;
    use crate::record::Itx;
    use crate::MIN_BLOCK_SIZE;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn test_bp(size: u32, kind: ChainKind, seq: u64) -> BlockPointer {
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
            chain: ChainId {
                guid: [11, 22],
                objset: 3,
                seq,
            },
        }
    }

    fn fill_records(buf: &mut [u8], mut off: usize, n: usize) -> usize {
        for i in 0..n {
            let mut itx = Itx::new(7, 24);
            itx.body_mut().fill(i as u8);
            let mut hdr = *itx.header();
            hdr.seq = i as u64 + 1;
            hdr.encode(&mut buf[off..]);
            buf[off + RecordHeader::LEN..off + hdr.reclen as usize]
                .copy_from_slice(itx.body());
            off += hdr.reclen as usize;
        }
        off
    }

    #[test]
    fn slim_roundtrip() {
        let bp = test_bp(MIN_BLOCK_SIZE as u32 * 2, ChainKind::Slim, 5);
        let mut buf = vec![0u8; bp.size as usize];
        let nused = fill_records(&mut buf, ChainHeader::LEN, 3);

        let wsz = finalize_block(
            &mut buf,
            true,
            nused,
            bp.chain,
            test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Slim, 6),
        );
        assert_eq!(wsz, MIN_BLOCK_SIZE);

        let (region, next) = decode_block(&bp, &buf[..wsz]).unwrap();
        assert_eq!(region.len(), nused - ChainHeader::LEN);
        assert_eq!(next.chain.seq, 6);

        let recs: Vec<_> = records(region, 5).collect::<Result<_, _>>().unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].0.seq, 1);
        assert_eq!(recs[2].0.seq, 3);
    }

    #[test]
    fn legacy_roundtrip() {
        let bp = test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Legacy, 1);
        let mut buf = vec![0u8; bp.size as usize];
        let nused = fill_records(&mut buf, 0, 2);

        let wsz = finalize_block(
            &mut buf,
            false,
            nused,
            bp.chain,
            test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Legacy, 2),
        );
        assert_eq!(wsz, bp.size as usize);

        let (region, next) = decode_block(&bp, &buf).unwrap();
        assert_eq!(region.len(), nused);
        assert_eq!(next.chain.seq, 2);
        assert_eq!(records(region, 1).count(), 2);
    }

    #[test]
    fn stale_block_terminates_chain() {
        let bp = test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Slim, 9);
        let mut buf = vec![0u8; bp.size as usize];
        // A block written under a different chain identity.
        let stale = ChainId {
            guid: [99, 98],
            objset: 3,
            seq: 9,
        };
        finalize_block(
            &mut buf,
            true,
            ChainHeader::LEN,
            stale,
            BlockPointer {
                chain: stale.next(),
                ..test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Slim, 10)
            },
        );
        assert!(matches!(
            decode_block(&bp, &buf),
            Err(Traversal::Linkage { seq: 9 })
        ));
    }

    #[test]
    fn record_overrun_is_framing_error() {
        let mut region = vec![0u8; 64];
        let hdr = RecordHeader {
            txtype: 7,
            reclen: 128, // extends past the region
            txg: 1,
            seq: 1,
        };
        hdr.encode(&mut region);
        let last = records(&region, 1).last().unwrap();
        assert!(matches!(last, Err(Traversal::Framing { .. })));
    }

    proptest! {
        #[test]
        fn bitflip(pos in 0usize..MIN_BLOCK_SIZE, mask in 1u8..) {
            let bp = test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Slim, 4);
            let mut buf = vec![0u8; bp.size as usize];
            let nused = fill_records(&mut buf, ChainHeader::LEN, 4);
            let wsz = finalize_block(
                &mut buf,
                true,
                nused,
                bp.chain,
                test_bp(MIN_BLOCK_SIZE as u32, ChainKind::Slim, 5),
            );

            buf[pos % wsz] ^= mask;

            // Whatever bit flipped, the walk must stop at this block.
            prop_assert!(decode_block(&bp, &buf[..wsz]).is_err());
        }
    }
}
