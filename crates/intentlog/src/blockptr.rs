use std::io;

/// Identifier of a backing device, used to address cache flushes.
pub type DeviceId = u64;

/// A single device address: which device, and where on it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Dva {
    pub device: DeviceId,
    pub offset: u64,
}

/// Framing of the block a pointer refers to.
///
/// Slim blocks carry the chain header at offset 0 and only the used prefix
/// is written; legacy blocks carry it as a trailer and are written whole.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum ChainKind {
    #[default]
    Legacy = 1,
    Slim = 2,
}

/// The 4-word identity that chains blocks together.
///
/// The verifier for block N+1 is block N's identity with the `seq` word
/// incremented, so a stale block left over from an earlier chain cannot be
/// mistaken for the next link.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainId {
    pub guid: [u64; 2],
    pub objset: u64,
    pub seq: u64,
}

impl ChainId {
    /// The identity the next block in the chain must carry.
    pub fn next(&self) -> ChainId {
        ChainId {
            seq: self.seq + 1,
            ..*self
        }
    }
}

/// Pointer to an allocated log block.
///
/// An all-zero pointer is a hole, i.e. "no block". Up to two device
/// addresses may be present when the allocator mirrors the block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockPointer {
    pub dvas: [Dva; 2],
    pub ndvas: u8,
    pub kind: ChainKind,
    pub size: u32,
    pub birth_txg: u64,
    pub chain: ChainId,
}

impl BlockPointer {
    pub const LEN: usize = 128;

    pub const HOLE: BlockPointer = BlockPointer {
        dvas: [Dva { device: 0, offset: 0 }; 2],
        ndvas: 0,
        kind: ChainKind::Legacy,
        size: 0,
        birth_txg: 0,
        chain: ChainId {
            guid: [0; 2],
            objset: 0,
            seq: 0,
        },
    };

    pub fn is_hole(&self) -> bool {
        self.ndvas == 0 && self.size == 0 && self.birth_txg == 0
    }

    /// Device addresses actually populated by the allocator.
    pub fn dvas(&self) -> &[Dva] {
        &self.dvas[..self.ndvas as usize]
    }

    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= Self::LEN);
        let out = &mut out[..Self::LEN];
        out.fill(0);
        out[0..8].copy_from_slice(&self.dvas[0].device.to_le_bytes());
        out[8..16].copy_from_slice(&self.dvas[0].offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.dvas[1].device.to_le_bytes());
        out[24..32].copy_from_slice(&self.dvas[1].offset.to_le_bytes());
        out[32..36].copy_from_slice(&self.size.to_le_bytes());
        out[36] = self.ndvas;
        out[37] = self.kind as u8;
        out[40..48].copy_from_slice(&self.birth_txg.to_le_bytes());
        out[48..56].copy_from_slice(&self.chain.guid[0].to_le_bytes());
        out[56..64].copy_from_slice(&self.chain.guid[1].to_le_bytes());
        out[64..72].copy_from_slice(&self.chain.objset.to_le_bytes());
        out[72..80].copy_from_slice(&self.chain.seq.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short block pointer",
            ));
        }
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let kind = match buf[37] {
            1 => ChainKind::Legacy,
            2 => ChainKind::Slim,
            // A hole is all zeroes, including the kind byte.
            0 => ChainKind::Legacy,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown chain kind {other}"),
                ))
            }
        };
        Ok(BlockPointer {
            dvas: [
                Dva {
                    device: u64_at(0),
                    offset: u64_at(8),
                },
                Dva {
                    device: u64_at(16),
                    offset: u64_at(24),
                },
            ],
            ndvas: buf[36],
            kind,
            size: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            birth_txg: u64_at(40),
            chain: ChainId {
                guid: [u64_at(48), u64_at(56)],
                objset: u64_at(64),
                seq: u64_at(72),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip() {
        let bp = BlockPointer {
            dvas: [
                Dva {
                    device: 3,
                    offset: 0x1000,
                },
                Dva {
                    device: 7,
                    offset: 0x8000,
                },
            ],
            ndvas: 2,
            kind: ChainKind::Slim,
            size: 8192,
            birth_txg: 42,
            chain: ChainId {
                guid: [0xdead, 0xbeef],
                objset: 11,
                seq: 9,
            },
        };

        let mut buf = [0u8; BlockPointer::LEN];
        bp.encode(&mut buf);
        assert_eq!(bp, BlockPointer::decode(&buf).unwrap());
    }

    #[test]
    fn hole_is_all_zeroes() {
        let mut buf = [0u8; BlockPointer::LEN];
        BlockPointer::HOLE.encode(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
        assert!(BlockPointer::decode(&buf).unwrap().is_hole());
    }

    #[test]
    fn chain_identity_increments_seq_only() {
        let id = ChainId {
            guid: [1, 2],
            objset: 5,
            seq: 77,
        };
        let next = id.next();
        assert_eq!(next.guid, id.guid);
        assert_eq!(next.objset, id.objset);
        assert_eq!(next.seq, 78);
    }
}
