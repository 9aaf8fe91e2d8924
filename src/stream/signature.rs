//! Stream signatures.
//!
//! The device may prefix a stream with a signature describing how it will
//! generate the data (initial LFSR state, byte count, direction flags). On
//! isochronous streams every packet carries one, since packets may be lost and
//! the checker has to resynchronise.

pub const SIGNATURE_LEN: usize = 16;

const HEAD_SIG: u32 = 0x579e_a01a;
const TAIL_SIG: u32 = 0x160a_e975;

pub const FLAG_RETRIEVE: u8 = 0x01;
pub const FLAG_CHECK: u8 = 0x02;
pub const FLAG_SEND: u8 = 0x04;
/// Last packet of the test on this stream.
pub const FLAG_END: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub init_lfsr: u8,
    pub stream: u8,
    pub flags: u8,
    pub seq: u8,
    pub num_bytes: u32,
}

impl Signature {
    /// Decodes a signature from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SIGNATURE_LEN {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        if word(0) != HEAD_SIG || word(12) != TAIL_SIG {
            return None;
        }
        Some(Self {
            init_lfsr: buf[4],
            stream: buf[5],
            flags: buf[6],
            seq: buf[7],
            num_bytes: word(8),
        })
    }

    /// True if `buf` could still turn out to be the beginning of a signature.
    pub fn could_start(buf: &[u8]) -> bool {
        let head = HEAD_SIG.to_le_bytes();
        let n = buf.len().min(head.len());
        buf[..n] == head[..n]
    }

    pub fn encode(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out[0..4].copy_from_slice(&HEAD_SIG.to_le_bytes());
        out[4] = self.init_lfsr;
        out[5] = self.stream;
        out[6] = self.flags;
        out[7] = self.seq;
        out[8..12].copy_from_slice(&self.num_bytes.to_le_bytes());
        out[12..16].copy_from_slice(&TAIL_SIG.to_le_bytes());
        out
    }

    pub fn retrieve(&self) -> bool {
        self.flags & FLAG_RETRIEVE != 0
    }

    pub fn check(&self) -> bool {
        self.flags & FLAG_CHECK != 0
    }

    pub fn send(&self) -> bool {
        self.flags & FLAG_SEND != 0
    }

    pub fn end_of_test(&self) -> bool {
        self.flags & FLAG_END != 0
    }
}
