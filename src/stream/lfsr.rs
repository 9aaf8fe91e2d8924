/// 8-bit Galois LFSR (x^8 + x^4 + x^3 + x^2 + 1) used to synthesize stream
/// payloads and to check them on the other side.
///
/// The generator steps once per byte, so the byte at any stream offset can be
/// regenerated from the seed alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lfsr(u8);

const POLY: u8 = 0x1d;

/// Number of distinct non-zero states; the sequence repeats after this many bytes.
pub const PERIOD: usize = 255;

impl Lfsr {
    pub fn new(seed: u8) -> Self {
        // zero is a fixed point of the register
        Self(if seed == 0 { 1 } else { seed })
    }

    /// Generator for the data the device sends on stream `idx`.
    pub fn device(idx: usize) -> Self {
        Self::new(0xa5 ^ (idx as u8).wrapping_mul(0x1b))
    }

    /// Generator for the data the host sends on stream `idx`.
    pub fn host(idx: usize) -> Self {
        Self::new(0x5a ^ (idx as u8).wrapping_mul(0x1b))
    }

    /// Generator positioned `offset` bytes into the sequence of `self`.
    #[cfg(test)]
    pub fn at(mut self, offset: u64) -> Self {
        self.advance((offset % PERIOD as u64) as usize);
        self
    }

    pub fn state(self) -> u8 {
        self.0
    }

    pub fn next_byte(&mut self) -> u8 {
        let out = self.0;
        let carry = self.0 & 0x80 != 0;
        self.0 <<= 1;
        if carry {
            self.0 ^= POLY;
        }
        out
    }

    pub fn advance(&mut self, n: usize) {
        for _ in 0..n % PERIOD {
            self.next_byte();
        }
    }

    #[cfg(test)]
    pub fn fill(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b = self.next_byte();
        }
    }

    /// Compares `data` against the sequence, advancing past it. Returns the
    /// number of mismatching bytes.
    pub fn check(&mut self, data: &[u8]) -> usize {
        data.iter().filter(|&&b| b != self.next_byte()).count()
    }
}
