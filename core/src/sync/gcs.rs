//! Golomb-Coded Set — compact probabilistic encoding of a packet-id set
//!
//! Construction (parameter P, target false-positive rate 2^-P):
//! the N 64-bit reduced identities are mapped into `[0, M)` with `M = N·2^P`,
//! sorted, and the deltas between consecutive values Golomb-Rice coded into
//! an MSB-first bitstream: quotient `d >> P` in unary (that many 1-bits then
//! a 0), remainder in P literal bits. `N` is recoverable as `M >> P`, so the
//! wire carries only `(P, M, bitstream)`.
//!
//! Membership is probabilistic: every inserted element tests positive (no
//! false negatives); an absent element collides with probability ≈ 2^-P.

use super::{SyncError, MAX_FPR_BITS, MAX_SNAPSHOT_ELEMENTS, MIN_FPR_BITS};

/// An encoded snapshot: parameter, domain size, and the Rice bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsSnapshot {
    /// Golomb-Rice parameter.
    pub p: u8,
    /// Domain size, `n * 2^p`.
    pub m: u64,
    /// MSB-first delta-encoded bitstream.
    pub data: Vec<u8>,
}

struct BitWriter {
    buf: Vec<u8>,
    /// Bits used in the final byte (0..8).
    used: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            used: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        if self.used == 0 {
            self.buf.push(0);
        }
        if bit {
            let last = self.buf.len() - 1;
            self.buf[last] |= 0x80 >> self.used;
        }
        self.used = (self.used + 1) % 8;
    }

    fn push_bits(&mut self, value: u64, count: u8) {
        for i in (0..count).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, SyncError> {
        let byte = self.pos / 8;
        if byte >= self.buf.len() {
            return Err(SyncError::Truncated);
        }
        let bit = self.buf[byte] & (0x80 >> (self.pos % 8)) != 0;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, SyncError> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    fn read_unary(&mut self) -> Result<u64, SyncError> {
        let mut q = 0u64;
        while self.read_bit()? {
            q += 1;
            // A unary run cannot meaningfully exceed the stream length;
            // this bound is implied by read_bit's end-of-buffer check.
        }
        Ok(q)
    }
}

impl GcsSnapshot {
    /// Build a snapshot from raw 64-bit reduced identities.
    pub fn build(values: &[u64], p: u8) -> Self {
        debug_assert!((MIN_FPR_BITS..=MAX_FPR_BITS).contains(&p));
        if values.is_empty() {
            return Self {
                p,
                m: 0,
                data: Vec::new(),
            };
        }

        let mut distinct: Vec<u64> = values.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        let n = distinct.len() as u64;
        let m = n << p;
        let mut mapped: Vec<u64> = distinct.iter().map(|v| v % m).collect();
        mapped.sort_unstable();
        // Modulus collisions stay in as zero deltas so the element count
        // recoverable from M matches the stream.

        let mut writer = BitWriter::new();
        let mut prev = 0u64;
        for value in &mapped {
            let delta = value - prev;
            let quotient = delta >> p;
            for _ in 0..quotient {
                writer.push_bit(true);
            }
            writer.push_bit(false);
            writer.push_bits(delta, p);
            prev = *value;
        }

        Self {
            p,
            m,
            data: writer.into_bytes(),
        }
    }

    /// Number of encoded elements.
    pub fn element_count(&self) -> u64 {
        self.m >> self.p
    }

    /// Validate parameters against the protocol sanity bounds and the
    /// configured bitstream ceiling.
    pub fn validate(&self, stream_ceiling: usize) -> Result<(), SyncError> {
        if !(MIN_FPR_BITS..=MAX_FPR_BITS).contains(&self.p) {
            return Err(SyncError::InvalidParameter(self.p));
        }
        if self.data.len() > stream_ceiling {
            return Err(SyncError::StreamTooLong {
                declared: self.data.len(),
                ceiling: stream_ceiling,
            });
        }
        let n = self.m >> self.p;
        if n > MAX_SNAPSHOT_ELEMENTS || (n << self.p) != self.m {
            return Err(SyncError::InvalidDomain {
                m: self.m,
                p: self.p,
            });
        }
        Ok(())
    }

    /// Decode the sorted member values in `[0, M)`.
    pub fn decode_members(&self) -> Result<Vec<u64>, SyncError> {
        let n = self.element_count();
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut reader = BitReader::new(&self.data);
        let mut members = Vec::with_capacity(n as usize);
        let mut prev = 0u64;
        for _ in 0..n {
            let quotient = reader.read_unary()?;
            let remainder = reader.read_bits(self.p)?;
            let delta = (quotient << self.p) | remainder;
            // Zero deltas are legal: they mark modulus collisions.
            let value = prev + delta;
            if value >= self.m {
                return Err(SyncError::NotSorted);
            }
            members.push(value);
            prev = value;
        }
        Ok(members)
    }

    /// Probabilistic membership of a raw 64-bit identity against decoded
    /// members (as returned by [`decode_members`](Self::decode_members)).
    pub fn contains(members: &[u64], m: u64, value: u64) -> bool {
        if m == 0 {
            return false;
        }
        members.binary_search(&(value % m)).is_ok()
    }
}
