//! K-mer encoding: 2-bit mapping, rolling reverse complement, canonicalization.
//!
//! Conventions
//! - Codes are **LSB-aligned**: the lower `2k` bits hold the k-mer, first base
//!   in the most significant pair.
//! - For a fixed `k`, numeric order of codes equals lexicographic `ACGT` order,
//!   which is the order every store and stream uses.

use std::fmt;

/// Largest supported k-mer length.
pub const MAX_MER_SIZE: usize = 32;

/// 256-entry LUT: ASCII → 2-bit (A=0, C=1, G=2, T/U=3), 0xFF for ambiguous.
pub static MAP_LUT: [u8; 256] = {
    const X: u8 = 0xFF;
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

const BASES: [u8; 4] = *b"ACGT";

/// Which strand(s) a k-mer is counted on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StrandMode {
    /// K-mers as they appear in the read.
    Forward,
    /// Reverse complement of every k-mer.
    Reverse,
    /// Smaller of forward and reverse complement.
    #[default]
    Canonical,
}

impl StrandMode {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            StrandMode::Forward => 0,
            StrandMode::Reverse => 1,
            StrandMode::Canonical => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StrandMode::Forward),
            1 => Some(StrandMode::Reverse),
            2 => Some(StrandMode::Canonical),
            _ => None,
        }
    }

    /// Select the code to count from a forward/reverse-complement pair.
    #[inline]
    pub fn select(self, fwd: u64, rc: u64) -> u64 {
        match self {
            StrandMode::Forward => fwd,
            StrandMode::Reverse => rc,
            StrandMode::Canonical => fwd.min(rc),
        }
    }
}

/// A fixed-width encoded k-mer. Ordering is by encoded value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kmer(pub u64);

impl Kmer {
    /// Raw LSB-aligned code.
    #[inline]
    pub fn code(self) -> u64 {
        self.0
    }

    /// Encode an `ACGT` string. `None` if empty, longer than 32, or ambiguous.
    pub fn from_bases(bases: &[u8]) -> Option<Self> {
        encode_kmer(bases).map(Kmer)
    }

    /// Borrow a displayable form for a given `k`.
    pub fn display(self, k: usize) -> KmerDisplay {
        KmerDisplay { code: self.0, k }
    }

    /// Decode to an uppercase `ACGT` string of length `k`.
    pub fn to_bases(self, k: usize) -> String {
        self.display(k).to_string()
    }
}

/// `Display` adapter that knows the k-mer length.
pub struct KmerDisplay {
    code: u64,
    k: usize,
}

impl fmt::Display for KmerDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write;
        for i in (0..self.k).rev() {
            let base = (self.code >> (2 * i)) & 0b11;
            f.write_char(BASES[base as usize] as char)?;
        }
        Ok(())
    }
}

/// 2-bit encoding via LUT: A=00, C=01, G=10, T=11. `None` if ambiguous.
#[inline]
pub fn map_base(b: u8) -> Option<u8> {
    let v = MAP_LUT[b as usize];
    if v <= 3 { Some(v) } else { None }
}

/// Encode a k-mer window to an **LSB-aligned** `u64`. None if `k>32` or ambiguous.
#[inline]
pub fn encode_kmer(window: &[u8]) -> Option<u64> {
    let k = window.len();
    if k == 0 || k > MAX_MER_SIZE {
        return None;
    }
    let mut code: u64 = 0;
    for &b in window {
        let v = map_base(b)? as u64;
        code = (code << 2) | v;
    }
    Some(code)
}

/// Reverse-complement an LSB-aligned code (lower `2k` bits used).
#[inline]
pub fn revcomp(code: u64, k: usize) -> u64 {
    debug_assert!(k <= MAX_MER_SIZE);
    let mut rc: u64 = 0;
    for i in 0..k {
        let base = (code >> (i * 2)) & 0b11;
        let comp = base ^ 0b11;
        let shift = (k - 1 - i) * 2;
        rc |= comp << shift;
    }
    rc
}

/// Canonical form of an LSB-aligned code.
#[inline]
pub fn canonical(code: u64, k: usize) -> u64 {
    code.min(revcomp(code, k))
}

/// Mask covering the lower `2k` bits.
#[inline]
pub fn mer_mask(k: usize) -> u64 {
    if k >= MAX_MER_SIZE {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

/// Call `emit` with the code of every k-mer in `seq`, selected by `mode`.
///
/// Rolling forward and reverse-complement codes are updated in O(1) per base.
/// An ambiguous base resets the window.
pub fn for_each_kmer<F: FnMut(u64)>(seq: &[u8], k: usize, mode: StrandMode, mut emit: F) {
    if k == 0 || k > MAX_MER_SIZE || seq.len() < k {
        return;
    }

    let mask = mer_mask(k);
    let rc_shift = 2 * (k - 1);
    let mut fwd: u64 = 0;
    let mut rc: u64 = 0;
    let mut len: usize = 0;

    for &b in seq {
        let v_raw = MAP_LUT[b as usize];
        if v_raw > 3 {
            fwd = 0;
            rc = 0;
            len = 0;
            continue;
        }
        let v = v_raw as u64;

        fwd = ((fwd << 2) | v) & mask;
        rc = (rc >> 2) | ((v ^ 0b11) << rc_shift);
        len += 1;

        if len >= k {
            emit(mode.select(fwd, rc));
        }
    }
}
