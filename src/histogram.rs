//! Count distribution: how many k-mers were seen with each count.

use std::collections::BTreeMap;
use std::io::Write;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Histogram {
    bins: BTreeMap<u64, u64>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, count: u64) {
        *self.bins.entry(count).or_insert(0) += 1;
    }

    /// Number of k-mers with exactly `count`.
    pub fn get(&self, count: u64) -> u64 {
        self.bins.get(&count).copied().unwrap_or(0)
    }

    /// Number of k-mers recorded.
    pub fn distinct(&self) -> u64 {
        self.bins.values().sum()
    }

    /// Sum of all counts recorded, saturating.
    pub fn total(&self) -> u64 {
        self.bins
            .iter()
            .fold(0u64, |acc, (&c, &n)| acc.saturating_add(c.saturating_mul(n)))
    }

    /// `(count, k-mers)` pairs in increasing count order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.bins.iter().map(|(&c, &n)| (c, n))
    }

    /// One `count<TAB>k-mers` line per bin.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> std::io::Result<()> {
        for (c, n) in self.iter() {
            writeln!(w, "{c}\t{n}")?;
        }
        Ok(())
    }
}
