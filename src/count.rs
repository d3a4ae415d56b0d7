//! Counting: raw sequence → sorted `(k-mer, count)` store.
//!
//! Two strategies, picked from [`CountConfig`]:
//! - direct: a `4^k` table of atomic counters, filled in parallel and emitted
//!   in index order. Used for short k when the table fits the memory budget.
//! - general: codes are gathered per block in parallel, radix sorted and
//!   collapsed into counts. Batches that outgrow the memory budget are spilled
//!   to intermediate stores and merged back with a `union-sum` node.
//!
//! Either way the sink receives one strictly increasing stream.

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::encode::{Kmer, MAX_MER_SIZE, StrandMode, for_each_kmer};
use crate::input::Input;
use crate::io::{Compression, StoreOptions, StoreWriter};
use crate::node::{OpError, OperationNode, Verbosity};
use crate::operation::Operation;
use crate::radix::{radix_sort_u64, run_length};
use crate::sink::KmerSink;
use crate::store::StoreInput;

const DIRECT_MAX_K_LIMIT: usize = 16;

/// Counting configuration.
#[derive(Clone, Debug)]
pub struct CountConfig {
    mer_size: usize,
    threads: Option<usize>,
    memory_bytes: usize,
    direct_max_k: usize,
    block_size: usize,
    batch_dir: Option<PathBuf>,
    verbosity: Verbosity,
}

impl CountConfig {
    /// Count k-mers of length `mer_size` (1..=32).
    pub fn new(mer_size: usize) -> Self {
        Self {
            mer_size,
            threads: None,
            memory_bytes: 1 << 30,
            direct_max_k: 12,
            block_size: 16_384,
            batch_dir: None,
            verbosity: Verbosity::Quiet,
        }
    }
    /// Worker threads (default: rayon's choice).
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }
    /// Memory budget in bytes for the counting table or one batch.
    pub fn memory_bytes(mut self, n: usize) -> Self {
        self.memory_bytes = n;
        self
    }
    /// Largest k counted with the direct table (capped at 16).
    pub fn direct_max_k(mut self, k: usize) -> Self {
        self.direct_max_k = k.min(DIRECT_MAX_K_LIMIT);
        self
    }
    /// Sequences handed to the workers at once.
    pub fn block_size(mut self, n: usize) -> Self {
        self.block_size = n.max(1);
        self
    }
    /// Where spilled batches go (default: next to the output, else the
    /// system temp dir).
    pub fn batch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.batch_dir = Some(dir.into());
        self
    }
    pub fn verbosity(mut self, v: Verbosity) -> Self {
        self.verbosity = v;
        self
    }

    pub fn mer_size(&self) -> usize {
        self.mer_size
    }

    pub fn current_verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn uses_direct(&self) -> bool {
        self.mer_size <= self.direct_max_k
            && direct_table_bytes(self.mer_size) <= self.memory_bytes
    }

    /// Codes held per batch: the codes plus radix scratch.
    fn batch_codes(&self) -> usize {
        (self.memory_bytes / 16).max(1024)
    }
}

fn direct_table_bytes(k: usize) -> usize {
    (1usize << (2 * k)) * std::mem::size_of::<AtomicU64>()
}

/// Raw sequence to be counted.
#[derive(Clone, Debug)]
pub enum SequenceSource {
    /// FASTA/FASTQ file, optionally compressed.
    File(PathBuf),
    /// Sequences already in memory.
    Memory {
        name: String,
        sequences: Vec<Vec<u8>>,
    },
}

impl SequenceSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SequenceSource::File(path.into())
    }

    pub fn memory<S: AsRef<[u8]>>(name: impl Into<String>, sequences: &[S]) -> Self {
        SequenceSource::Memory {
            name: name.into(),
            sequences: sequences.iter().map(|s| s.as_ref().to_vec()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SequenceSource::File(p) => p.to_str().unwrap_or("<non-utf8 path>"),
            SequenceSource::Memory { name, .. } => name,
        }
    }

    /// Hand sequences to `f` in blocks of at most `block_size`.
    fn for_each_block<F>(&self, block_size: usize, mut f: F) -> Result<(), OpError>
    where
        F: FnMut(&[Vec<u8>]) -> Result<(), OpError>,
    {
        match self {
            SequenceSource::Memory { sequences, .. } => {
                for block in sequences.chunks(block_size) {
                    f(block)?;
                }
            }
            SequenceSource::File(path) => {
                let mut reader = needletail::parse_fastx_file(path)?;
                let mut block: Vec<Vec<u8>> = Vec::with_capacity(block_size);
                while let Some(rec) = reader.next() {
                    let rec = rec?;
                    block.push(rec.seq().into_owned());
                    if block.len() == block_size {
                        f(&block)?;
                        block.clear();
                    }
                }
                if !block.is_empty() {
                    f(&block)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountMethod {
    Direct,
    Sorted { batches: usize },
}

/// What a counting pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountSummary {
    pub method: CountMethod,
    pub sequences: u64,
    /// K-mer occurrences seen.
    pub occurrences: u64,
    /// Distinct k-mers written.
    pub distinct: u64,
}

/// Count every k-mer of `sources` and write the sorted result into `sink`.
///
/// The sink is prepared here and finished before returning.
pub fn count_into(
    sources: &[SequenceSource],
    strand: StrandMode,
    cfg: &CountConfig,
    sink: &mut dyn KmerSink,
) -> Result<CountSummary, OpError> {
    let k = cfg.mer_size;
    if k == 0 || k > MAX_MER_SIZE {
        return Err(OpError::Config(format!("k must be 1..=32, got {k}")));
    }
    if let Some(found) = sink.mer_size().filter(|&m| m != k) {
        return Err(OpError::MerSizeMismatch {
            input: sink
                .store_path()
                .map_or_else(|| "output".to_string(), |p| p.display().to_string()),
            expected: k,
            found,
        });
    }

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = cfg.threads {
        builder = builder.num_threads(n);
    }
    let pool = builder.build()?;

    if cfg.verbosity >= Verbosity::Construction {
        info!(
            k,
            ?strand,
            sources = sources.len(),
            threads = pool.current_num_threads(),
            direct = cfg.uses_direct(),
            "counting k-mers"
        );
    }

    sink.prepare()?;
    let summary = if cfg.uses_direct() {
        count_direct(sources, strand, cfg, &pool, sink)?
    } else {
        count_sorted(sources, strand, cfg, &pool, sink)?
    };
    sink.finish_iteration()?;

    if cfg.verbosity >= Verbosity::Construction {
        info!(
            sequences = summary.sequences,
            occurrences = summary.occurrences,
            distinct = summary.distinct,
            method = ?summary.method,
            "counting finished"
        );
    }
    Ok(summary)
}

fn count_direct(
    sources: &[SequenceSource],
    strand: StrandMode,
    cfg: &CountConfig,
    pool: &rayon::ThreadPool,
    sink: &mut dyn KmerSink,
) -> Result<CountSummary, OpError> {
    let k = cfg.mer_size;
    let table: Vec<AtomicU64> = (0..1usize << (2 * k)).map(|_| AtomicU64::new(0)).collect();
    let mut sequences = 0u64;

    for src in sources {
        src.for_each_block(cfg.block_size, |block| {
            pool.install(|| {
                block.par_iter().for_each(|seq| {
                    for_each_kmer(seq, k, strand, |c| {
                        bump(&table[c as usize]);
                    });
                })
            });
            sequences += block.len() as u64;
            Ok(())
        })?;
    }

    let mut occurrences = 0u64;
    let mut distinct = 0u64;
    for (code, slot) in table.into_iter().enumerate() {
        let n = slot.into_inner();
        if n > 0 {
            sink.add_record(Kmer(code as u64), n)?;
            occurrences = occurrences.saturating_add(n);
            distinct += 1;
        }
    }

    Ok(CountSummary {
        method: CountMethod::Direct,
        sequences,
        occurrences,
        distinct,
    })
}

/// Add one occurrence; a counter at `u64::MAX` stays there.
#[inline]
fn bump(slot: &AtomicU64) {
    let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
}

static BATCH_SEQ: AtomicUsize = AtomicUsize::new(0);

fn count_sorted(
    sources: &[SequenceSource],
    strand: StrandMode,
    cfg: &CountConfig,
    pool: &rayon::ThreadPool,
    sink: &mut dyn KmerSink,
) -> Result<CountSummary, OpError> {
    let k = cfg.mer_size;
    let bits = 2 * k as u32;
    let max_codes = cfg.batch_codes();
    let batch_dir = cfg
        .batch_dir
        .clone()
        .or_else(|| sink.store_path().and_then(Path::parent).map(Path::to_path_buf))
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(std::env::temp_dir);
    let tag = BATCH_SEQ.fetch_add(1, Ordering::Relaxed);

    let mut codes: Vec<u64> = Vec::new();
    let mut runs: Vec<(u64, u64)> = Vec::new();
    let mut batches: Vec<PathBuf> = Vec::new();
    let mut sequences = 0u64;
    let mut occurrences = 0u64;

    let spill = |codes: &mut Vec<u64>,
                     runs: &mut Vec<(u64, u64)>,
                     batches: &mut Vec<PathBuf>|
     -> Result<(), OpError> {
        radix_sort_u64(codes, bits);
        run_length(codes, runs);
        codes.clear();

        let path = batch_dir.join(format!(
            "kmer-count-{}-{tag}.batch{:03}.kcs",
            std::process::id(),
            batches.len()
        ));
        let opts = StoreOptions::new(k)
            .strand(strand)
            .compression(Compression::DeltaVarint);
        let mut w = StoreWriter::create(&path, opts)?;
        w.prepare()?;
        for &(c, n) in runs.iter() {
            w.add_record(Kmer(c), n)?;
        }
        w.finish_iteration()?;
        runs.clear();

        if cfg.verbosity >= Verbosity::Details {
            debug!(batch = %path.display(), "spilled count batch");
        }
        batches.push(path);
        Ok(())
    };

    for src in sources {
        src.for_each_block(cfg.block_size, |block| {
            let parts = pieces(block, k, max_codes);
            let mut lo = 0;
            while lo < parts.len() {
                let mut hi = lo;
                let mut group_codes = 0;
                while hi < parts.len() {
                    let n = parts[hi].len() + 1 - k;
                    if hi > lo && group_codes + n > max_codes {
                        break;
                    }
                    group_codes += n;
                    hi += 1;
                }
                if !codes.is_empty() && codes.len() + group_codes > max_codes {
                    spill(&mut codes, &mut runs, &mut batches)?;
                }

                let shards: Vec<Vec<u64>> = pool.install(|| {
                    parts[lo..hi]
                        .par_iter()
                        .map(|piece| {
                            let mut v = Vec::with_capacity(piece.len() + 1 - k);
                            for_each_kmer(piece, k, strand, |c| v.push(c));
                            v
                        })
                        .collect()
                });
                for s in shards {
                    occurrences += s.len() as u64;
                    codes.extend_from_slice(&s);
                }
                lo = hi;
            }
            sequences += block.len() as u64;
            Ok(())
        })?;
    }

    let result = if batches.is_empty() {
        radix_sort_u64(&mut codes, bits);
        run_length(&codes, &mut runs);
        drop(codes);
        for &(c, n) in &runs {
            sink.add_record(Kmer(c), n)?;
        }
        Ok(runs.len() as u64)
    } else {
        let last = if codes.is_empty() {
            Ok(())
        } else {
            spill(&mut codes, &mut runs, &mut batches)
        };
        last.and_then(|()| merge_batches(&batches, cfg.verbosity, sink))
    };

    for b in &batches {
        if let Err(e) = std::fs::remove_file(b) {
            debug!(batch = %b.display(), error = %e, "could not remove count batch");
        }
    }

    Ok(CountSummary {
        method: CountMethod::Sorted {
            batches: batches.len().max(1),
        },
        sequences,
        occurrences,
        distinct: result?,
    })
}

/// Cut the sequences of `block` into pieces holding at most `max_codes`
/// k-mers each. Pieces of one sequence overlap by `k - 1` bases, so every
/// window lands in exactly one piece. Sequences shorter than `k` are skipped.
fn pieces(block: &[Vec<u8>], k: usize, max_codes: usize) -> Vec<&[u8]> {
    let mut out = Vec::new();
    for seq in block {
        let mut start = 0;
        while start + k <= seq.len() {
            let end = (start + max_codes + k - 1).min(seq.len());
            out.push(&seq[start..end]);
            start += max_codes;
        }
    }
    out
}

/// Sum the spilled batches into `sink` through a `union-sum` node.
fn merge_batches(
    batches: &[PathBuf],
    verbosity: Verbosity,
    sink: &mut dyn KmerSink,
) -> Result<u64, OpError> {
    let inputs = batches
        .iter()
        .map(|p| StoreInput::open(p).map(Input::Store))
        .collect::<Result<Vec<_>, _>>()?;
    let mut node = OperationNode::new(Operation::UnionSum, inputs)?
        .with_name("count-batch-merge")
        .with_verbosity(verbosity);
    node.initialize(true)?;

    let mut distinct = 0u64;
    while node.next_mer()? {
        sink.add_record(node.kmer(), node.count())?;
        distinct += 1;
    }
    Ok(distinct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_counter_saturates() {
        let slot = AtomicU64::new(u64::MAX - 1);
        bump(&slot);
        assert_eq!(slot.load(Ordering::Relaxed), u64::MAX);
        bump(&slot);
        assert_eq!(slot.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn pieces_overlap_by_k_minus_one() {
        let block = vec![b"ACGTACGTAC".to_vec(), b"AC".to_vec()];
        let parts = pieces(&block, 3, 4);
        // 8 windows of length 3: starts 0..4 and 4..8
        assert_eq!(parts, vec![&b"ACGTAC"[..], &b"ACGTAC"[..]]);
    }
}
