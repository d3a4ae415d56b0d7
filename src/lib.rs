//! Count algebra over sorted k-mer stores.
//!
//! The crate merges any number of sorted `(k-mer, count)` streams and
//! evaluates set and arithmetic operations over the records that tie on each
//! k-mer:
//! - [`OperationNode`] drives the multi-way merge; nodes nest into trees.
//! - [`Operation`] is the closed set of kinds (filters, arithmetic, union /
//!   intersect variants, difference, compare, histogram, counting).
//! - Counting nodes turn raw FASTA/FASTQ into a `.kcs` store during
//!   [`OperationNode::initialize`] and then read it back as a pass-through.
//! - [`StoreWriter`] / [`StoreReader`] handle the on-disk format (see [`io`]).
//!
//! Arithmetic never wraps: overflow saturates at `u64::MAX`, underflow stops
//! at 0, and division or modulo by zero yields 0.

mod count;
pub mod encode;
mod histogram;
mod input;
pub mod io;
mod node;
mod operation;
mod radix;
mod sink;
mod store;

pub use count::{CountConfig, CountMethod, CountSummary, SequenceSource, count_into};
pub use encode::{Kmer, StrandMode, canonical, encode_kmer, revcomp};
pub use histogram::Histogram;
pub use input::{Input, MemoryInput};
pub use io::{Compression, StoreOptions, StoreWriter};
pub use node::{NodeState, OpError, OperationNode, Verbosity};
pub use operation::{ActiveEntry, Operation};
pub use sink::{KmerSink, MemorySink};
pub use store::{StoreError, StoreInput, StoreReader};
