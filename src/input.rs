//! Merge inputs: everything a node can pull sorted `(k-mer, count)` records from.

use crate::count::SequenceSource;
use crate::encode::Kmer;
use crate::node::{OpError, OperationNode};
use crate::store::StoreInput;

/// One input of an [`OperationNode`].
///
/// Every stream variant must yield strictly increasing k-mers.
pub enum Input {
    /// A finished count store, read sequentially.
    Store(StoreInput),
    /// Records held in memory.
    Memory(MemoryInput),
    /// Another node. Only rounds with a non-zero result are exposed.
    Node(Box<OperationNode>),
    /// Raw sequence, consumed only by counting operations.
    Sequence(SequenceSource),
}

impl Input {
    pub fn name(&self) -> &str {
        match self {
            Input::Store(s) => s.name(),
            Input::Memory(m) => &m.name,
            Input::Node(n) => n.name(),
            Input::Sequence(s) => s.name(),
        }
    }

    /// K-mer length of the records, when known.
    pub fn mer_size(&self) -> Option<usize> {
        match self {
            Input::Store(s) => Some(s.reader().mer_size()),
            Input::Memory(m) => Some(m.mer_size),
            Input::Node(n) => n.mer_size(),
            Input::Sequence(_) => None,
        }
    }

    pub(crate) fn initialize(&mut self) -> Result<(), OpError> {
        match self {
            Input::Node(n) => n.initialize(false).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Step to the next record; `false` once exhausted.
    pub fn advance(&mut self) -> Result<bool, OpError> {
        match self {
            Input::Store(s) => Ok(s.advance()?),
            Input::Memory(m) => Ok(m.advance()),
            Input::Node(n) => {
                while n.next_mer()? {
                    if n.count() > 0 {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Input::Sequence(s) => Err(OpError::Config(format!(
                "raw sequence input '{}' can only feed a counting operation",
                s.name()
            ))),
        }
    }

    #[inline]
    pub fn kmer(&self) -> Kmer {
        match self {
            Input::Store(s) => s.kmer(),
            Input::Memory(m) => m.kmer(),
            Input::Node(n) => n.kmer(),
            Input::Sequence(_) => Kmer::default(),
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        match self {
            Input::Store(s) => s.count(),
            Input::Memory(m) => m.count(),
            Input::Node(n) => n.count(),
            Input::Sequence(_) => 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        match self {
            Input::Store(s) => s.is_valid(),
            Input::Memory(m) => m.valid,
            Input::Node(n) => n.is_valid(),
            Input::Sequence(_) => false,
        }
    }

    /// Random access to the count of `kmer`. Node inputs only exist as a
    /// stream and fail with [`OpError::SequentialOnly`].
    pub fn lookup(&self, kmer: Kmer) -> Result<Option<u64>, OpError> {
        match self {
            Input::Store(s) => Ok(s.reader().lookup(kmer)?),
            Input::Memory(m) => Ok(m.lookup(kmer)),
            Input::Node(_) | Input::Sequence(_) => {
                Err(OpError::SequentialOnly(self.name().to_string()))
            }
        }
    }
}

impl From<StoreInput> for Input {
    fn from(s: StoreInput) -> Self {
        Input::Store(s)
    }
}

impl From<MemoryInput> for Input {
    fn from(m: MemoryInput) -> Self {
        Input::Memory(m)
    }
}

impl From<OperationNode> for Input {
    fn from(n: OperationNode) -> Self {
        Input::Node(Box::new(n))
    }
}

impl From<SequenceSource> for Input {
    fn from(s: SequenceSource) -> Self {
        Input::Sequence(s)
    }
}

/// Sorted records held in memory.
pub struct MemoryInput {
    name: String,
    mer_size: usize,
    records: Vec<(Kmer, u64)>,
    pos: usize,
    valid: bool,
}

impl MemoryInput {
    /// `records` must be strictly increasing by k-mer.
    pub fn new(name: impl Into<String>, mer_size: usize, records: Vec<(Kmer, u64)>) -> Self {
        Self {
            name: name.into(),
            mer_size,
            records,
            pos: 0,
            valid: false,
        }
    }

    fn advance(&mut self) -> bool {
        self.valid = self.pos < self.records.len();
        if self.valid {
            self.pos += 1;
        }
        self.valid
    }

    fn current(&self) -> Option<&(Kmer, u64)> {
        if self.valid {
            self.records.get(self.pos - 1)
        } else {
            None
        }
    }

    fn kmer(&self) -> Kmer {
        self.current().map(|r| r.0).unwrap_or_default()
    }

    fn count(&self) -> u64 {
        self.current().map_or(0, |r| r.1)
    }

    fn lookup(&self, kmer: Kmer) -> Option<u64> {
        self.records
            .binary_search_by_key(&kmer, |r| r.0)
            .ok()
            .map(|i| self.records[i].1)
    }
}
