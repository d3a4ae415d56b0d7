//! Output sinks: where a node's surviving `(k-mer, count)` records go.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::encode::Kmer;
use crate::store::StoreError;

/// Accumulates records in ascending k-mer order and finalizes them.
pub trait KmerSink {
    /// Get ready to accept records (create files, write headers).
    fn prepare(&mut self) -> Result<(), StoreError>;

    /// Append one record. Callers emit strictly increasing k-mers.
    fn add_record(&mut self, kmer: Kmer, count: u64) -> Result<(), StoreError>;

    /// Flush and publish everything written so far. Once this returns, the
    /// output is complete on disk; calling it again is a no-op.
    fn finish_iteration(&mut self) -> Result<(), StoreError>;

    /// Location of the persisted store, for sinks that write one.
    fn store_path(&self) -> Option<&Path> {
        None
    }

    /// K-mer length the sink is laid out for, if it is fixed.
    fn mer_size(&self) -> Option<usize> {
        None
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<(Kmer, u64)>,
    prepared: bool,
    finished: bool,
}

/// In-memory sink. Clones share the same buffer, so a handle kept by the
/// caller sees what a node wrote after the node is gone.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Rc<RefCell<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records received so far.
    pub fn records(&self) -> Vec<(Kmer, u64)> {
        self.state.borrow().records.clone()
    }

    pub fn is_prepared(&self) -> bool {
        self.state.borrow().prepared
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }
}

impl KmerSink for MemorySink {
    fn prepare(&mut self) -> Result<(), StoreError> {
        self.state.borrow_mut().prepared = true;
        Ok(())
    }

    fn add_record(&mut self, kmer: Kmer, count: u64) -> Result<(), StoreError> {
        let mut st = self.state.borrow_mut();
        if let Some(&(last, _)) = st.records.last() {
            if kmer <= last {
                return Err(StoreError::OutOfOrder {
                    prev: last.code(),
                    next: kmer.code(),
                });
            }
        }
        st.records.push((kmer, count));
        Ok(())
    }

    fn finish_iteration(&mut self) -> Result<(), StoreError> {
        self.state.borrow_mut().finished = true;
        Ok(())
    }
}
