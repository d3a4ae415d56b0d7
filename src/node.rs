//! OperationNode: the multi-way sorted merge and its lifecycle.
//!
//! A node owns its inputs, pulls them in lock-step, and on each round
//! evaluates its [`Operation`] over every input that holds the smallest
//! current k-mer (the active set). Nodes nest: a node can be the input of
//! another node, which makes a composition tree that is driven from the root
//! by repeated [`OperationNode::next_mer`] calls.

use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::count::{self, CountConfig, SequenceSource};
use crate::encode::Kmer;
use crate::histogram::Histogram;
use crate::input::Input;
use crate::operation::{ActiveEntry, Operation};
use crate::sink::KmerSink;
use crate::store::{StoreError, StoreInput};

#[derive(Debug, Error)]
/// Errors returned while building or driving an operation tree.
pub enum OpError {
    /// Store read/write failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// I/O error on a print or report stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Sequence file could not be parsed.
    #[error("sequence parse error: {0}")]
    Parse(#[from] needletail::errors::ParseError),
    /// Worker pool for counting could not be built.
    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    /// The tree is wired up in a way that cannot run.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Inputs of one node disagree on the k-mer length.
    #[error("input '{input}' has k={found}, expected k={expected}")]
    MerSizeMismatch {
        input: String,
        expected: usize,
        found: usize,
    },
    /// `next_mer` before `initialize`.
    #[error("node '{0}' was not initialized")]
    NotInitialized(String),
    /// Random access on an input that only streams.
    #[error("input '{0}' is sequential-only and cannot be searched")]
    SequentialOnly(String),
}

/// How much a node reports about its own work through `tracing`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    #[default]
    Quiet,
    /// Tree construction and counting substitution.
    Construction,
    /// One event per merge round.
    Details,
    /// Input state before every round.
    Everything,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Built, not yet initialized.
    Pending,
    /// Producing records.
    Active,
    /// All inputs consumed, or an input failed mid-round; terminal.
    Exhausted,
}

/// One node of an operation tree.
pub struct OperationNode {
    name: String,
    op: Operation,
    inputs: Vec<Input>,
    output: Option<Box<dyn KmerSink>>,
    printer: Option<Box<dyn Write>>,
    report: Box<dyn Write>,
    histogram: Option<Histogram>,
    count_config: Option<CountConfig>,
    verbosity: Verbosity,
    state: NodeState,

    mer_size: usize,
    kmer: Kmer,
    count: u64,
    active: Vec<ActiveEntry>,
}

impl OperationNode {
    /// Build a node over `inputs`.
    ///
    /// Counting operations take only [`Input::Sequence`] inputs; every other
    /// operation takes only streams. Pass-through takes exactly one input.
    pub fn new(op: Operation, inputs: Vec<Input>) -> Result<Self, OpError> {
        if inputs.is_empty() {
            return Err(OpError::Config(format!("{op} needs at least one input")));
        }
        let raw = inputs
            .iter()
            .filter(|i| matches!(i, Input::Sequence(_)))
            .count();
        if op.is_counting() && raw != inputs.len() {
            return Err(OpError::Config(format!(
                "{op} accepts only raw sequence inputs"
            )));
        }
        if !op.is_counting() && raw > 0 {
            return Err(OpError::Config(format!(
                "{op} cannot read raw sequence; count it first"
            )));
        }
        if op == Operation::PassThrough && inputs.len() != 1 {
            return Err(OpError::Config(format!(
                "pass-through needs exactly one input, got {}",
                inputs.len()
            )));
        }

        let n = inputs.len();
        Ok(Self {
            name: op.name().to_string(),
            op,
            inputs,
            output: None,
            printer: None,
            report: Box::new(std::io::stdout()),
            histogram: (op == Operation::Histogram).then(Histogram::new),
            count_config: None,
            verbosity: Verbosity::Quiet,
            state: NodeState::Pending,
            mer_size: 0,
            kmer: Kmer::default(),
            count: 0,
            active: Vec::with_capacity(n),
        })
    }

    /// Convenience constructor for a counting node over raw sequence.
    pub fn counting(
        op: Operation,
        sources: Vec<SequenceSource>,
        config: CountConfig,
        output: Box<dyn KmerSink>,
    ) -> Result<Self, OpError> {
        let inputs = sources.into_iter().map(Input::Sequence).collect();
        Ok(Self::new(op, inputs)?
            .with_count_config(config)
            .with_output(output))
    }

    /// Label used in logs and error messages.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// Persist surviving records.
    pub fn with_output(mut self, sink: Box<dyn KmerSink>) -> Self {
        self.output = Some(sink);
        self
    }
    /// Print `kmer<TAB>count` for every surviving record.
    pub fn with_printer(mut self, w: Box<dyn Write>) -> Self {
        self.printer = Some(w);
        self
    }
    /// Destination of compare lines and the histogram (default stdout).
    pub fn with_report(mut self, w: Box<dyn Write>) -> Self {
        self.report = w;
        self
    }
    pub fn with_verbosity(mut self, v: Verbosity) -> Self {
        self.verbosity = v;
        self
    }
    /// Counting parameters; required for counting operations.
    pub fn with_count_config(mut self, cfg: CountConfig) -> Self {
        self.count_config = Some(cfg);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// K-mer length of the streams, once known.
    pub fn mer_size(&self) -> Option<usize> {
        if self.mer_size > 0 {
            Some(self.mer_size)
        } else if let Some(cfg) = &self.count_config {
            Some(cfg.mer_size())
        } else {
            self.inputs.iter().find_map(Input::mer_size)
        }
    }

    /// The current round's k-mer.
    #[inline]
    pub fn kmer(&self) -> Kmer {
        self.kmer
    }

    /// The current round's result (0 = not emitted).
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state == NodeState::Active
    }

    /// The current round's active set, ordered by input index.
    pub fn active(&self) -> &[ActiveEntry] {
        &self.active
    }

    /// Counting parameters in effect, with the node's verbosity folded in
    /// once counting has run.
    pub fn count_config(&self) -> Option<&CountConfig> {
        self.count_config.as_ref()
    }

    pub fn histogram(&self) -> Option<&Histogram> {
        self.histogram.as_ref()
    }

    /// Prepare outputs, initialize children leaves-first, and run any
    /// counting. Returns `false` when this node will produce no records,
    /// which is the case for a counting node at the root of the tree.
    pub fn initialize(&mut self, is_root: bool) -> Result<bool, OpError> {
        match self.state {
            NodeState::Pending => {}
            NodeState::Active => return Ok(true),
            NodeState::Exhausted => return Ok(false),
        }
        if self.verbosity >= Verbosity::Construction {
            debug!(node = %self.name, op = %self.op, inputs = self.inputs.len(), "initialize");
        }

        if !self.op.is_counting() {
            if let Some(out) = self.output.as_mut() {
                out.prepare()?;
            }
        }

        for input in &mut self.inputs {
            input.initialize()?;
        }

        if let Operation::Count(_) = self.op {
            return self.count_and_substitute(is_root);
        }

        self.start()?;
        Ok(true)
    }

    /// Check input agreement and arm the first round: every input counts as
    /// active in the "previous" round so all of them get advanced once.
    fn start(&mut self) -> Result<(), OpError> {
        let mut expected: Option<usize> = None;
        for input in &self.inputs {
            let Some(k) = input.mer_size() else { continue };
            match expected {
                None => expected = Some(k),
                Some(e) if e != k => {
                    return Err(OpError::MerSizeMismatch {
                        input: input.name().to_string(),
                        expected: e,
                        found: k,
                    });
                }
                Some(_) => {}
            }
        }
        self.mer_size = expected.unwrap_or(0);

        self.active.clear();
        self.active
            .extend((0..self.inputs.len()).map(|index| ActiveEntry { count: 0, index }));
        self.state = NodeState::Active;
        Ok(())
    }

    fn count_and_substitute(&mut self, is_root: bool) -> Result<bool, OpError> {
        let Operation::Count(strand) = self.op else {
            unreachable!("count_and_substitute on {}", self.op)
        };
        let verbosity = self.verbosity;
        let cfg = self
            .count_config
            .take()
            .map(|c| {
                let v = c.current_verbosity().max(verbosity);
                c.verbosity(v)
            })
            .ok_or_else(|| {
                OpError::Config(format!("{} '{}' has no count configuration", self.op, self.name))
            })?;
        self.count_config = Some(cfg.clone());
        let mut sink = self.output.take().ok_or_else(|| {
            OpError::Config(format!("{} '{}' has no output store", self.op, self.name))
        })?;
        let Some(path) = sink.store_path().map(Path::to_path_buf) else {
            return Err(OpError::Config(format!(
                "{} '{}' must write to a store that can be reopened",
                self.op, self.name
            )));
        };

        let sources: Vec<SequenceSource> = std::mem::take(&mut self.inputs)
            .into_iter()
            .filter_map(|i| match i {
                Input::Sequence(s) => Some(s),
                _ => None,
            })
            .collect();

        count::count_into(&sources, strand, &cfg, sink.as_mut())?;
        drop(sink);
        drop(sources);

        if is_root {
            // Nobody reads a root's stream; the store on disk is the result.
            self.state = NodeState::Exhausted;
            return Ok(false);
        }

        if self.verbosity >= Verbosity::Construction {
            info!(
                node = %self.name,
                from = %self.op,
                to = %Operation::PassThrough,
                store = %path.display(),
                "converting counted node"
            );
        }

        self.op = Operation::PassThrough;
        self.inputs = vec![Input::Store(StoreInput::open(&path)?)];
        self.start()?;
        Ok(true)
    }

    /// Pull one merged record. Returns `false` once every input is exhausted;
    /// after that it keeps returning `false`.
    pub fn next_mer(&mut self) -> Result<bool, OpError> {
        match self.state {
            NodeState::Pending => return Err(OpError::NotInitialized(self.name.clone())),
            NodeState::Exhausted => return Ok(false),
            NodeState::Active => {}
        }
        assert!(
            !self.op.is_counting(),
            "{} '{}' reached the merge without being counted",
            self.op,
            self.name
        );

        if self.verbosity >= Verbosity::Everything {
            for input in &self.inputs {
                trace!(
                    node = %self.name,
                    input = input.name(),
                    kmer = %input.kmer().display(self.mer_size),
                    count = input.count(),
                    valid = input.is_valid(),
                    "input state"
                );
            }
        }

        let mut moved = std::mem::take(&mut self.active);
        for a in &moved {
            if let Err(e) = self.inputs[a.index].advance() {
                // Inputs are out of step now; the node cannot continue.
                self.state = NodeState::Exhausted;
                return Err(e);
            }
        }
        moved.clear();
        self.active = moved;

        for (index, input) in self.inputs.iter().enumerate() {
            if !input.is_valid() {
                continue;
            }
            let k = input.kmer();
            if self.active.is_empty() || k < self.kmer {
                self.active.clear();
                self.kmer = k;
            } else if k != self.kmer {
                continue;
            }
            self.active.push(ActiveEntry {
                count: input.count(),
                index,
            });
        }

        if self.active.is_empty() {
            self.finish()?;
            return Ok(false);
        }

        if let Some(h) = self.histogram.as_mut() {
            h.add(self.active[0].count);
        }

        self.count = self.op.evaluate(&self.active, self.inputs.len());

        if self.op == Operation::Compare {
            self.report_difference()?;
        }

        if self.count > 0 {
            if let Some(out) = self.output.as_mut() {
                out.add_record(self.kmer, self.count)?;
            }
            if let Some(p) = self.printer.as_mut() {
                writeln!(
                    p,
                    "{}\t{}",
                    self.kmer.display(self.mer_size),
                    self.active[0].count
                )?;
            }
        }

        if self.verbosity >= Verbosity::Details {
            debug!(
                node = %self.name,
                op = %self.op,
                kmer = %self.kmer.display(self.mer_size),
                active = self.active.len(),
                count = self.count,
                "round"
            );
        }
        Ok(true)
    }

    fn report_difference(&mut self) -> std::io::Result<()> {
        let kmer = self.kmer.display(self.mer_size);
        match self.active.as_slice() {
            [only] => writeln!(self.report, "kmer {kmer} only in input {}", only.index),
            [a, b] if self.inputs.len() == 2 && a.count != b.count => writeln!(
                self.report,
                "kmer {kmer} has value {} in input 1 != value {} in input 2",
                a.count, b.count
            ),
            _ => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<(), OpError> {
        self.state = NodeState::Exhausted;
        if self.verbosity >= Verbosity::Details {
            debug!(node = %self.name, "inputs exhausted");
        }

        if let Some(h) = &self.histogram {
            h.write_to(&mut self.report)?;
        }
        self.report.flush()?;
        if let Some(p) = self.printer.as_mut() {
            p.flush()?;
        }
        if let Some(mut out) = self.output.take() {
            out.finish_iteration()?;
        }
        Ok(())
    }

    /// Initialize as root and drain every record. Returns the number of rounds.
    pub fn run(&mut self) -> Result<u64, OpError> {
        if !self.initialize(true)? {
            return Ok(0);
        }
        let mut rounds = 0u64;
        while self.next_mer()? {
            rounds += 1;
        }
        Ok(rounds)
    }
}

impl Drop for OperationNode {
    fn drop(&mut self) {
        if self.state == NodeState::Pending {
            return;
        }
        if let Some(mut out) = self.output.take() {
            if let Err(e) = out.finish_iteration() {
                warn!(node = %self.name, error = %e, "output finalize on drop failed");
            }
        }
    }
}
