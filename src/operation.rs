//! Operation kinds and the per-round result evaluator.

use std::fmt;

use crate::encode::StrandMode;

/// One member of a round's active set: an input whose current k-mer equals
/// the round minimum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveEntry {
    /// That input's count for the k-mer.
    pub count: u64,
    /// Position of the input in the node's input list.
    pub index: usize,
}

/// What a node computes from the records that tie on a k-mer.
///
/// Threshold and arithmetic kinds carry their parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Count raw sequence inputs into a store. Rewritten to `PassThrough`
    /// during initialization.
    Count(StrandMode),
    /// Emit the single input unchanged.
    PassThrough,

    LessThan(u64),
    GreaterThan(u64),
    AtLeast(u64),
    AtMost(u64),
    EqualTo(u64),
    NotEqualTo(u64),

    Increase(u64),
    Decrease(u64),
    Multiply(u64),
    Divide(u64),
    Modulo(u64),

    Union,
    UnionMin,
    UnionMax,
    UnionSum,

    Intersect,
    IntersectMin,
    IntersectMax,
    IntersectSum,

    Difference,
    SymmetricDifference,

    /// Report k-mers that differ between inputs; never produces output.
    Compare,
    /// Accumulate the count distribution; never produces output.
    Histogram,
    /// Walk the inputs without producing anything.
    Nothing,
}

impl Operation {
    /// Build an operation from its name and optional parameter.
    ///
    /// Kinds that take a parameter return `None` without one, and the others
    /// return `None` when given one.
    pub fn from_name(name: &str, parameter: Option<u64>) -> Option<Self> {
        use Operation::*;
        let op = match (name, parameter) {
            ("count", None) => Count(StrandMode::Canonical),
            ("count-forward", None) => Count(StrandMode::Forward),
            ("count-reverse", None) => Count(StrandMode::Reverse),
            ("pass-through", None) => PassThrough,
            ("less-than", Some(p)) => LessThan(p),
            ("greater-than", Some(p)) => GreaterThan(p),
            ("at-least", Some(p)) => AtLeast(p),
            ("at-most", Some(p)) => AtMost(p),
            ("equal-to", Some(p)) => EqualTo(p),
            ("not-equal-to", Some(p)) => NotEqualTo(p),
            ("increase", Some(p)) => Increase(p),
            ("decrease", Some(p)) => Decrease(p),
            ("multiply", Some(p)) => Multiply(p),
            ("divide", Some(p)) => Divide(p),
            ("modulo", Some(p)) => Modulo(p),
            ("union", None) => Union,
            ("union-min", None) => UnionMin,
            ("union-max", None) => UnionMax,
            ("union-sum", None) => UnionSum,
            ("intersect", None) => Intersect,
            ("intersect-min", None) => IntersectMin,
            ("intersect-max", None) => IntersectMax,
            ("intersect-sum", None) => IntersectSum,
            ("difference", None) => Difference,
            ("symmetric-difference", None) => SymmetricDifference,
            ("compare", None) => Compare,
            ("histogram", None) => Histogram,
            ("nothing", None) => Nothing,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(&self) -> &'static str {
        use Operation::*;
        match self {
            Count(StrandMode::Canonical) => "count",
            Count(StrandMode::Forward) => "count-forward",
            Count(StrandMode::Reverse) => "count-reverse",
            PassThrough => "pass-through",
            LessThan(_) => "less-than",
            GreaterThan(_) => "greater-than",
            AtLeast(_) => "at-least",
            AtMost(_) => "at-most",
            EqualTo(_) => "equal-to",
            NotEqualTo(_) => "not-equal-to",
            Increase(_) => "increase",
            Decrease(_) => "decrease",
            Multiply(_) => "multiply",
            Divide(_) => "divide",
            Modulo(_) => "modulo",
            Union => "union",
            UnionMin => "union-min",
            UnionMax => "union-max",
            UnionSum => "union-sum",
            Intersect => "intersect",
            IntersectMin => "intersect-min",
            IntersectMax => "intersect-max",
            IntersectSum => "intersect-sum",
            Difference => "difference",
            SymmetricDifference => "symmetric-difference",
            Compare => "compare",
            Histogram => "histogram",
            Nothing => "nothing",
        }
    }

    pub fn parameter(&self) -> Option<u64> {
        use Operation::*;
        match *self {
            LessThan(p) | GreaterThan(p) | AtLeast(p) | AtMost(p) | EqualTo(p)
            | NotEqualTo(p) | Increase(p) | Decrease(p) | Multiply(p) | Divide(p)
            | Modulo(p) => Some(p),
            _ => None,
        }
    }

    #[inline]
    pub fn is_counting(&self) -> bool {
        matches!(self, Operation::Count(_))
    }

    /// Evaluate one round. `active` is non-empty and ordered by input index;
    /// `inputs` is the number of inputs the node was configured with.
    ///
    /// A result of 0 means "emit nothing".
    pub fn evaluate(&self, active: &[ActiveEntry], inputs: usize) -> u64 {
        use Operation::*;
        debug_assert!(!active.is_empty());
        let first = active[0];
        // Input 0's count, when input 0 takes part in this round.
        let lead = (first.index == 0).then_some(first.count);
        let full = active.len() == inputs;

        match *self {
            Count(_) => unreachable!("{} must be replaced by pass-through before merging", self),

            PassThrough => first.count,

            LessThan(p) => keep_if(lead, |c| c < p),
            GreaterThan(p) => keep_if(lead, |c| c > p),
            AtLeast(p) => keep_if(lead, |c| c >= p),
            AtMost(p) => keep_if(lead, |c| c <= p),
            EqualTo(p) => keep_if(lead, |c| c == p),
            NotEqualTo(p) => keep_if(lead, |c| c != p),

            Increase(p) => lead.map_or(0, |c| c.saturating_add(p)),
            Decrease(p) => lead.map_or(0, |c| c.saturating_sub(p)),
            Multiply(p) => lead.map_or(0, |c| c.saturating_mul(p)),
            Divide(p) => lead.and_then(|c| c.checked_div(p)).unwrap_or(0),
            Modulo(p) => lead.and_then(|c| c.checked_rem(p)).unwrap_or(0),

            Union => active.len() as u64,
            UnionMin => min_count(active),
            UnionMax => max_count(active),
            UnionSum => sum_count(active),

            Intersect if full => first.count,
            IntersectMin if full => min_count(active),
            IntersectMax if full => max_count(active),
            IntersectSum if full => sum_count(active),
            Intersect | IntersectMin | IntersectMax | IntersectSum => 0,

            Difference if active.len() == 1 && first.index == 0 => first.count,
            Difference => 0,

            SymmetricDifference if active.len() == 1 => first.count,
            SymmetricDifference => 0,

            Compare | Histogram | Nothing => 0,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parameter() {
            Some(p) => write!(f, "{} {}", self.name(), p),
            None => f.write_str(self.name()),
        }
    }
}

#[inline]
fn keep_if(lead: Option<u64>, pred: impl Fn(u64) -> bool) -> u64 {
    lead.filter(|&c| pred(c)).unwrap_or(0)
}

fn min_count(active: &[ActiveEntry]) -> u64 {
    active.iter().map(|a| a.count).min().unwrap_or(0)
}

fn max_count(active: &[ActiveEntry]) -> u64 {
    active.iter().map(|a| a.count).max().unwrap_or(0)
}

fn sum_count(active: &[ActiveEntry]) -> u64 {
    active.iter().fold(0u64, |acc, a| acc.saturating_add(a.count))
}
