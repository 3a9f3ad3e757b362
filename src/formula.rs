//! Bounded temporal formulas over evolution sequences
//!
//! Robustness formulas (RobTL) and distribution formulas (DisTL) share one
//! tree shape and differ only in their atoms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::distance::DistanceExpression;
use crate::ds::{DataState, DataStateExpression, DataStateFunction};
use crate::perturbation::Perturbation;
use crate::semantics::{
    BooleanSemantics, FormulaFunction, QuantitativeSemantics, Semantics, ThreeValuedSemantics,
    TruthValue,
};
use crate::sequence::EvolutionSequence;
use crate::SpearError;

/// Comparison between a computed value and a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationOperator {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl RelationOperator {
    pub fn eval(self, value: f64, threshold: f64) -> bool {
        match self {
            RelationOperator::Lt => value < threshold,
            RelationOperator::Le => value <= threshold,
            RelationOperator::Eq => value == threshold,
            RelationOperator::Ge => value >= threshold,
            RelationOperator::Gt => value > threshold,
        }
    }
}

impl fmt::Display for RelationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            RelationOperator::Lt => "<",
            RelationOperator::Le => "<=",
            RelationOperator::Eq => "==",
            RelationOperator::Ge => ">=",
            RelationOperator::Gt => ">",
        };
        f.write_str(symbol)
    }
}

/// Bounds `from < to` of a temporal operator, relative to the current step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    from: usize,
    to: usize,
}

impl Interval {
    pub fn new(from: usize, to: usize) -> Result<Self, SpearError> {
        if from < to {
            Ok(Self { from, to })
        } else {
            Err(SpearError::InvalidInterval { from, to })
        }
    }

    pub fn start(&self) -> usize {
        self.from
    }

    pub fn end(&self) -> usize {
        self.to
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Penalty depending on the step as well as on the data state
pub type TimedPenalty = Arc<dyn Fn(usize, &DataState) -> f64 + Send + Sync>;

#[derive(Clone)]
pub enum Penalty {
    Expression(DataStateExpression),
    Timed(TimedPenalty),
}

impl Penalty {
    /// Penalty expression in force at `step`.
    pub fn at(&self, step: usize) -> DataStateExpression {
        match self {
            Penalty::Expression(rho) => Arc::clone(rho),
            Penalty::Timed(penalty) => {
                let penalty = Arc::clone(penalty);
                Arc::new(move |ds: &DataState| penalty(step, ds))
            }
        }
    }
}

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(1);

fn next_atom_id() -> u64 {
    NEXT_ATOM_ID.fetch_add(1, Ordering::Relaxed)
}

/// RobTL atom: `distance(seq, seq perturbed now) relop threshold`
///
/// Each atom samples its perturbed sequences from a random stream keyed by
/// an id taken at construction, so distinct atoms draw independently while
/// clones of one atom agree.
#[derive(Clone)]
pub struct RobustnessAtom {
    pub perturbation: Perturbation,
    pub distance: Arc<dyn DistanceExpression>,
    pub relop: RelationOperator,
    pub threshold: f64,
    id: u64,
}

impl RobustnessAtom {
    pub fn new(
        perturbation: Perturbation,
        distance: impl DistanceExpression + 'static,
        relop: RelationOperator,
        threshold: f64,
    ) -> Self {
        Self {
            perturbation,
            distance: Arc::new(distance),
            relop,
            threshold,
            id: next_atom_id(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for RobustnessAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Atomic({:?}, d {} {})",
            self.perturbation, self.relop, self.threshold
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisTLKind {
    /// The ensemble reaches the distribution: `threshold - at_least_distance`.
    Target,
    /// The ensemble stays clear of the distribution: `at_most_distance - threshold`.
    Brink,
}

/// DisTL atom comparing an ensemble with a target distribution
#[derive(Clone)]
pub struct DisTLAtom {
    pub kind: DisTLKind,
    pub distribution: DataStateFunction,
    pub penalty: Penalty,
    pub threshold: f64,
    id: u64,
}

impl DisTLAtom {
    pub fn new(kind: DisTLKind, distribution: DataStateFunction, penalty: Penalty, threshold: f64) -> Self {
        Self {
            kind,
            distribution,
            penalty,
            threshold,
            id: next_atom_id(),
        }
    }

    pub fn target(distribution: DataStateFunction, penalty: Penalty, threshold: f64) -> Self {
        Self::new(DisTLKind::Target, distribution, penalty, threshold)
    }

    pub fn brink(distribution: DataStateFunction, penalty: Penalty, threshold: f64) -> Self {
        Self::new(DisTLKind::Brink, distribution, penalty, threshold)
    }

    /// Key of the stream the target distribution is sampled from.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for DisTLAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.threshold)
    }
}

#[derive(Debug, Clone)]
pub enum Formula<A> {
    True,
    False,
    Atom(A),
    Negation(Arc<Formula<A>>),
    Conjunction(Arc<Formula<A>>, Arc<Formula<A>>),
    Disjunction(Arc<Formula<A>>, Arc<Formula<A>>),
    Implication(Arc<Formula<A>>, Arc<Formula<A>>),
    Always(Arc<Formula<A>>, Interval),
    Eventually(Arc<Formula<A>>, Interval),
    Until(Arc<Formula<A>>, Interval, Arc<Formula<A>>),
}

pub type RobustnessFormula = Formula<RobustnessAtom>;
pub type DisTLFormula = Formula<DisTLAtom>;

impl<A> Formula<A> {
    pub fn atom(atom: A) -> Self {
        Formula::Atom(atom)
    }

    pub fn negation(argument: Formula<A>) -> Self {
        Formula::Negation(Arc::new(argument))
    }

    pub fn conjunction(left: Formula<A>, right: Formula<A>) -> Self {
        Formula::Conjunction(Arc::new(left), Arc::new(right))
    }

    pub fn disjunction(left: Formula<A>, right: Formula<A>) -> Self {
        Formula::Disjunction(Arc::new(left), Arc::new(right))
    }

    pub fn implication(left: Formula<A>, right: Formula<A>) -> Self {
        Formula::Implication(Arc::new(left), Arc::new(right))
    }

    pub fn always(argument: Formula<A>, from: usize, to: usize) -> Result<Self, SpearError> {
        Ok(Formula::Always(Arc::new(argument), Interval::new(from, to)?))
    }

    pub fn eventually(argument: Formula<A>, from: usize, to: usize) -> Result<Self, SpearError> {
        Ok(Formula::Eventually(Arc::new(argument), Interval::new(from, to)?))
    }

    pub fn until(
        left: Formula<A>,
        from: usize,
        to: usize,
        right: Formula<A>,
    ) -> Result<Self, SpearError> {
        Ok(Formula::Until(
            Arc::new(left),
            Interval::new(from, to)?,
            Arc::new(right),
        ))
    }
}

impl<A> Formula<A> {
    /// Values under `semantics` at steps `from, from + by, ...` below `to`.
    pub fn eval_range_with<S: Semantics<A>>(
        &self,
        semantics: &S,
        sample_size: usize,
        from: usize,
        to: usize,
        by: usize,
        sequence: &EvolutionSequence,
    ) -> Result<Vec<S::Value>, SpearError> {
        if by == 0 {
            return Err(SpearError::ZeroStride);
        }
        let function = semantics.compile(self);
        Ok((from..to)
            .step_by(by)
            .map(|step| function(sample_size, step, sequence))
            .collect())
    }
}

impl RobustnessFormula {
    /// Boolean verdict at `step`, evaluating temporal operators in parallel.
    pub fn eval(&self, sample_size: usize, step: usize, sequence: &EvolutionSequence) -> bool {
        self.eval_with(sample_size, step, sequence, true)
    }

    pub fn eval_with(
        &self,
        sample_size: usize,
        step: usize,
        sequence: &EvolutionSequence,
        parallel: bool,
    ) -> bool {
        BooleanSemantics::new(parallel).compile(self)(sample_size, step, sequence)
    }

    /// Boolean verdicts at steps `from, from + by, ...` below `to`.
    pub fn eval_range(
        &self,
        sample_size: usize,
        from: usize,
        to: usize,
        by: usize,
        sequence: &EvolutionSequence,
    ) -> Result<Vec<bool>, SpearError> {
        self.eval_range_with(&BooleanSemantics::new(true), sample_size, from, to, by, sequence)
    }

    /// Three-valued evaluator with `m` bootstrap replications at z-score `z`.
    pub fn three_valued(&self, m: usize, z: f64) -> FormulaFunction<TruthValue> {
        ThreeValuedSemantics::new(m, z, true).compile(self)
    }

    /// Robustness degree evaluator.
    pub fn quantitative(&self) -> FormulaFunction<f64> {
        QuantitativeSemantics::new(true).compile(self)
    }
}

impl DisTLFormula {
    /// Robustness degree at `step`, evaluating temporal operators in parallel.
    pub fn eval(&self, sample_size: usize, step: usize, sequence: &EvolutionSequence) -> f64 {
        self.eval_with(sample_size, step, sequence, true)
    }

    pub fn eval_with(
        &self,
        sample_size: usize,
        step: usize,
        sequence: &EvolutionSequence,
        parallel: bool,
    ) -> f64 {
        QuantitativeSemantics::new(parallel).compile(self)(sample_size, step, sequence)
    }

    /// Robustness degrees at steps `from, from + by, ...` below `to`.
    pub fn eval_range(
        &self,
        sample_size: usize,
        from: usize,
        to: usize,
        by: usize,
        sequence: &EvolutionSequence,
    ) -> Result<Vec<f64>, SpearError> {
        self.eval_range_with(&QuantitativeSemantics::new(true), sample_size, from, to, by, sequence)
    }
}
