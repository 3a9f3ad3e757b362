//! Formula semantics
//!
//! A semantics compiles a formula once into a [`FormulaFunction`] that maps
//! `(sample_size, step, sequence)` to a value. Every semantics interprets the
//! connectives over a lattice (`bool`, [`TruthValue`] or the extended reals)
//! and only differs in how atoms are evaluated, so the temporal folds are
//! shared.

mod boolean;
mod quantitative;
mod three_valued;

pub use boolean::BooleanSemantics;
pub use quantitative::QuantitativeSemantics;
pub use three_valued::ThreeValuedSemantics;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use crate::formula::{Formula, Interval, RobustnessAtom};
use crate::sequence::EvolutionSequence;

/// Compiled formula: `(sample_size, step, sequence) -> value`
pub type FormulaFunction<T> = Arc<dyn Fn(usize, usize, &EvolutionSequence) -> T + Send + Sync>;

/// Verdict of the three-valued semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TruthValue {
    True,
    False,
    Unknown,
}

impl TruthValue {
    pub fn from_bool(value: bool) -> Self {
        if value {
            TruthValue::True
        } else {
            TruthValue::False
        }
    }

    pub fn and(self, other: TruthValue) -> TruthValue {
        match (self, other) {
            (TruthValue::False, _) | (_, TruthValue::False) => TruthValue::False,
            (TruthValue::True, TruthValue::True) => TruthValue::True,
            _ => TruthValue::Unknown,
        }
    }

    pub fn or(self, other: TruthValue) -> TruthValue {
        match (self, other) {
            (TruthValue::True, _) | (_, TruthValue::True) => TruthValue::True,
            (TruthValue::False, TruthValue::False) => TruthValue::False,
            _ => TruthValue::Unknown,
        }
    }

    pub fn neg(self) -> TruthValue {
        match self {
            TruthValue::True => TruthValue::False,
            TruthValue::False => TruthValue::True,
            TruthValue::Unknown => TruthValue::Unknown,
        }
    }

    pub fn imply(self, other: TruthValue) -> TruthValue {
        self.neg().or(other)
    }
}

impl fmt::Display for TruthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TruthValue::True => "TRUE",
            TruthValue::False => "FALSE",
            TruthValue::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Lattice interpreting the propositional and temporal connectives
///
/// `TOP` and `BOTTOM` are the values of `True` and `False`; `meet` and `join`
/// interpret conjunction and disjunction and `negate` is an involution
/// swapping them. Implication is `join(negate(x), y)`.
pub trait Connectives: Send + Sync + 'static {
    type Value: Copy + PartialEq + Send + Sync + 'static;

    const TOP: Self::Value;
    const BOTTOM: Self::Value;

    fn meet(x: Self::Value, y: Self::Value) -> Self::Value;
    fn join(x: Self::Value, y: Self::Value) -> Self::Value;
    fn negate(x: Self::Value) -> Self::Value;

    /// Whether temporal operators evaluate their steps on the rayon pool.
    fn parallel(&self) -> bool;
}

/// Semantics for formulas over atoms of type `A`
pub trait Semantics<A>: Connectives {
    fn atom(&self, atom: &A) -> FormulaFunction<Self::Value>;

    fn compile(&self, formula: &Formula<A>) -> FormulaFunction<Self::Value> {
        let parallel = self.parallel();
        match formula {
            Formula::True => constant(Self::TOP),
            Formula::False => constant(Self::BOTTOM),
            Formula::Atom(atom) => self.atom(atom),
            Formula::Negation(argument) => {
                let argument = self.compile(argument);
                Arc::new(move |sample_size, step, seq| Self::negate(argument(sample_size, step, seq)))
            }
            Formula::Conjunction(left, right) => binary(
                self.compile(left),
                self.compile(right),
                Self::BOTTOM,
                Self::meet,
            ),
            Formula::Disjunction(left, right) => {
                binary(self.compile(left), self.compile(right), Self::TOP, Self::join)
            }
            Formula::Implication(left, right) => {
                let antecedent = self.compile(left);
                let negated: FormulaFunction<Self::Value> =
                    Arc::new(move |sample_size, step, seq| {
                        Self::negate(antecedent(sample_size, step, seq))
                    });
                binary(negated, self.compile(right), Self::TOP, Self::join)
            }
            Formula::Always(argument, interval) => {
                fold_interval::<Self>(self.compile(argument), *interval, parallel, Self::TOP, Self::BOTTOM, Self::meet)
            }
            Formula::Eventually(argument, interval) => {
                fold_interval::<Self>(self.compile(argument), *interval, parallel, Self::BOTTOM, Self::TOP, Self::join)
            }
            Formula::Until(left, interval, right) => {
                until::<Self>(self.compile(left), *interval, self.compile(right), parallel)
            }
        }
    }
}

fn constant<T: Copy + Send + Sync + 'static>(value: T) -> FormulaFunction<T> {
    Arc::new(move |_, _, _| value)
}

/// Binary connective; the right side is skipped when the left one is `absorbing`.
fn binary<T, F>(left: FormulaFunction<T>, right: FormulaFunction<T>, absorbing: T, op: F) -> FormulaFunction<T>
where
    T: Copy + PartialEq + Send + Sync + 'static,
    F: Fn(T, T) -> T + Send + Sync + 'static,
{
    Arc::new(move |sample_size, step, seq| {
        let l = left(sample_size, step, seq);
        if l == absorbing {
            return l;
        }
        op(l, right(sample_size, step, seq))
    })
}

/// Fold `op` over the values of `argument` at steps `step + from ..= step + to`.
fn fold_interval<C: Connectives + ?Sized>(
    argument: FormulaFunction<C::Value>,
    interval: Interval,
    parallel: bool,
    identity: C::Value,
    absorbing: C::Value,
    op: fn(C::Value, C::Value) -> C::Value,
) -> FormulaFunction<C::Value> {
    let (from, to) = (interval.start(), interval.end());
    Arc::new(move |sample_size, step, seq| {
        seq.generate_up_to(step + to);
        let steps = step + from..step + to + 1;
        if parallel {
            steps
                .into_par_iter()
                .map(|i| argument(sample_size, i, seq))
                .reduce(|| identity, op)
        } else {
            let mut acc = identity;
            for i in steps {
                acc = op(acc, argument(sample_size, i, seq));
                if acc == absorbing {
                    break;
                }
            }
            acc
        }
    })
}

/// `join` over `i` in `step + from .. step + to` of
/// `meet(right(i), meet over j in step + from .. i of left(j))`.
fn until<C: Connectives + ?Sized>(
    left: FormulaFunction<C::Value>,
    interval: Interval,
    right: FormulaFunction<C::Value>,
    parallel: bool,
) -> FormulaFunction<C::Value> {
    let (from, to) = (interval.start(), interval.end());
    Arc::new(move |sample_size, step, seq| {
        let steps = step + from..step + to;
        seq.generate_up_to(steps.end - 1);
        if parallel {
            let (lefts, rights) = rayon::join(
                || evaluate_steps(&left, sample_size, steps.clone(), seq),
                || evaluate_steps(&right, sample_size, steps.clone(), seq),
            );
            scan_until::<C>(steps.len(), |k| lefts[k], |k| rights[k])
        } else {
            let start = steps.start;
            scan_until::<C>(
                steps.len(),
                |k| left(sample_size, start + k, seq),
                |k| right(sample_size, start + k, seq),
            )
        }
    })
}

fn evaluate_steps<T: Send>(
    function: &FormulaFunction<T>,
    sample_size: usize,
    steps: Range<usize>,
    seq: &EvolutionSequence,
) -> Vec<T> {
    steps
        .into_par_iter()
        .map(|i| function(sample_size, i, seq))
        .collect()
}

fn scan_until<C: Connectives + ?Sized>(
    len: usize,
    left: impl Fn(usize) -> C::Value,
    right: impl Fn(usize) -> C::Value,
) -> C::Value {
    let mut result = C::BOTTOM;
    let mut prefix = C::TOP;
    for k in 0..len {
        result = C::join(result, C::meet(right(k), prefix));
        if result == C::TOP {
            break;
        }
        prefix = C::meet(prefix, left(k));
        if prefix == C::BOTTOM {
            break;
        }
    }
    result
}

/// Sequence perturbed at `step` by the atom's perturbation, on the atom's own stream.
fn perturbed_at(atom: &RobustnessAtom, sample_size: usize, step: usize, seq: &EvolutionSequence) -> EvolutionSequence {
    seq.apply_salted(&atom.perturbation, step, sample_size, atom.id())
}
