//! Distance expressions between evolution sequences
//!
//! A distance expression measures, at a given step, how far apart two
//! evolution sequences are. Atomic distances compare the penalty
//! distributions of the two ensembles at that step; the remaining variants
//! combine other expressions pointwise or over a window of steps.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::trace;

use crate::ds::DataStateExpression;
use crate::formula::RelationOperator;
use crate::sample::{Direction, DistanceEstimate};
use crate::sequence::EvolutionSequence;
use crate::SpearError;

const BOOTSTRAP_SALT: u64 = 0x626f_6f74;

pub trait DistanceExpression: Send + Sync {
    /// Distance between `seq1` and `seq2` at `step`.
    fn compute(&self, step: usize, seq1: &EvolutionSequence, seq2: &EvolutionSequence) -> f64;

    /// Distance at `step` with a confidence interval from `m` bootstrap
    /// replications at z-score `z`.
    fn compute_interval(
        &self,
        step: usize,
        seq1: &EvolutionSequence,
        seq2: &EvolutionSequence,
        m: usize,
        z: f64,
    ) -> DistanceEstimate;

    /// Distances at every step of `from..=to`.
    fn compute_range(
        &self,
        from: usize,
        to: usize,
        seq1: &EvolutionSequence,
        seq2: &EvolutionSequence,
    ) -> Vec<f64> {
        (from..=to).map(|step| self.compute(step, seq1, seq2)).collect()
    }
}

#[derive(Clone)]
pub enum Distance {
    /// Wasserstein distance between the distributions of `rho`.
    Atomic {
        rho: DataStateExpression,
        direction: Direction,
    },
    Max(Arc<Distance>, Arc<Distance>),
    Min(Arc<Distance>, Arc<Distance>),
    LinearCombination(Vec<(f64, Distance)>),
    /// Largest value over steps `step + from .. step + to`.
    MaxInterval {
        expr: Arc<Distance>,
        from: usize,
        to: usize,
    },
    /// Smallest value over steps `step + from .. step + to`.
    MinInterval {
        expr: Arc<Distance>,
        from: usize,
        to: usize,
    },
    /// `0` when `expr relop threshold` holds, `1` otherwise.
    Threshold {
        expr: Arc<Distance>,
        relop: RelationOperator,
        threshold: f64,
    },
    Until {
        left: Arc<Distance>,
        from: usize,
        to: usize,
        right: Arc<Distance>,
    },
}

fn check_interval(from: usize, to: usize) -> Result<(), SpearError> {
    if from < to {
        Ok(())
    } else {
        Err(SpearError::InvalidInterval { from, to })
    }
}

impl Distance {
    pub fn atomic(rho: DataStateExpression, direction: Direction) -> Self {
        Distance::Atomic { rho, direction }
    }

    /// "At most" distance: how far the second sequence exceeds the first.
    pub fn leq(rho: DataStateExpression) -> Self {
        Self::atomic(rho, Direction::Leq)
    }

    /// "At least" distance: how far the first sequence exceeds the second.
    pub fn geq(rho: DataStateExpression) -> Self {
        Self::atomic(rho, Direction::Geq)
    }

    pub fn max(left: Distance, right: Distance) -> Self {
        Distance::Max(Arc::new(left), Arc::new(right))
    }

    pub fn min(left: Distance, right: Distance) -> Self {
        Distance::Min(Arc::new(left), Arc::new(right))
    }

    pub fn linear_combination(weights: Vec<f64>, exprs: Vec<Distance>) -> Result<Self, SpearError> {
        if weights.len() != exprs.len() {
            return Err(SpearError::LengthMismatch {
                context: "linear combination weights",
                expected: exprs.len(),
                got: weights.len(),
            });
        }
        Ok(Distance::LinearCombination(
            weights.into_iter().zip(exprs).collect(),
        ))
    }

    pub fn max_interval(expr: Distance, from: usize, to: usize) -> Result<Self, SpearError> {
        check_interval(from, to)?;
        Ok(Distance::MaxInterval {
            expr: Arc::new(expr),
            from,
            to,
        })
    }

    pub fn min_interval(expr: Distance, from: usize, to: usize) -> Result<Self, SpearError> {
        check_interval(from, to)?;
        Ok(Distance::MinInterval {
            expr: Arc::new(expr),
            from,
            to,
        })
    }

    pub fn threshold(expr: Distance, relop: RelationOperator, threshold: f64) -> Self {
        Distance::Threshold {
            expr: Arc::new(expr),
            relop,
            threshold,
        }
    }

    pub fn until(left: Distance, from: usize, to: usize, right: Distance) -> Result<Self, SpearError> {
        check_interval(from, to)?;
        Ok(Distance::Until {
            left: Arc::new(left),
            from,
            to,
            right: Arc::new(right),
        })
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distance::Atomic { direction, .. } => write!(f, "Atomic({direction:?})"),
            Distance::Max(a, b) => write!(f, "Max({a:?}, {b:?})"),
            Distance::Min(a, b) => write!(f, "Min({a:?}, {b:?})"),
            Distance::LinearCombination(terms) => f.debug_tuple("LinearCombination").field(terms).finish(),
            Distance::MaxInterval { expr, from, to } => write!(f, "MaxInterval({expr:?}, [{from}, {to}])"),
            Distance::MinInterval { expr, from, to } => write!(f, "MinInterval({expr:?}, [{from}, {to}])"),
            Distance::Threshold {
                expr,
                relop,
                threshold,
            } => write!(f, "Threshold({expr:?} {relop} {threshold})"),
            Distance::Until { left, from, to, right } => {
                write!(f, "Until({left:?}, [{from}, {to}], {right:?})")
            }
        }
    }
}

/// Combine estimates component by component.
fn zip_estimates(a: DistanceEstimate, b: DistanceEstimate, f: impl Fn(f64, f64) -> f64) -> DistanceEstimate {
    DistanceEstimate::new(f(a.value, b.value), f(a.lower, b.lower), f(a.upper, b.upper))
}

impl DistanceExpression for Distance {
    fn compute(&self, step: usize, seq1: &EvolutionSequence, seq2: &EvolutionSequence) -> f64 {
        match self {
            Distance::Atomic { rho, direction } => {
                let value = seq1.get(step).distance(rho, &seq2.get(step), *direction);
                trace!(step, ?direction, value, "atomic distance");
                value
            }
            Distance::Max(a, b) => a.compute(step, seq1, seq2).max(b.compute(step, seq1, seq2)),
            Distance::Min(a, b) => a.compute(step, seq1, seq2).min(b.compute(step, seq1, seq2)),
            Distance::LinearCombination(terms) => terms
                .iter()
                .map(|(w, e)| w * e.compute(step, seq1, seq2))
                .sum(),
            Distance::MaxInterval { expr, from, to } => (step + from..step + to)
                .into_par_iter()
                .map(|i| expr.compute(i, seq1, seq2))
                .reduce(|| f64::NEG_INFINITY, f64::max),
            Distance::MinInterval { expr, from, to } => (step + from..step + to)
                .into_par_iter()
                .map(|i| expr.compute(i, seq1, seq2))
                .reduce(|| f64::INFINITY, f64::min),
            Distance::Threshold {
                expr,
                relop,
                threshold,
            } => {
                if relop.eval(expr.compute(step, seq1, seq2), *threshold) {
                    0.0
                } else {
                    1.0
                }
            }
            Distance::Until {
                left,
                from,
                to,
                right,
            } => {
                let start = step + from;
                let left_values: Vec<f64> = (start..step + to)
                    .map(|j| left.compute(j, seq1, seq2))
                    .collect();
                (start..step + to)
                    .map(|i| {
                        let before = left_values[..i - start]
                            .iter()
                            .copied()
                            .fold(f64::NEG_INFINITY, f64::max);
                        right.compute(i, seq1, seq2).max(before)
                    })
                    .fold(f64::INFINITY, f64::min)
            }
        }
    }

    fn compute_interval(
        &self,
        step: usize,
        seq1: &EvolutionSequence,
        seq2: &EvolutionSequence,
        m: usize,
        z: f64,
    ) -> DistanceEstimate {
        match self {
            Distance::Atomic { rho, direction } => {
                let mut rng = seq2.stream().derive(BOOTSTRAP_SALT).derive(step as u64).rng(0);
                let estimate =
                    seq1.get(step)
                        .bootstrap_distance(&mut rng, rho, &seq2.get(step), *direction, m, z);
                trace!(step, ?direction, ?estimate, "atomic distance interval");
                estimate
            }
            Distance::Max(a, b) => zip_estimates(
                a.compute_interval(step, seq1, seq2, m, z),
                b.compute_interval(step, seq1, seq2, m, z),
                f64::max,
            ),
            Distance::Min(a, b) => zip_estimates(
                a.compute_interval(step, seq1, seq2, m, z),
                b.compute_interval(step, seq1, seq2, m, z),
                f64::min,
            ),
            Distance::LinearCombination(terms) => terms.iter().fold(
                DistanceEstimate::exact(0.0),
                |acc, (w, e)| {
                    let term = e.compute_interval(step, seq1, seq2, m, z);
                    zip_estimates(acc, term, |x, y| x + w * y)
                },
            ),
            Distance::MaxInterval { expr, from, to } => (step + from..step + to)
                .into_par_iter()
                .map(|i| expr.compute_interval(i, seq1, seq2, m, z))
                .reduce(
                    || DistanceEstimate::exact(f64::NEG_INFINITY),
                    |a, b| zip_estimates(a, b, f64::max),
                ),
            Distance::MinInterval { expr, from, to } => (step + from..step + to)
                .into_par_iter()
                .map(|i| expr.compute_interval(i, seq1, seq2, m, z))
                .reduce(
                    || DistanceEstimate::exact(f64::INFINITY),
                    |a, b| zip_estimates(a, b, f64::min),
                ),
            Distance::Threshold {
                expr,
                relop,
                threshold,
            } => {
                let estimate = expr.compute_interval(step, seq1, seq2, m, z);
                let value = if relop.eval(estimate.value, *threshold) {
                    0.0
                } else {
                    1.0
                };
                if estimate.straddles(*threshold) {
                    DistanceEstimate::new(value, 0.0, 1.0)
                } else {
                    DistanceEstimate::exact(value)
                }
            }
            Distance::Until {
                left,
                from,
                to,
                right,
            } => {
                let start = step + from;
                let left_values: Vec<DistanceEstimate> = (start..step + to)
                    .map(|j| left.compute_interval(j, seq1, seq2, m, z))
                    .collect();
                (start..step + to)
                    .map(|i| {
                        let before = left_values[..i - start].iter().fold(
                            DistanceEstimate::exact(f64::NEG_INFINITY),
                            |acc, e| zip_estimates(acc, *e, f64::max),
                        );
                        zip_estimates(
                            right.compute_interval(i, seq1, seq2, m, z),
                            before,
                            f64::max,
                        )
                    })
                    .fold(DistanceEstimate::exact(f64::INFINITY), |acc, e| {
                        zip_estimates(acc, e, f64::min)
                    })
            }
        }
    }
}
