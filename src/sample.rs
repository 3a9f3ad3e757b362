//! Ensembles of replicas and the statistics computed over them

use rand::{Rng, RngCore};
use rayon::prelude::*;

use crate::ds::{DataStateExpression, DataStateFunction};
use crate::random::SeedStream;
use crate::system::SystemState;

/// Which side of the difference between two penalty distributions counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// How far the other ensemble exceeds this one ("at most").
    Leq,
    /// How far this ensemble exceeds the other one ("at least").
    Geq,
    /// Absolute difference.
    Both,
}

impl Direction {
    fn gap(self, this: f64, other: f64) -> f64 {
        match self {
            Direction::Leq => (other - this).max(0.0),
            Direction::Geq => (this - other).max(0.0),
            Direction::Both => (other - this).abs(),
        }
    }
}

/// Point estimate of a distance with its confidence interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimate {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl DistanceEstimate {
    pub fn new(value: f64, lower: f64, upper: f64) -> Self {
        Self {
            value,
            lower,
            upper,
        }
    }

    /// Degenerate interval around an exact value.
    pub fn exact(value: f64) -> Self {
        Self::new(value, value, value)
    }

    /// Whether `threshold` lies strictly inside the interval.
    pub fn straddles(&self, threshold: f64) -> bool {
        self.lower < threshold && threshold < self.upper
    }
}

/// Ensemble of independent replicas at one time step
#[derive(Debug, Clone)]
pub struct SampleSet<S> {
    states: Vec<S>,
}

impl<S: SystemState> SampleSet<S> {
    pub fn new(states: Vec<S>) -> Self {
        Self { states }
    }

    /// Build `size` replicas, replica `i` drawing from `stream.rng(i)`.
    pub fn generate<F>(stream: SeedStream, size: usize, generator: F) -> Self
    where
        F: Fn(&mut dyn RngCore) -> S + Sync,
    {
        let states = (0..size)
            .into_par_iter()
            .map(|i| generator(&mut stream.rng(i as u64)))
            .collect();
        Self { states }
    }

    pub fn size(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, S> {
        self.states.iter()
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    /// Advance every replica one step, each with its own random stream.
    pub fn sample_next(&self, stream: SeedStream) -> Self {
        self.apply(stream, |rng, s| s.sample_next(rng))
    }

    /// Map `f` over the replicas, replica `i` drawing from `stream.rng(i)`.
    pub fn apply<F>(&self, stream: SeedStream, f: F) -> Self
    where
        F: Fn(&mut dyn RngCore, &S) -> S + Sync,
    {
        let states = self
            .states
            .par_iter()
            .enumerate()
            .map(|(i, s)| f(&mut stream.rng(i as u64), s))
            .collect();
        Self { states }
    }

    /// Replace the data state of every replica with a sample of `f`.
    pub fn apply_distribution(&self, stream: SeedStream, f: &DataStateFunction) -> Self {
        self.apply(stream, |rng, s| s.with_data_state(f(rng, s.data_state())))
    }

    /// Resample `n` replicas with repetition.
    pub fn replica(&self, rng: &mut dyn RngCore, n: usize) -> Self {
        if self.states.is_empty() {
            return Self { states: Vec::new() };
        }
        let states = (0..n)
            .map(|_| self.states[rng.gen_range(0..self.states.len())].clone())
            .collect();
        Self { states }
    }

    /// Sorted values of `rho` over the replicas.
    pub fn eval_penalty(&self, rho: &DataStateExpression) -> Vec<f64> {
        let mut values: Vec<f64> = self.states.iter().map(|s| rho(s.data_state())).collect();
        values.sort_unstable_by(f64::total_cmp);
        values
    }

    /// Wasserstein distance between the penalty distributions of `self`
    /// and `other`, counting only the differences selected by `direction`.
    ///
    /// Returns `0.0` when either ensemble is empty.
    pub fn distance(&self, rho: &DataStateExpression, other: &SampleSet<S>, direction: Direction) -> f64 {
        quantile_distance(&self.eval_penalty(rho), &other.eval_penalty(rho), direction)
    }

    /// Distance together with a bootstrap confidence interval.
    ///
    /// Each of the `m` replications resamples both penalty distributions with
    /// repetition; the interval is the bootstrap mean plus or minus `z`
    /// standard errors, with its lower end clamped at zero.
    pub fn bootstrap_distance(
        &self,
        rng: &mut dyn RngCore,
        rho: &DataStateExpression,
        other: &SampleSet<S>,
        direction: Direction,
        m: usize,
        z: f64,
    ) -> DistanceEstimate {
        let this_values = self.eval_penalty(rho);
        let other_values = other.eval_penalty(rho);
        let value = quantile_distance(&this_values, &other_values, direction);
        if m == 0 || this_values.is_empty() || other_values.is_empty() {
            return DistanceEstimate::exact(value);
        }
        let replications: Vec<f64> = (0..m)
            .map(|_| {
                let a = resample_sorted(rng, &this_values);
                let b = resample_sorted(rng, &other_values);
                quantile_distance(&a, &b, direction)
            })
            .collect();
        let mean = replications.iter().sum::<f64>() / m as f64;
        let standard_error = if m > 1 {
            (replications.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / (m - 1) as f64).sqrt()
        } else {
            0.0
        };
        DistanceEstimate::new(
            value,
            (mean - z * standard_error).max(0.0),
            mean + z * standard_error,
        )
    }

    /// Empirical CDF of `rho` on the grid `from + i * (to - from) / steps`,
    /// `i` in `0..steps`.
    pub fn estimate_probability_distribution(
        &self,
        rho: &DataStateExpression,
        from: f64,
        to: f64,
        steps: usize,
    ) -> Vec<f64> {
        let values = self.eval_penalty(rho);
        if values.is_empty() {
            return vec![0.0; steps];
        }
        let dt = (to - from) / steps as f64;
        let size = values.len() as f64;
        (0..steps)
            .map(|i| {
                let bound = from + i as f64 * dt;
                values.partition_point(|&x| x <= bound) as f64 / size
            })
            .collect()
    }
}

impl<S> IntoIterator for SampleSet<S> {
    type Item = S;
    type IntoIter = std::vec::IntoIter<S>;

    fn into_iter(self) -> Self::IntoIter {
        self.states.into_iter()
    }
}

fn resample_sorted(rng: &mut dyn RngCore, values: &[f64]) -> Vec<f64> {
    let mut sample: Vec<f64> = (0..values.len())
        .map(|_| values[rng.gen_range(0..values.len())])
        .collect();
    sample.sort_unstable_by(f64::total_cmp);
    sample
}

/// Integral over `t` in `[0, 1]` of the gap between the two empirical
/// quantile functions. Both slices must be sorted.
fn quantile_distance(this: &[f64], other: &[f64], direction: Direction) -> f64 {
    let (n, m) = (this.len(), other.len());
    if n == 0 || m == 0 {
        return 0.0;
    }
    // positions are measured in units of 1 / (n * m)
    let (mut i, mut j) = (0, 0);
    let mut position = 0;
    let mut total = 0.0;
    while i < n && j < m {
        let this_end = (i + 1) * m;
        let other_end = (j + 1) * n;
        let next = this_end.min(other_end);
        total += (next - position) as f64 * direction.gap(this[i], other[j]);
        position = next;
        if this_end == next {
            i += 1;
        }
        if other_end == next {
            j += 1;
        }
    }
    total / (n * m) as f64
}
