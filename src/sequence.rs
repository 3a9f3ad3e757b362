//! Lazily generated evolution sequences
//!
//! An evolution sequence maps every time step to the ensemble of replicas
//! reached at that step. Ensembles are generated on demand, one step at a
//! time, and cached.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use rayon::prelude::*;
use tracing::debug;

use crate::distance::DistanceExpression;
use crate::ds::DataStateExpression;
use crate::perturbation::Perturbation;
use crate::random::SeedStream;
use crate::sample::SampleSet;
use crate::system::ControlledSystem;

/// Ensemble of controlled systems at one step
pub type Ensemble = SampleSet<ControlledSystem>;

const PERTURBATION_SALT: u64 = 0x7065_7274;
const PERTURBED_SEQUENCE_SALT: u64 = 0x7365_7175;
const REPLICA_SALT: u64 = 0x7265_706c;

/// Observer notified around the generation of each step
///
/// Each step is announced once, even when several threads race to generate
/// it: `start` before its replicas are sampled, `end` once the ensemble is
/// stored. Both are called with the sequence locked and must not call back
/// into it.
pub trait SimulationMonitor: Send + Sync {
    fn start_samplings_of_step(&self, step: usize);
    fn end_samplings_of_step(&self, step: usize);
}

#[derive(Clone)]
struct Entry {
    ensemble: Arc<Ensemble>,
    /// Perturbation whose effect was applied to this ensemble.
    residual: Perturbation,
}

struct Steps {
    /// Never empty; index `k` holds the ensemble of step `k`.
    entries: Vec<Entry>,
    /// Highest step whose sampling was announced to the monitor.
    announced: usize,
}

pub struct EvolutionSequence {
    stream: SeedStream,
    monitor: Option<Arc<dyn SimulationMonitor>>,
    steps: Mutex<Steps>,
}

impl EvolutionSequence {
    /// Sequence whose initial ensemble holds `size` replicas drawn from `generator`.
    pub fn new<F>(seed: u64, size: usize, generator: F) -> Self
    where
        F: Fn(&mut dyn RngCore) -> ControlledSystem + Sync,
    {
        let stream = SeedStream::new(seed);
        let initial = SampleSet::generate(stream.derive(0), size, generator);
        Self::from_entries(
            stream,
            None,
            vec![Entry {
                ensemble: Arc::new(initial),
                residual: Perturbation::None,
            }],
        )
    }

    /// Sequence starting from `size` copies of `system`.
    pub fn from_system(system: ControlledSystem, size: usize, seed: u64) -> Self {
        Self::new(seed, size, move |_| system.clone())
    }

    fn from_entries(
        stream: SeedStream,
        monitor: Option<Arc<dyn SimulationMonitor>>,
        entries: Vec<Entry>,
    ) -> Self {
        let announced = entries.len() - 1;
        Self {
            stream,
            monitor,
            steps: Mutex::new(Steps { entries, announced }),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn SimulationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn stream(&self) -> SeedStream {
        self.stream
    }

    /// Number of steps generated so far; step 0 is always present.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.steps.lock().entries.len()
    }

    /// Ensemble at `step`, generating the missing steps first.
    pub fn get(&self, step: usize) -> Arc<Ensemble> {
        self.entry(step).ensemble
    }

    /// Ensembles of steps `from..=to`.
    pub fn select(&self, from: usize, to: usize) -> Vec<Arc<Ensemble>> {
        if from > to {
            return Vec::new();
        }
        self.generate_up_to(to);
        self.steps.lock().entries[from..=to]
            .iter()
            .map(|entry| Arc::clone(&entry.ensemble))
            .collect()
    }

    pub fn generate_up_to(&self, step: usize) {
        self.entry(step);
    }

    /// Sorted penalty values of the ensemble at `step`.
    pub fn eval_penalty(&self, rho: &DataStateExpression, step: usize) -> Vec<f64> {
        self.get(step).eval_penalty(rho)
    }

    /// Sorted penalty values of `rho` at every step of `from..=to`, one row
    /// per step.
    pub fn penalty_table(&self, rho: &DataStateExpression, from: usize, to: usize) -> Vec<Vec<f64>> {
        self.select(from, to)
            .par_iter()
            .map(|ensemble| ensemble.eval_penalty(rho))
            .collect()
    }

    /// Values of `exprs` between this sequence and `other` at every step of
    /// `from..=to`; row `i` holds step `from + i`, one column per expression.
    pub fn distance_table(
        &self,
        other: &EvolutionSequence,
        from: usize,
        to: usize,
        exprs: &[&dyn DistanceExpression],
    ) -> Vec<Vec<f64>> {
        if from > to {
            return Vec::new();
        }
        self.generate_up_to(to);
        other.generate_up_to(to);
        (from..=to)
            .into_par_iter()
            .map(|step| exprs.iter().map(|expr| expr.compute(step, self, other)).collect())
            .collect()
    }

    /// Sequence perturbed by `perturbation` from `perturbed_step` on.
    ///
    /// The result shares this sequence's ensembles before `perturbed_step`.
    /// Its ensemble at `perturbed_step` is a resampling of `sample_size`
    /// replicas with the perturbation's current effect applied; each later
    /// ensemble advances the previous one and applies what remains of the
    /// perturbation.
    pub fn apply(
        &self,
        perturbation: &Perturbation,
        perturbed_step: usize,
        sample_size: usize,
    ) -> EvolutionSequence {
        self.apply_salted(perturbation, perturbed_step, sample_size, 0)
    }

    /// [`apply`](Self::apply) drawing from the random stream named by `salt`.
    ///
    /// Calls agreeing on step, sample size and salt resample the same
    /// replicas and feed the same draws to the perturbation; distinct salts
    /// give independent samples.
    pub fn apply_salted(
        &self,
        perturbation: &Perturbation,
        perturbed_step: usize,
        sample_size: usize,
        salt: u64,
    ) -> EvolutionSequence {
        let stream = self
            .stream
            .derive(PERTURBED_SEQUENCE_SALT)
            .derive(salt)
            .derive(perturbed_step as u64)
            .derive(sample_size as u64);
        let base = self.get(perturbed_step);
        let mut entries: Vec<Entry> = self
            .steps
            .lock()
            .entries
            .iter()
            .take(perturbed_step)
            .map(|entry| Entry {
                ensemble: Arc::clone(&entry.ensemble),
                residual: Perturbation::None,
            })
            .collect();
        let resampled = base.replica(&mut stream.derive(REPLICA_SALT).rng(0), sample_size);
        let ensemble = perturb(&resampled, perturbation, stream.derive(perturbed_step as u64));
        debug!(
            step = perturbed_step,
            sample_size,
            salt,
            perturbation = ?perturbation,
            "created perturbed sequence"
        );
        entries.push(Entry {
            ensemble: Arc::new(ensemble),
            residual: perturbation.clone(),
        });
        Self::from_entries(stream, self.monitor.clone(), entries)
    }

    /// Values of `expr` at steps `t1..=t2` between this sequence and its
    /// perturbation by `perturbation` from step `from`.
    pub fn compute(
        &self,
        perturbation: &Perturbation,
        from: usize,
        sample_size: usize,
        expr: &dyn DistanceExpression,
        t1: usize,
        t2: usize,
    ) -> Vec<f64> {
        let perturbed = self.apply(perturbation, from, sample_size);
        expr.compute_range(t1, t2, self, &perturbed)
    }

    fn entry(&self, step: usize) -> Entry {
        loop {
            let (last_step, last) = {
                let mut steps = self.steps.lock();
                if let Some(entry) = steps.entries.get(step) {
                    return entry.clone();
                }
                let last_step = steps.entries.len() - 1;
                if steps.announced == last_step {
                    steps.announced += 1;
                    if let Some(monitor) = &self.monitor {
                        monitor.start_samplings_of_step(last_step);
                    }
                }
                (last_step, steps.entries[last_step].clone())
            };
            // generated without holding the lock; the first writer wins
            let next = self.generate_next(last_step, &last);
            let mut steps = self.steps.lock();
            if steps.entries.len() == last_step + 1 {
                steps.entries.push(next);
                if let Some(monitor) = &self.monitor {
                    monitor.end_samplings_of_step(last_step);
                }
            }
        }
    }

    fn generate_next(&self, last_step: usize, last: &Entry) -> Entry {
        let step = last_step + 1;
        let stream = self.stream.derive(step as u64);
        let residual = last.residual.step();
        let advanced = last.ensemble.sample_next(stream);
        let ensemble = perturb(&advanced, &residual, stream);
        debug!(step, size = ensemble.size(), "generated ensemble");
        Entry {
            ensemble: Arc::new(ensemble),
            residual,
        }
    }
}

fn perturb(ensemble: &Ensemble, perturbation: &Perturbation, stream: SeedStream) -> Ensemble {
    match perturbation.effect() {
        Some(effect) => ensemble.apply_distribution(stream.derive(PERTURBATION_SALT), effect),
        None => ensemble.clone(),
    }
}

impl fmt::Debug for EvolutionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionSequence")
            .field("seed", &self.stream.seed())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::system::SystemState;
    use crate::ds::{DataRange, DataState, DataStateFunction, DataStateUpdate, UpdateFunction};
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Random walk on cell 0 with unit steps, clamped to [-50, 50].
    fn walk() -> ControlledSystem {
        let environment: UpdateFunction = Arc::new(|rng, ds| {
            let delta = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            vec![DataStateUpdate::new(0, ds.get(0) + delta)]
        });
        let state = DataState::new(vec![DataRange::new(-50.0, 50.0)], vec![0.0]).unwrap();
        ControlledSystem::new(Controller::nil(), environment, state)
    }

    fn rho() -> DataStateExpression {
        Arc::new(|ds| ds.get(0))
    }

    fn shift(amount: f64) -> DataStateFunction {
        Arc::new(move |_, ds| ds.apply(&[DataStateUpdate::new(0, ds.get(0) + amount)]))
    }

    #[test]
    fn test_get_extends_and_caches() {
        let seq = EvolutionSequence::from_system(walk(), 20, 1);
        assert_eq!(seq.len(), 1);
        let fifth = seq.get(5);
        assert_eq!(seq.len(), 6);
        assert_eq!(fifth.size(), 20);
        assert!(Arc::ptr_eq(&fifth, &seq.get(5)));
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = EvolutionSequence::from_system(walk(), 30, 7);
        let b = EvolutionSequence::from_system(walk(), 30, 7);
        assert_eq!(a.eval_penalty(&rho(), 10), b.eval_penalty(&rho(), 10));
    }

    #[test]
    fn test_replicas_evolve_independently() {
        let seq = EvolutionSequence::from_system(walk(), 50, 3);
        let values = seq.eval_penalty(&rho(), 10);
        assert!(values.first() != values.last());
    }

    #[test]
    fn test_select_is_inclusive() {
        let seq = EvolutionSequence::from_system(walk(), 5, 2);
        assert_eq!(seq.select(2, 4).len(), 3);
        assert!(seq.select(4, 2).is_empty());
    }

    #[test]
    fn test_concurrent_extension_is_consistent() {
        let seq = EvolutionSequence::from_system(walk(), 10, 4);
        let lens: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| seq.get(12).size())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(lens.iter().all(|&n| n == 10));
        assert_eq!(seq.len(), 13);
    }

    #[test]
    fn test_perturbed_sequence_shares_prefix_and_resamples() {
        let seq = EvolutionSequence::from_system(walk(), 20, 5);
        let perturbed = seq.apply(&Perturbation::atomic(0, shift(10.0)), 3, 40);
        assert!(Arc::ptr_eq(&seq.get(2), &perturbed.get(2)));
        assert_eq!(perturbed.get(3).size(), 40);

        let base_mean = mean(&seq.eval_penalty(&rho(), 3));
        let perturbed_mean = mean(&perturbed.eval_penalty(&rho(), 3));
        assert!(perturbed_mean - base_mean > 5.0);
        assert_eq!(perturbed.get(6).size(), 40);
    }

    #[test]
    fn test_residual_perturbation_fires_later() {
        let constant = || {
            ControlledSystem::new(
                Controller::nil(),
                Arc::new(|_, _| Vec::new()),
                DataState::with_default_ranges(vec![0.0]),
            )
        };
        let seq = EvolutionSequence::from_system(constant(), 4, 0);
        let perturbed = seq.apply(&Perturbation::atomic(2, shift(1.0)), 1, 4);
        let at = |step| perturbed.eval_penalty(&rho(), step)[0];
        assert_eq!(at(1), 0.0);
        assert_eq!(at(2), 0.0);
        assert_eq!(at(3), 1.0);
        assert_eq!(at(5), 1.0);
    }

    #[test]
    fn test_monitor_sees_every_generated_step() {
        struct Counter(AtomicUsize);
        impl SimulationMonitor for Counter {
            fn start_samplings_of_step(&self, _step: usize) {}
            fn end_samplings_of_step(&self, _step: usize) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let seq = EvolutionSequence::from_system(walk(), 3, 0).with_monitor(counter.clone());
        seq.generate_up_to(4);
        assert_eq!(counter.0.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_racing_threads_announce_each_step_once() {
        #[derive(Default)]
        struct Log(parking_lot::Mutex<Vec<(usize, bool)>>);
        impl SimulationMonitor for Log {
            fn start_samplings_of_step(&self, step: usize) {
                self.0.lock().push((step, true));
            }
            fn end_samplings_of_step(&self, step: usize) {
                self.0.lock().push((step, false));
            }
        }
        let log = Arc::new(Log::default());
        let seq = EvolutionSequence::from_system(walk(), 50, 8).with_monitor(log.clone());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| seq.get(15));
            }
        });
        let events = log.0.lock().clone();
        assert_eq!(events.len(), 30);
        for step in 0..15 {
            let start = events.iter().position(|&e| e == (step, true)).unwrap();
            let end = events.iter().position(|&e| e == (step, false)).unwrap();
            assert!(start < end, "step {step}: {events:?}");
            assert_eq!(events.iter().filter(|e| e.0 == step).count(), 2);
        }
    }

    #[test]
    fn test_salts_give_independent_perturbations() {
        let still = ControlledSystem::new(
            Controller::nil(),
            Arc::new(|_, _| Vec::new()),
            DataState::with_default_ranges(vec![0.0]),
        );
        let seq = EvolutionSequence::from_system(still, 5, 6);
        let noise = |scale: f64| -> Perturbation {
            Perturbation::atomic(
                0,
                Arc::new(move |rng, ds| ds.apply(&[DataStateUpdate::new(0, ds.get(0) + scale * rng.gen::<f64>())])),
            )
        };
        let draws = |p: &Perturbation, salt: u64| -> Vec<f64> {
            let perturbed = seq.apply_salted(p, 2, 50, salt).get(2);
            perturbed.iter().map(|s| s.data_state().get(0)).collect()
        };
        let doubled = |small: &[f64], large: &[f64]| small.iter().zip(large).filter(|(a, b)| 2.0 * **a == **b).count();

        let small = draws(&noise(1.0), 1);
        assert_eq!(doubled(&small, &draws(&noise(2.0), 1)), 50);
        assert_eq!(doubled(&small, &draws(&noise(2.0), 2)), 0);
        assert_eq!(small, draws(&noise(1.0), 1));
    }

    #[test]
    fn test_penalty_and_distance_tables() {
        let seq = EvolutionSequence::from_system(walk(), 12, 9);
        let table = seq.penalty_table(&rho(), 2, 5);
        assert_eq!(table.len(), 4);
        assert_eq!(table[1], seq.eval_penalty(&rho(), 3));
        assert!(seq.penalty_table(&rho(), 5, 2).is_empty());

        let perturbed = seq.apply(&Perturbation::atomic(0, shift(3.0)), 1, 12);
        let leq = crate::distance::Distance::leq(rho());
        let geq = crate::distance::Distance::geq(rho());
        let rows = seq.distance_table(&perturbed, 1, 4, &[&leq, &geq]);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|row| row.len() == 2));
        assert_eq!(rows[0][0], leq.compute(1, &seq, &perturbed));
        assert_eq!(rows[3][1], geq.compute(4, &seq, &perturbed));
        assert!(rows[0][0] > 2.0);
    }

    fn mean(values: &[f64]) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
