use std::sync::Arc;

use tracing::trace;

use super::{perturbed_at, Connectives, FormulaFunction, Semantics};
use crate::formula::{DisTLAtom, DisTLKind, RobustnessAtom};
use crate::sample::Direction;

const DISTRIBUTION_SALT: u64 = 0x6469_7374;

/// Real-valued robustness degree
///
/// Positive values mean the formula holds with that margin, negative values
/// that it fails by that margin. `True` and `False` are the infinities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantitativeSemantics {
    parallel: bool,
}

impl QuantitativeSemantics {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }
}

impl Default for QuantitativeSemantics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectives for QuantitativeSemantics {
    type Value = f64;

    const TOP: f64 = f64::INFINITY;
    const BOTTOM: f64 = f64::NEG_INFINITY;

    fn meet(x: f64, y: f64) -> f64 {
        x.min(y)
    }

    fn join(x: f64, y: f64) -> f64 {
        x.max(y)
    }

    fn negate(x: f64) -> f64 {
        -x
    }

    fn parallel(&self) -> bool {
        self.parallel
    }
}

impl Semantics<RobustnessAtom> for QuantitativeSemantics {
    fn atom(&self, atom: &RobustnessAtom) -> FormulaFunction<f64> {
        let atom = atom.clone();
        Arc::new(move |sample_size, step, seq| {
            let perturbed = perturbed_at(&atom, sample_size, step, seq);
            let value = atom.distance.compute(step, seq, &perturbed);
            let degree = value - atom.threshold;
            trace!(step, value, degree, "quantitative atom");
            degree
        })
    }
}

impl Semantics<DisTLAtom> for QuantitativeSemantics {
    fn atom(&self, atom: &DisTLAtom) -> FormulaFunction<f64> {
        let atom = atom.clone();
        Arc::new(move |sample_size, step, seq| {
            let direction = match atom.kind {
                DisTLKind::Target => Direction::Geq,
                DisTLKind::Brink => Direction::Leq,
            };
            let stream = seq
                .stream()
                .derive(DISTRIBUTION_SALT)
                .derive(atom.id())
                .derive(step as u64)
                .derive(sample_size as u64);
            let current = seq.get(step);
            let target = current
                .replica(&mut stream.rng(0), sample_size)
                .apply_distribution(stream.derive(1), &atom.distribution);
            let distance = current.distance(&atom.penalty.at(step), &target, direction);
            let degree = match atom.kind {
                DisTLKind::Target => atom.threshold - distance,
                DisTLKind::Brink => distance - atom.threshold,
            };
            trace!(step, distance, degree, "distribution atom");
            degree
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::distance::Distance;
    use crate::ds::{DataRange, DataState, DataStateFunction, DataStateUpdate};
    use crate::formula::{DisTLFormula, Penalty, RelationOperator, RobustnessFormula};
    use crate::perturbation::Perturbation;
    use crate::semantics::fixtures::{sequence, table_atom};
    use crate::sequence::EvolutionSequence;
    use crate::system::ControlledSystem;
    use rand::Rng;

    fn degree(formula: &RobustnessFormula, step: usize, parallel: bool) -> f64 {
        QuantitativeSemantics::new(parallel).compile(formula)(2, step, &sequence())
    }

    /// Atom whose degree at step `i` is `degrees[i]`.
    fn degrees(degrees: Vec<f64>) -> RobustnessFormula {
        table_atom(degrees, 0.0, RelationOperator::Ge, 0.0)
    }

    #[test]
    fn test_atom_degree_is_distance_minus_threshold() {
        let atom = table_atom(vec![0.8], 0.0, RelationOperator::Ge, 0.5);
        assert!((degree(&atom, 0, false) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_connectives() {
        let a = degrees(vec![0.3]);
        let b = degrees(vec![-0.2]);
        let and = RobustnessFormula::conjunction(a.clone(), b.clone());
        let or = RobustnessFormula::disjunction(a.clone(), b.clone());
        let imply = RobustnessFormula::implication(a.clone(), b.clone());
        assert_eq!(degree(&and, 0, false), -0.2);
        assert_eq!(degree(&or, 0, false), 0.3);
        assert_eq!(degree(&imply, 0, false), -0.2);
        assert_eq!(degree(&RobustnessFormula::True, 0, false), f64::INFINITY);
        assert_eq!(degree(&RobustnessFormula::False, 0, false), f64::NEG_INFINITY);
    }

    #[test]
    fn test_double_negation_is_identity() {
        for value in [0.3, -0.7, 0.0] {
            let atom = degrees(vec![value]);
            let twice = RobustnessFormula::negation(RobustnessFormula::negation(atom.clone()));
            assert_eq!(degree(&twice, 0, false), degree(&atom, 0, false));
        }
    }

    #[test]
    fn test_temporal_extrema() {
        let atom = degrees(vec![0.5, -0.1, 0.9, 0.2, -0.4]);
        for parallel in [false, true] {
            let always = RobustnessFormula::always(atom.clone(), 0, 3).unwrap();
            assert_eq!(degree(&always, 0, parallel), -0.1);
            let eventually = RobustnessFormula::eventually(atom.clone(), 0, 3).unwrap();
            assert_eq!(degree(&eventually, 0, parallel), 0.9);
            let late = RobustnessFormula::always(atom.clone(), 1, 2).unwrap();
            assert_eq!(degree(&late, 2, parallel), -0.4);
        }
    }

    #[test]
    fn test_until_is_never_nan() {
        let phi = degrees(vec![0.4, 0.1, 0.7]);
        let psi = degrees(vec![0.2, 0.6, 0.3]);
        for parallel in [false, true] {
            let formula = RobustnessFormula::until(phi.clone(), 0, 3, psi.clone()).unwrap();
            // max(min(0.2), min(0.6, 0.4), min(0.3, 0.4, 0.1))
            assert_eq!(degree(&formula, 0, parallel), 0.4);
            let single = RobustnessFormula::until(phi.clone(), 0, 1, psi.clone()).unwrap();
            assert_eq!(degree(&single, 0, parallel), 0.2);
        }
    }

    fn spread_sequence() -> EvolutionSequence {
        // replicas spread uniformly over [0, 1]
        EvolutionSequence::new(3, 200, |rng| {
            let x: f64 = rng.gen();
            let state = DataState::new(vec![DataRange::new(0.0, 1.0)], vec![x]).unwrap();
            ControlledSystem::new(Controller::nil(), Arc::new(|_, _| Vec::new()), state)
        })
    }

    fn raise(amount: f64) -> DataStateFunction {
        Arc::new(move |_, ds| ds.apply(&[DataStateUpdate::new(0, ds.get(0) + amount)]))
    }

    #[test]
    fn test_target_and_brink() {
        let seq = spread_sequence();
        let penalty = Penalty::Expression(Arc::new(|ds| ds.get(0)));
        let brink = DisTLFormula::atom(DisTLAtom::brink(raise(0.3), penalty.clone(), 0.1));
        // raising by 0.3 (clamped at 1) moves the distribution up by about 0.255
        let b = brink.eval_with(200, 0, &seq, false);
        assert!(b > 0.05 && b < 0.25, "brink {b}");

        let target = DisTLFormula::atom(DisTLAtom::target(raise(0.3), penalty, 0.1));
        // the raised copy never lies below the ensemble
        let t = target.eval_with(200, 0, &seq, false);
        assert!(t > 0.05 && t <= 0.1, "target {t}");
    }

    #[test]
    fn test_distl_evaluation_is_reproducible() {
        let seq = spread_sequence();
        let formula = DisTLFormula::eventually(
            DisTLFormula::atom(DisTLAtom::brink(
                raise(0.2),
                Penalty::Timed(Arc::new(|step, ds| ds.get(0) * (step + 1) as f64)),
                0.0,
            )),
            0,
            2,
        )
        .unwrap();
        let sequential = formula.eval_with(50, 0, &seq, false);
        let parallel = formula.eval_with(50, 0, &seq, true);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_distinct_distribution_atoms_resample_independently() {
        let seq = spread_sequence();
        let penalty = Penalty::Expression(Arc::new(|ds| ds.get(0)));
        let first = DisTLFormula::atom(DisTLAtom::brink(raise(0.1), penalty.clone(), 0.0));
        let second = DisTLFormula::atom(DisTLAtom::brink(raise(0.1), penalty, 0.0));
        let a = first.eval_with(100, 0, &seq, false);
        assert_eq!(a, first.eval_with(100, 0, &seq, false));
        assert_ne!(a, second.eval_with(100, 0, &seq, false));
    }

    #[test]
    fn test_distinct_robustness_atoms_draw_independently() {
        // replicas all start at 0, so the perturbed values are the raw draws
        let seq = sequence();
        let rho: crate::ds::DataStateExpression = Arc::new(|ds| ds.get(0));
        let noise = |scale: f64| {
            Perturbation::atomic(
                0,
                Arc::new(move |rng, ds| ds.apply(&[DataStateUpdate::new(0, ds.get(0) + scale * rng.gen::<f64>())])),
            )
        };
        let small = RobustnessAtom::new(noise(1.0), Distance::leq(rho.clone()), RelationOperator::Ge, 0.0);
        let large = RobustnessAtom::new(noise(2.0), Distance::leq(rho.clone()), RelationOperator::Ge, 0.0);
        let draws = |atom: &RobustnessAtom| perturbed_at(atom, 50, 0, &seq).eval_penalty(&rho, 0);
        let small_draws = draws(&small);
        let large_draws = draws(&large);
        let doubled = small_draws.iter().zip(&large_draws).filter(|(a, b)| 2.0 * **a == **b).count();
        assert_eq!(doubled, 0);
        assert_eq!(draws(&small), small_draws);
    }

    #[test]
    fn test_eval_range_steps_through_the_window() {
        let atom = degrees(vec![0.5, -0.1, 0.9, 0.2, -0.4, 0.3, 0.7]);
        let seq = sequence();
        let series = atom.eval_range_with(&QuantitativeSemantics::new(false), 2, 1, 7, 2, &seq).unwrap();
        assert_eq!(series, vec![-0.1, 0.2, 0.3]);
        let verdicts = atom.eval_range(2, 0, 4, 1, &seq).unwrap();
        assert_eq!(verdicts, vec![true, false, true, true]);
        assert!(atom.eval_range(2, 4, 4, 1, &seq).unwrap().is_empty());
        assert!(matches!(atom.eval_range(2, 0, 4, 0, &seq), Err(crate::SpearError::ZeroStride)));
    }

    #[test]
    fn test_distl_eval_range_matches_single_steps() {
        let seq = spread_sequence();
        let formula = DisTLFormula::atom(DisTLAtom::target(
            raise(0.2),
            Penalty::Expression(Arc::new(|ds| ds.get(0))),
            0.1,
        ));
        let series = formula.eval_range(60, 0, 3, 1, &seq).unwrap();
        assert_eq!(series.len(), 3);
        for (step, value) in series.iter().enumerate() {
            assert_eq!(*value, formula.eval(60, step, &seq));
        }
    }
}
