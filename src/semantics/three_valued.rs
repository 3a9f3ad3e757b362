use std::sync::Arc;

use tracing::trace;

use super::{perturbed_at, Connectives, FormulaFunction, Semantics, TruthValue};
use crate::formula::RobustnessAtom;

/// Three-valued semantics driven by bootstrap confidence intervals
///
/// An atom is `Unknown` when its threshold falls strictly inside the
/// confidence interval of the distance, computed with `m` bootstrap
/// replications at z-score `z`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreeValuedSemantics {
    m: usize,
    z: f64,
    parallel: bool,
}

impl ThreeValuedSemantics {
    pub fn new(m: usize, z: f64, parallel: bool) -> Self {
        Self { m, z, parallel }
    }
}

impl Connectives for ThreeValuedSemantics {
    type Value = TruthValue;

    const TOP: TruthValue = TruthValue::True;
    const BOTTOM: TruthValue = TruthValue::False;

    fn meet(x: TruthValue, y: TruthValue) -> TruthValue {
        x.and(y)
    }

    fn join(x: TruthValue, y: TruthValue) -> TruthValue {
        x.or(y)
    }

    fn negate(x: TruthValue) -> TruthValue {
        x.neg()
    }

    fn parallel(&self) -> bool {
        self.parallel
    }
}

impl Semantics<RobustnessAtom> for ThreeValuedSemantics {
    fn atom(&self, atom: &RobustnessAtom) -> FormulaFunction<TruthValue> {
        let atom = atom.clone();
        let (m, z) = (self.m, self.z);
        Arc::new(move |sample_size, step, seq| {
            let perturbed = perturbed_at(&atom, sample_size, step, seq);
            let estimate = atom.distance.compute_interval(step, seq, &perturbed, m, z);
            let verdict = if estimate.straddles(atom.threshold) {
                TruthValue::Unknown
            } else {
                TruthValue::from_bool(atom.relop.eval(estimate.value, atom.threshold))
            };
            trace!(step, ?estimate, %verdict, "three-valued atom");
            verdict
        })
    }
}
