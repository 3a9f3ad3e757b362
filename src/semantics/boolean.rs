use std::sync::Arc;

use tracing::trace;

use super::{perturbed_at, Connectives, FormulaFunction, Semantics};
use crate::formula::RobustnessAtom;

/// Two-valued semantics of robustness formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BooleanSemantics {
    parallel: bool,
}

impl BooleanSemantics {
    pub fn new(parallel: bool) -> Self {
        Self { parallel }
    }
}

impl Default for BooleanSemantics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectives for BooleanSemantics {
    type Value = bool;

    const TOP: bool = true;
    const BOTTOM: bool = false;

    fn meet(x: bool, y: bool) -> bool {
        x && y
    }

    fn join(x: bool, y: bool) -> bool {
        x || y
    }

    fn negate(x: bool) -> bool {
        !x
    }

    fn parallel(&self) -> bool {
        self.parallel
    }
}

impl Semantics<RobustnessAtom> for BooleanSemantics {
    fn atom(&self, atom: &RobustnessAtom) -> FormulaFunction<bool> {
        let atom = atom.clone();
        Arc::new(move |sample_size, step, seq| {
            let perturbed = perturbed_at(&atom, sample_size, step, seq);
            let value = atom.distance.compute(step, seq, &perturbed);
            let verdict = atom.relop.eval(value, atom.threshold);
            trace!(step, value, verdict, "boolean atom");
            verdict
        })
    }
}
