//! Perturbations of an evolution
//!
//! A perturbation is a small program over time: at every step it may offer a
//! data-state function to apply to each replica, and `step` yields the
//! perturbation that remains for the next step.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use rand_distr::{Distribution, Normal, NormalError};

use crate::ds::{DataState, DataStateFunction, DataStateUpdate};
use crate::SpearError;

#[derive(Clone)]
pub enum Perturbation {
    /// No effect, ever.
    None,
    /// Wait `after` steps, then apply `effect` once.
    Atomic {
        after: usize,
        effect: DataStateFunction,
    },
    /// Run `first` to completion, then `second`.
    Sequential(Arc<Perturbation>, Arc<Perturbation>),
    /// Run `body` `count` times in sequence.
    Iterative { count: usize, body: Arc<Perturbation> },
}

impl Perturbation {
    pub fn atomic(after: usize, effect: DataStateFunction) -> Self {
        Perturbation::Atomic { after, effect }
    }

    pub fn sequential(first: Perturbation, second: Perturbation) -> Self {
        Perturbation::Sequential(Arc::new(first), Arc::new(second))
    }

    pub fn iterative(count: usize, body: Perturbation) -> Self {
        Perturbation::Iterative {
            count,
            body: Arc::new(body),
        }
    }

    /// Whether this perturbation has nothing left to do.
    ///
    /// An atomic perturbation only becomes done by stepping past its effect.
    pub fn is_done(&self) -> bool {
        match self {
            Perturbation::None => true,
            Perturbation::Atomic { .. } => false,
            Perturbation::Sequential(first, second) => first.is_done() && second.is_done(),
            Perturbation::Iterative { count, .. } => *count == 0,
        }
    }

    /// Function to apply at the current step, if any.
    pub fn effect(&self) -> Option<&DataStateFunction> {
        match self {
            Perturbation::None => None,
            Perturbation::Atomic { after, effect } => (*after == 0).then_some(effect),
            Perturbation::Sequential(first, second) => {
                if first.is_done() {
                    second.effect()
                } else {
                    first.effect()
                }
            }
            Perturbation::Iterative { count, body } => {
                if *count > 0 {
                    body.effect()
                } else {
                    None
                }
            }
        }
    }

    /// Perturbation for the next step.
    pub fn step(&self) -> Perturbation {
        match self {
            Perturbation::None => Perturbation::None,
            Perturbation::Atomic { after, effect } => {
                if *after == 0 {
                    Perturbation::None
                } else {
                    Perturbation::Atomic {
                        after: after - 1,
                        effect: Arc::clone(effect),
                    }
                }
            }
            Perturbation::Sequential(first, second) => {
                if first.is_done() {
                    second.step()
                } else {
                    Perturbation::Sequential(Arc::new(first.step()), Arc::clone(second))
                }
            }
            Perturbation::Iterative { count, body } => {
                if *count == 0 {
                    Perturbation::None
                } else {
                    Perturbation::Sequential(
                        Arc::new(body.step()),
                        Arc::new(Perturbation::Iterative {
                            count: count - 1,
                            body: Arc::clone(body),
                        }),
                    )
                }
            }
        }
    }

    /// Apply the current effect to `state`, or return it unchanged.
    pub fn apply(&self, rng: &mut dyn RngCore, state: &DataState) -> DataState {
        match self.effect() {
            Some(effect) => effect(rng, state),
            None => state.clone(),
        }
    }
}

impl fmt::Debug for Perturbation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Perturbation::None => f.write_str("None"),
            Perturbation::Atomic { after, .. } => write!(f, "Atomic({after})"),
            Perturbation::Sequential(first, second) => {
                write!(f, "Sequential({first:?}, {second:?})")
            }
            Perturbation::Iterative { count, body } => write!(f, "Iterative({count}, {body:?})"),
        }
    }
}

/// Data-state function adding zero-mean Gaussian noise to cell `index`.
pub fn gaussian_noise(index: usize, std_dev: f64) -> Result<DataStateFunction, SpearError> {
    if !(std_dev.is_finite() && std_dev >= 0.0) {
        return Err(SpearError::InvalidDistribution(NormalError::BadVariance));
    }
    let normal = Normal::new(0.0, std_dev)?;
    Ok(Arc::new(move |rng: &mut dyn RngCore, ds: &DataState| {
        let noise = normal.sample(rng);
        ds.apply(&[DataStateUpdate::new(index, ds.get(index) + noise)])
    }))
}
