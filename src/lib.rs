//! SPEAR - statistical estimation of adaptation and robustness
//!
//! Simulates many independent trajectories of a stochastic controlled system,
//! perturbs them, and evaluates bounded temporal-logic formulas over the
//! resulting ensembles under boolean, three-valued and quantitative semantics.

pub mod config;
pub mod controller;
pub mod distance;
pub mod ds;
pub mod formula;
pub mod perturbation;
pub mod random;
pub mod sample;
pub mod semantics;
pub mod sequence;
pub mod system;

use thiserror::Error;

// Re-export main types
pub use config::{ConfidenceConfig, EvaluationConfig};
pub use controller::{Controller, ControllerRegistry, EffectStep};
pub use distance::{Distance, DistanceExpression};
pub use ds::{DataRange, DataState, DataStateUpdate};
pub use formula::{
    DisTLAtom, DisTLFormula, DisTLKind, Formula, Interval, Penalty, RelationOperator, RobustnessAtom,
    RobustnessFormula, TimedPenalty,
};
pub use perturbation::Perturbation;
pub use random::SeedStream;
pub use sample::{Direction, DistanceEstimate, SampleSet};
pub use semantics::{
    BooleanSemantics, Connectives, FormulaFunction, QuantitativeSemantics, Semantics, ThreeValuedSemantics,
    TruthValue,
};
pub use sequence::{Ensemble, EvolutionSequence, SimulationMonitor};
pub use system::{ControlledSystem, SystemState};

#[derive(Debug, Error)]
pub enum SpearError {
    #[error("invalid interval [{from}, {to}]: bounds must satisfy 0 <= from < to")]
    InvalidInterval { from: usize, to: usize },
    #[error("{context} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("step stride must be positive")]
    ZeroStride,
    #[error("invalid probabilistic weight {0}: must lie in [0, 1]")]
    InvalidWeight(f64),
    #[error("controller reference `{0}` is not bound")]
    UnboundController(String),
    #[error("controller `{0}` is already defined")]
    DuplicateController(String),
    #[error("invalid noise distribution: {0}")]
    InvalidDistribution(#[from] rand_distr::NormalError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
