//! Controlled systems
//!
//! A system couples a controller, an environment and the current data state.

use std::fmt;

use rand::RngCore;

use crate::controller::Controller;
use crate::ds::{DataState, UpdateFunction};

/// State of one replica in an ensemble
pub trait SystemState: Clone + Send + Sync {
    fn data_state(&self) -> &DataState;

    /// Same system with its data state replaced.
    fn with_data_state(&self, state: DataState) -> Self;

    /// Advance one step.
    fn sample_next(&self, rng: &mut dyn RngCore) -> Self;
}

/// Controller + environment + data state
#[derive(Clone)]
pub struct ControlledSystem {
    controller: Controller,
    environment: UpdateFunction,
    state: DataState,
}

impl ControlledSystem {
    pub fn new(controller: Controller, environment: UpdateFunction, state: DataState) -> Self {
        Self {
            controller,
            environment,
            state,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }
}

impl SystemState for ControlledSystem {
    fn data_state(&self) -> &DataState {
        &self.state
    }

    fn with_data_state(&self, state: DataState) -> Self {
        Self {
            controller: self.controller.clone(),
            environment: self.environment.clone(),
            state,
        }
    }

    /// Controller and environment both read the pre-step state; the
    /// environment's updates are applied after the controller's.
    fn sample_next(&self, rng: &mut dyn RngCore) -> Self {
        let step = self.controller.next(rng, &self.state);
        let mut updates = step.effect;
        updates.extend((self.environment)(rng, &self.state));
        Self {
            controller: step.next,
            environment: self.environment.clone(),
            state: self.state.apply(&updates),
        }
    }
}

impl fmt::Debug for ControlledSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledSystem")
            .field("controller", &self.controller)
            .field("state", &self.state)
            .finish()
    }
}
