//! Controller execution algebra
//!
//! A controller is an immutable state machine over data states. Stepping it
//! yields an [`EffectStep`]: the updates produced in this step together with
//! the controller to run in the next one. Controllers are cheap to clone and
//! can be shared freely across replicas and threads.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rand::{Rng, RngCore};

use crate::ds::{DataState, DataStatePredicate, DataStateUpdate, StepFunction, UpdateFunction};
use crate::SpearError;

/// Updates produced by one controller step and the continuation
#[derive(Debug, Clone)]
pub struct EffectStep {
    pub effect: Vec<DataStateUpdate>,
    pub next: Controller,
}

impl EffectStep {
    pub fn new(effect: Vec<DataStateUpdate>, next: Controller) -> Self {
        Self { effect, next }
    }

    /// Prepend `updates` to this effect.
    pub fn apply_before(self, updates: Vec<DataStateUpdate>) -> Self {
        let mut effect = updates;
        effect.extend(self.effect);
        Self {
            effect,
            next: self.next,
        }
    }

    /// Merge two effect steps.
    ///
    /// The merged effect is this effect followed by `other`'s; the merged
    /// continuation is `combinator(self.next, other.next)`.
    pub fn parallel<F>(self, combinator: F, other: EffectStep) -> Self
    where
        F: FnOnce(Controller, Controller) -> Controller,
    {
        let mut effect = self.effect;
        effect.extend(other.effect);
        Self {
            effect,
            next: combinator(self.next, other.next),
        }
    }
}

/// Number of steps a step controller waits
#[derive(Clone)]
enum StepCount {
    Fixed(i64),
    Computed(StepFunction),
}

#[derive(Clone)]
enum Node {
    Nil,
    Action {
        action: UpdateFunction,
        next: Controller,
    },
    Assignment {
        guard: Option<DataStatePredicate>,
        assignment: UpdateFunction,
        next: Controller,
    },
    Step {
        steps: StepCount,
        next: Controller,
    },
    IfThenElse {
        guard: DataStatePredicate,
        then_branch: Controller,
        else_branch: Controller,
    },
    Parallel {
        left: Controller,
        right: Controller,
    },
    ProbabilisticInterleaving {
        weight: f64,
        left: Controller,
        right: Controller,
    },
    Reference {
        name: Arc<str>,
        slot: Arc<OnceLock<Controller>>,
    },
}

/// Immutable recursive controller
#[derive(Clone)]
pub struct Controller {
    node: Arc<Node>,
}

impl Controller {
    fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// Terminal controller: no effect, forever.
    pub fn nil() -> Self {
        Self::from_node(Node::Nil)
    }

    /// Emit `action(rng, state)` and continue as `next`.
    pub fn action(action: UpdateFunction, next: Controller) -> Self {
        Self::from_node(Node::Action { action, next })
    }

    /// Behave as `next`, with `assignment(rng, state)` emitted before its effect.
    pub fn assignment(assignment: UpdateFunction, next: Controller) -> Self {
        Self::from_node(Node::Assignment {
            guard: None,
            assignment,
            next,
        })
    }

    /// Like [`Controller::assignment`], emitting the assignment only when `guard` holds.
    pub fn guarded_assignment(
        guard: DataStatePredicate,
        assignment: UpdateFunction,
        next: Controller,
    ) -> Self {
        Self::from_node(Node::Assignment {
            guard: Some(guard),
            assignment,
            next,
        })
    }

    /// Wait `steps` steps without effect, then behave as `next`.
    pub fn step(steps: i64, next: Controller) -> Self {
        Self::from_node(Node::Step {
            steps: StepCount::Fixed(steps),
            next,
        })
    }

    /// Wait a number of steps computed from the current state.
    pub fn step_with(steps: StepFunction, next: Controller) -> Self {
        Self::from_node(Node::Step {
            steps: StepCount::Computed(steps),
            next,
        })
    }

    pub fn if_then_else(
        guard: DataStatePredicate,
        then_branch: Controller,
        else_branch: Controller,
    ) -> Self {
        Self::from_node(Node::IfThenElse {
            guard,
            then_branch,
            else_branch,
        })
    }

    /// Run both controllers against the same state every step.
    pub fn parallel(left: Controller, right: Controller) -> Self {
        Self::from_node(Node::Parallel { left, right })
    }

    /// At each step advance `left` with probability `weight`, `right` otherwise.
    pub fn probabilistic_interleaving(
        weight: f64,
        left: Controller,
        right: Controller,
    ) -> Result<Self, SpearError> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(SpearError::InvalidWeight(weight));
        }
        Ok(Self::from_node(Node::ProbabilisticInterleaving {
            weight,
            left,
            right,
        }))
    }

    pub fn is_nil(&self) -> bool {
        matches!(*self.node, Node::Nil)
    }

    /// Perform one step from `state`.
    ///
    /// # Panics
    /// If a registry reference reached by this step is still unbound.
    pub fn next(&self, rng: &mut dyn RngCore, state: &DataState) -> EffectStep {
        match &*self.node {
            Node::Nil => EffectStep::new(Vec::new(), self.clone()),
            Node::Action { action, next } => EffectStep::new(action(rng, state), next.clone()),
            Node::Assignment {
                guard,
                assignment,
                next,
            } => {
                let inner = next.next(rng, state);
                let enabled = match guard {
                    Some(guard) => guard(rng, state),
                    None => true,
                };
                if enabled {
                    inner.apply_before(assignment(rng, state))
                } else {
                    inner
                }
            }
            Node::Step { steps, next } => {
                let remaining = match steps {
                    StepCount::Fixed(n) => *n,
                    StepCount::Computed(f) => f(rng, state),
                };
                if remaining <= 0 {
                    EffectStep::new(Vec::new(), next.clone())
                } else {
                    EffectStep::new(Vec::new(), Controller::step(remaining - 1, next.clone()))
                }
            }
            Node::IfThenElse {
                guard,
                then_branch,
                else_branch,
            } => {
                if guard(rng, state) {
                    then_branch.next(rng, state)
                } else {
                    else_branch.next(rng, state)
                }
            }
            Node::Parallel { left, right } => {
                let left_step = left.next(rng, state);
                let right_step = right.next(rng, state);
                left_step.parallel(Controller::parallel, right_step)
            }
            Node::ProbabilisticInterleaving {
                weight,
                left,
                right,
            } => {
                let u: f64 = rng.gen();
                if u < *weight {
                    let step = left.next(rng, state);
                    let next = Self::from_node(Node::ProbabilisticInterleaving {
                        weight: *weight,
                        left: step.next,
                        right: right.clone(),
                    });
                    EffectStep::new(step.effect, next)
                } else {
                    let step = right.next(rng, state);
                    let next = Self::from_node(Node::ProbabilisticInterleaving {
                        weight: *weight,
                        left: left.clone(),
                        right: step.next,
                    });
                    EffectStep::new(step.effect, next)
                }
            }
            Node::Reference { name, slot } => match slot.get() {
                Some(controller) => controller.next(rng, state),
                None => panic!("controller reference `{name}` is not bound"),
            },
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.node {
            Node::Nil => f.write_str("Nil"),
            Node::Action { .. } => f.write_str("Action"),
            Node::Assignment { .. } => f.write_str("Assignment"),
            Node::Step {
                steps: StepCount::Fixed(n),
                ..
            } => write!(f, "Step({n})"),
            Node::Step { .. } => f.write_str("Step(?)"),
            Node::IfThenElse { .. } => f.write_str("IfThenElse"),
            Node::Parallel { left, right } => write!(f, "Parallel({left:?}, {right:?})"),
            Node::ProbabilisticInterleaving {
                weight,
                left,
                right,
            } => write!(f, "ProbabilisticInterleaving({weight}, {left:?}, {right:?})"),
            Node::Reference { name, .. } => write!(f, "Ref({name})"),
        }
    }
}

/// Named controller definitions that may refer to each other
///
/// References can be taken before the corresponding definition is set, which
/// is how recursive controllers are tied together.
#[derive(Default)]
pub struct ControllerRegistry {
    slots: Mutex<BTreeMap<String, (Arc<str>, Arc<OnceLock<Controller>>)>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller behaving as the definition bound to `name`.
    pub fn reference(&self, name: &str) -> Controller {
        let (name, slot) = self.slot(name);
        Controller::from_node(Node::Reference { name, slot })
    }

    /// Bind `name` to `controller`.
    pub fn set(&self, name: &str, controller: Controller) -> Result<(), SpearError> {
        let (_, slot) = self.slot(name);
        slot.set(controller)
            .map_err(|_| SpearError::DuplicateController(name.to_string()))
    }

    /// Bound definition of `name`, if any.
    pub fn get(&self, name: &str) -> Option<Controller> {
        self.slots
            .lock()
            .get(name)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Check that every referenced name has a definition.
    pub fn validate(&self) -> Result<(), SpearError> {
        let slots = self.slots.lock();
        match slots.iter().find(|(_, (_, slot))| slot.get().is_none()) {
            Some((name, _)) => Err(SpearError::UnboundController(name.clone())),
            None => Ok(()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    fn slot(&self, name: &str) -> (Arc<str>, Arc<OnceLock<Controller>>) {
        let mut slots = self.slots.lock();
        let (name, slot) = slots
            .entry(name.to_string())
            .or_insert_with(|| (Arc::from(name), Arc::new(OnceLock::new())));
        (Arc::clone(name), Arc::clone(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn state() -> DataState {
        DataState::with_default_ranges(vec![0.0, 0.0, 0.0])
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(11)
    }

    fn indices(step: &EffectStep) -> Vec<usize> {
        step.effect.iter().map(|u| u.index).collect()
    }

    #[test]
    fn test_action_emits_effect_and_moves_on() {
        let controller = Controller::action(DataStateUpdate::set(0, 1.0), Controller::nil());
        let step = controller.next(&mut rng(), &state());
        assert_eq!(step.effect, vec![DataStateUpdate::new(0, 1.0)]);
        assert!(step.next.is_nil());
    }

    #[test]
    fn test_assignment_prepends_before_inner_effect() {
        let inner = Controller::action(DataStateUpdate::set(1, 2.0), Controller::nil());
        let controller = Controller::assignment(DataStateUpdate::set(0, 1.0), inner);
        let step = controller.next(&mut rng(), &state());
        assert_eq!(indices(&step), vec![0, 1]);
        assert!(step.next.is_nil());
    }

    #[test]
    fn test_assignment_inner_reads_pre_step_state() {
        let inner = Controller::action(
            Arc::new(|_, ds| vec![DataStateUpdate::new(1, ds.get(0) + 10.0)]),
            Controller::nil(),
        );
        let controller = Controller::assignment(DataStateUpdate::set(0, 5.0), inner);
        let step = controller.next(&mut rng(), &state());
        assert_eq!(step.effect[1], DataStateUpdate::new(1, 10.0));
    }

    #[test]
    fn test_guarded_assignment_skips_when_guard_fails() {
        let inner = Controller::action(DataStateUpdate::set(1, 2.0), Controller::nil());
        let controller = Controller::guarded_assignment(
            crate::ds::greater_than(0, 1.0),
            DataStateUpdate::set(0, 1.0),
            inner,
        );
        let step = controller.next(&mut rng(), &state());
        assert_eq!(indices(&step), vec![1]);
    }

    #[test]
    fn test_step_waits_then_delegates() {
        let target = Controller::action(DataStateUpdate::set(2, 7.0), Controller::nil());
        let mut controller = Controller::step(2, target);
        let mut rng = rng();
        let ds = state();
        let mut effects = Vec::new();
        for _ in 0..4 {
            let step = controller.next(&mut rng, &ds);
            effects.push(step.effect.len());
            controller = step.next;
        }
        // two waiting steps, one step handing over, then the action fires
        assert_eq!(effects, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_step_with_non_positive_count_delegates_immediately() {
        let target = Controller::action(DataStateUpdate::set(2, 7.0), Controller::nil());
        let controller = Controller::step_with(Arc::new(|_, _| -3), target);
        let step = controller.next(&mut rng(), &state());
        assert!(step.effect.is_empty());
        let fired = step.next.next(&mut ChaCha8Rng::seed_from_u64(0), &state());
        assert_eq!(fired.effect.len(), 1);
    }

    #[test]
    fn test_if_then_else_selects_branch() {
        let controller = Controller::if_then_else(
            crate::ds::equals(0, 0.0),
            Controller::action(DataStateUpdate::set(1, 1.0), Controller::nil()),
            Controller::action(DataStateUpdate::set(2, 1.0), Controller::nil()),
        );
        assert_eq!(indices(&controller.next(&mut rng(), &state())), vec![1]);
        let other = state().apply(&[DataStateUpdate::new(0, 3.0)]);
        assert_eq!(indices(&controller.next(&mut rng(), &other)), vec![2]);
    }

    #[test]
    fn test_parallel_concatenates_and_continues_in_parallel() {
        let a = Controller::action(DataStateUpdate::set(0, 1.0), Controller::nil());
        let b = Controller::action(DataStateUpdate::set(1, 1.0), Controller::nil());
        let step = Controller::parallel(a, b).next(&mut rng(), &state());
        assert_eq!(indices(&step), vec![0, 1]);
        assert_eq!(format!("{:?}", step.next), "Parallel(Nil, Nil)");
    }

    #[test]
    fn test_parallel_is_commutative_in_content() {
        let a = Controller::action(
            Arc::new(|rng, _| vec![DataStateUpdate::new(0, rng.gen::<f64>())]),
            Controller::nil(),
        );
        let b = Controller::action(DataStateUpdate::set(1, 4.0), Controller::nil());
        let ab = Controller::parallel(a.clone(), b.clone()).next(&mut rng(), &state());
        let ba = Controller::parallel(b, a).next(&mut rng(), &state());
        let key = |u: &DataStateUpdate| (u.index, u.value.to_bits());
        let mut left: Vec<_> = ab.effect.iter().map(key).collect();
        let mut right: Vec<_> = ba.effect.iter().map(key).collect();
        left.sort_unstable();
        right.sort_unstable();
        assert_eq!(left, right);
    }

    fn interleaving(weight: f64) -> Controller {
        let left = Controller::action(DataStateUpdate::set(0, 1.0), Controller::nil());
        let right = Controller::action(DataStateUpdate::set(1, 1.0), Controller::nil());
        Controller::probabilistic_interleaving(weight, left, right).unwrap()
    }

    fn left_frequency(weight: f64, trials: usize) -> f64 {
        let controller = interleaving(weight);
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let ds = state();
        let left = (0..trials)
            .filter(|_| controller.next(&mut rng, &ds).effect[0].index == 0)
            .count();
        left as f64 / trials as f64
    }

    #[test]
    fn test_interleaving_extremes_are_exact() {
        assert_eq!(left_frequency(0.0, 2_000), 0.0);
        assert_eq!(left_frequency(1.0, 2_000), 1.0);
    }

    #[test]
    fn test_interleaving_frequency_converges_to_weight() {
        let freq = left_frequency(0.3, 20_000);
        assert!((freq - 0.3).abs() < 0.02, "frequency {freq}");
    }

    #[test]
    fn test_interleaving_holds_the_idle_side() {
        let left = Controller::action(
            DataStateUpdate::set(0, 1.0),
            Controller::action(DataStateUpdate::set(0, 2.0), Controller::nil()),
        );
        let right = Controller::action(DataStateUpdate::set(1, 1.0), Controller::nil());
        let controller = Controller::probabilistic_interleaving(1.0, left, right).unwrap();
        let mut rng = rng();
        let first = controller.next(&mut rng, &state());
        let second = first.next.next(&mut rng, &state());
        assert_eq!(second.effect, vec![DataStateUpdate::new(0, 2.0)]);
    }

    #[test]
    fn test_interleaving_rejects_bad_weight() {
        let err = Controller::probabilistic_interleaving(1.5, Controller::nil(), Controller::nil())
            .unwrap_err();
        assert!(matches!(err, SpearError::InvalidWeight(w) if w == 1.5));
    }

    #[test]
    fn test_registry_ties_recursive_definitions() {
        let registry = ControllerRegistry::new();
        registry
            .set(
                "Ping",
                Controller::action(DataStateUpdate::set(0, 1.0), registry.reference("Pong")),
            )
            .unwrap();
        registry
            .set(
                "Pong",
                Controller::action(DataStateUpdate::set(0, 0.0), registry.reference("Ping")),
            )
            .unwrap();
        registry.validate().unwrap();

        let mut controller = registry.reference("Ping");
        let mut rng = rng();
        let values: Vec<f64> = (0..4)
            .map(|_| {
                let step = controller.next(&mut rng, &state());
                controller = step.next;
                step.effect[0].value
            })
            .collect();
        assert_eq!(values, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_registry_reports_unbound_and_duplicates() {
        let registry = ControllerRegistry::new();
        registry
            .set("Main", Controller::step(1, registry.reference("Missing")))
            .unwrap();
        assert!(matches!(
            registry.validate(),
            Err(SpearError::UnboundController(name)) if name == "Missing"
        ));
        assert!(matches!(
            registry.set("Main", Controller::nil()),
            Err(SpearError::DuplicateController(_))
        ));
        assert_eq!(registry.names(), vec!["Main".to_string(), "Missing".to_string()]);
        assert!(registry.get("Missing").is_none());
        assert!(registry.get("Unknown").is_none());
        assert_eq!(format!("{:?}", registry.get("Main").unwrap()), "Step(1)");
    }

    proptest! {
        #[test]
        fn apply_before_is_associative(
            u1 in proptest::collection::vec((0usize..3, -1.0f64..1.0), 0..4),
            u2 in proptest::collection::vec((0usize..3, -1.0f64..1.0), 0..4),
            base in proptest::collection::vec((0usize..3, -1.0f64..1.0), 0..4),
        ) {
            let to_updates = |v: &Vec<(usize, f64)>| -> Vec<DataStateUpdate> {
                v.iter().map(|&(i, x)| DataStateUpdate::new(i, x)).collect()
            };
            let step = EffectStep::new(to_updates(&base), Controller::nil());
            let nested = step.clone().apply_before(to_updates(&u2)).apply_before(to_updates(&u1));
            let mut joined = to_updates(&u1);
            joined.extend(to_updates(&u2));
            let flat = step.apply_before(joined);
            prop_assert_eq!(nested.effect, flat.effect);
        }
    }
}
