//! Data states
//!
//! A data state is a fixed-size vector of real cells, each clamped to its own
//! range. States are never mutated once built: applying updates yields a new
//! state sharing the range table of the receiver.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use crate::SpearError;

/// Function computing the updates produced in one step.
pub type UpdateFunction =
    Arc<dyn Fn(&mut dyn RngCore, &DataState) -> Vec<DataStateUpdate> + Send + Sync>;

/// Function sampling a data state from another one.
pub type DataStateFunction = Arc<dyn Fn(&mut dyn RngCore, &DataState) -> DataState + Send + Sync>;

/// Penalty (rho) function evaluated on a single data state.
pub type DataStateExpression = Arc<dyn Fn(&DataState) -> f64 + Send + Sync>;

/// Guard evaluated on a data state.
pub type DataStatePredicate = Arc<dyn Fn(&mut dyn RngCore, &DataState) -> bool + Send + Sync>;

/// Number of steps computed from a data state.
pub type StepFunction = Arc<dyn Fn(&mut dyn RngCore, &DataState) -> i64 + Send + Sync>;

/// Closed interval of admissible values for a cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRange {
    pub min: f64,
    pub max: f64,
}

impl DataRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Unbounded range `(-inf, +inf)`
    pub fn unbounded() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }

    /// Nearest admissible value; NaN stays NaN.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        self.min.max(self.max.min(value))
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl Default for DataRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Assignment of `value` to the cell at `index`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataStateUpdate {
    pub index: usize,
    pub value: f64,
}

impl DataStateUpdate {
    pub fn new(index: usize, value: f64) -> Self {
        Self { index, value }
    }

    /// Update function that always assigns `value` to cell `index`.
    pub fn set(index: usize, value: f64) -> UpdateFunction {
        Arc::new(move |_, _| vec![DataStateUpdate::new(index, value)])
    }
}

impl fmt::Display for DataStateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<-{}", self.index, self.value)
    }
}

/// Immutable vector of bounded real cells
#[derive(Clone, PartialEq)]
pub struct DataState {
    values: Arc<[f64]>,
    ranges: Arc<[DataRange]>,
}

impl DataState {
    /// Create a data state from per-cell ranges and initial values.
    ///
    /// Values are clamped to their ranges. Fails when the two slices have
    /// different lengths.
    pub fn new(ranges: Vec<DataRange>, values: Vec<f64>) -> Result<Self, SpearError> {
        if ranges.len() != values.len() {
            return Err(SpearError::LengthMismatch {
                context: "data state ranges",
                expected: values.len(),
                got: ranges.len(),
            });
        }
        let values: Vec<f64> = values
            .iter()
            .zip(ranges.iter())
            .map(|(&v, range)| range.clamp(v))
            .collect();
        Ok(Self {
            values: values.into(),
            ranges: ranges.into(),
        })
    }

    /// Create a data state whose cells are all unbounded.
    pub fn with_default_ranges(values: Vec<f64>) -> Self {
        Self {
            ranges: vec![DataRange::unbounded(); values.len()].into(),
            values: values.into(),
        }
    }

    /// Create a data state initialising cell `i` with `init(i)`.
    pub fn from_fn(ranges: Vec<DataRange>, init: impl Fn(usize) -> f64) -> Self {
        let values: Vec<f64> = ranges
            .iter()
            .enumerate()
            .map(|(i, range)| range.clamp(init(i)))
            .collect();
        Self {
            values: values.into(),
            ranges: ranges.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Value of cell `i`.
    ///
    /// # Panics
    /// If `i >= self.size()`.
    pub fn get(&self, i: usize) -> f64 {
        self.values[i]
    }

    /// Range of cell `i`.
    ///
    /// # Panics
    /// If `i >= self.size()`.
    pub fn range(&self, i: usize) -> DataRange {
        self.ranges[i]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Apply `updates` in order and return the resulting state.
    ///
    /// Later updates of the same cell win. The receiver is left untouched.
    ///
    /// # Panics
    /// If an update refers to a cell outside this state.
    pub fn apply<'a, I>(&self, updates: I) -> DataState
    where
        I: IntoIterator<Item = &'a DataStateUpdate>,
    {
        let mut values = self.values.to_vec();
        for update in updates {
            values[update.index] = self.ranges[update.index].clamp(update.value);
        }
        Self {
            values: values.into(),
            ranges: Arc::clone(&self.ranges),
        }
    }
}

impl fmt::Debug for DataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values.iter()).finish()
    }
}

/// Function applying `first` and then `second` to its result.
pub fn compose(first: DataStateFunction, second: DataStateFunction) -> DataStateFunction {
    Arc::new(move |rng, ds| {
        let intermediate = first(rng, ds);
        second(rng, &intermediate)
    })
}

/// Data state function applying the updates computed by `updates`.
pub fn update_function(updates: UpdateFunction) -> DataStateFunction {
    Arc::new(move |rng, ds| {
        let list = updates(rng, ds);
        ds.apply(&list)
    })
}

pub fn equals(index: usize, value: f64) -> DataStatePredicate {
    Arc::new(move |_, ds| ds.get(index) == value)
}

pub fn greater_than(index: usize, value: f64) -> DataStatePredicate {
    Arc::new(move |_, ds| ds.get(index) > value)
}

pub fn greater_or_equal(index: usize, value: f64) -> DataStatePredicate {
    Arc::new(move |_, ds| ds.get(index) >= value)
}

pub fn less_than(index: usize, value: f64) -> DataStatePredicate {
    Arc::new(move |_, ds| ds.get(index) < value)
}

pub fn less_or_equal(index: usize, value: f64) -> DataStatePredicate {
    Arc::new(move |_, ds| ds.get(index) <= value)
}

/// Predicate holding when both `first` and `second` hold.
pub fn both(first: DataStatePredicate, second: DataStatePredicate) -> DataStatePredicate {
    Arc::new(move |rng, ds| first(rng, ds) && second(rng, ds))
}
