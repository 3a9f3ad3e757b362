//! Engine cooling model
//!
//! Two controllers run side by side on an engine. `Ctrl` switches the
//! cooling on whenever the sensed temperature gets close to 100 degrees and
//! otherwise forwards the requested speed. `IDS` raises a warning and slows
//! the engine down when the real temperature is high while the cooling is
//! off. The perturbation makes the temperature sensor read low for `N`
//! steps; the formula asks whether a noticeable offset is eventually caught
//! by the warning or stresses the engine.
//!
//! ```text
//! cargo run --example engine -- --ensemble-size 50 --horizon 20
//! RUST_LOG=spear=debug cargo run --example engine
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rand::{Rng, RngCore};
use spear::ds::{both, equals, greater_or_equal, greater_than};
use spear::perturbation::gaussian_noise;
use spear::{
    Controller, ControllerRegistry, ControlledSystem, DataRange, DataState, DataStateUpdate,
    Distance, EvaluationConfig, EvolutionSequence, Perturbation,
    RelationOperator, RobustnessAtom, RobustnessFormula, Semantics, SimulationMonitor, SystemState,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

// cells
const P1: usize = 0;
const P6: usize = 5;
const STRESS: usize = 6;
const TEMP: usize = 7;
const CH_TEMP: usize = 8;
const COOL: usize = 9;
const CH_SPEED: usize = 10;
const CH_WRN: usize = 11;
const CH_IN: usize = 12;
const CH_OUT: usize = 13;
const CELLS: usize = 14;

// modes
const ON: f64 = 0.0;
const OFF: f64 = 1.0;
const SLOW: f64 = 2.0;
const HALF: f64 = 3.0;
const FULL: f64 = 4.0;
const OK: f64 = 5.0;
const HOT: f64 = 6.0;
const LOW: f64 = 7.0;

const MIN_TEMP: f64 = 0.0;
const MAX_TEMP: f64 = 150.0;
const INITIAL_TEMP: f64 = 95.0;
const STRESS_INCR: f64 = 0.1;
const TEMP_OFFSET: f64 = -1.5;

/// Length of the sensor attack.
const N: usize = 100;
/// Steps before the sensor offset is observed.
const TAU: usize = 100;
/// End of the window where warnings and stress are observed.
const K: usize = TAU + N + 10;

const ETA1: f64 = 0.0;
const ETA2: f64 = 0.02;
const ETA3: f64 = 0.035;
const ETA4: f64 = 0.3;

#[derive(Debug, Parser)]
#[command(about = "Robustness of an engine cooling controller under a sensor attack")]
struct Args {
    /// TOML evaluation config; the flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    ensemble_size: Option<usize>,
    #[arg(long)]
    sample_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Steps of the unperturbed evolution to summarize
    #[arg(long, default_value_t = 300)]
    steps: usize,
    /// Upper bound of the `eventually` window of the robustness formula
    #[arg(long, default_value_t = 50)]
    horizon: usize,
}

struct StepLogger;

impl SimulationMonitor for StepLogger {
    fn start_samplings_of_step(&self, step: usize) {
        debug!(step, "sampling");
    }

    fn end_samplings_of_step(&self, step: usize) {
        if step % 50 == 0 {
            info!(step, "simulated");
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("engine=info,spear=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EvaluationConfig::from_toml_file(path)?,
        None => EvaluationConfig::default(),
    };
    if let Some(ensemble_size) = args.ensemble_size {
        config.ensemble_size = ensemble_size;
    }
    if let Some(sample_size) = args.sample_size {
        config.sample_size = sample_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;
    info!(?config, steps = args.steps, horizon = args.horizon, "engine model");

    let registry = controllers()?;
    registry.validate()?;
    let controller = Controller::parallel(registry.reference("Ctrl"), registry.reference("IDS"));
    let system = ControlledSystem::new(controller, Arc::new(environment), initial_state(INITIAL_TEMP));
    let sequence = EvolutionSequence::from_system(system, config.ensemble_size, config.seed)
        .with_monitor(Arc::new(StepLogger));

    for step in (0..=args.steps).step_by(25) {
        let ensemble = sequence.get(step);
        let temps: Vec<f64> = ensemble.iter().map(|s| s.data_state().get(TEMP)).collect();
        let mean = temps.iter().sum::<f64>() / temps.len() as f64;
        let max = temps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let cooling = ensemble
            .iter()
            .filter(|s| s.data_state().get(COOL) == ON)
            .count();
        info!(step, mean_temp = mean, max_temp = max, cooling, "ensemble");
    }

    let gap = Distance::leq(Arc::new(|ds: &DataState| {
        (ds.get(TEMP) - ds.get(CH_TEMP)).abs() / (MAX_TEMP - MIN_TEMP)
    }));
    let stress = Distance::leq(Arc::new(|ds: &DataState| ds.get(STRESS)));
    let noise = Perturbation::iterative(N, Perturbation::atomic(0, gaussian_noise(CH_TEMP, 1.0)?));
    for (name, perturbation) in [("offset", sensor_attack()), ("noise", noise)] {
        let distances = sequence.compute(&perturbation, 0, config.sample_size, &gap, TAU, TAU + 10);
        info!(perturbation = name, ?distances, "sensor gap");
        let perturbed = sequence.apply(&perturbation, 0, config.sample_size);
        for (offset, row) in sequence
            .distance_table(&perturbed, K - 4, K, &[&gap, &stress])
            .iter()
            .enumerate()
        {
            debug!(perturbation = name, step = K - 4 + offset, gap = row[0], stress = row[1], "distances");
        }
    }

    let formula = robustness_formula(args.horizon)?;
    let boolean = config.boolean().compile(&formula)(config.sample_size, 0, &sequence);
    info!(verdict = boolean, "boolean semantics");
    let three_valued = config.three_valued().compile(&formula)(config.sample_size, 0, &sequence);
    info!(verdict = %three_valued, "three-valued semantics");
    let degree = config.quantitative().compile(&formula)(config.sample_size, 0, &sequence);
    info!(degree, "quantitative semantics");
    let series = formula.eval_range_with(&config.boolean(), config.sample_size, 0, 30, 10, &sequence)?;
    info!(?series, "boolean verdicts at steps 0, 10 and 20");
    Ok(())
}

fn controllers() -> Result<ControllerRegistry> {
    let registry = ControllerRegistry::new();
    registry.set(
        "Ctrl",
        Controller::if_then_else(
            greater_or_equal(CH_TEMP, 99.8),
            Controller::action(DataStateUpdate::set(COOL, ON), registry.reference("Cooling")),
            registry.reference("Check"),
        ),
    )?;
    registry.set("Cooling", Controller::step(4, registry.reference("Check")))?;
    registry.set(
        "Check",
        Controller::if_then_else(
            equals(CH_SPEED, SLOW),
            Controller::action(
                Arc::new(|_, _| vec![DataStateUpdate::new(CH_SPEED, SLOW), DataStateUpdate::new(COOL, OFF)]),
                registry.reference("Ctrl"),
            ),
            Controller::action(
                Arc::new(|_, ds| {
                    vec![
                        DataStateUpdate::new(CH_SPEED, ds.get(CH_IN)),
                        DataStateUpdate::new(COOL, OFF),
                    ]
                }),
                registry.reference("Ctrl"),
            ),
        ),
    )?;
    registry.set(
        "IDS",
        Controller::if_then_else(
            both(greater_than(TEMP, 101.0), equals(COOL, OFF)),
            Controller::action(
                Arc::new(|_, _| {
                    vec![
                        DataStateUpdate::new(CH_WRN, HOT),
                        DataStateUpdate::new(CH_SPEED, LOW),
                        DataStateUpdate::new(CH_OUT, FULL),
                    ]
                }),
                registry.reference("IDS"),
            ),
            Controller::action(
                Arc::new(|_, _| {
                    vec![
                        DataStateUpdate::new(CH_WRN, OK),
                        DataStateUpdate::new(CH_SPEED, HALF),
                        DataStateUpdate::new(CH_OUT, HALF),
                    ]
                }),
                registry.reference("IDS"),
            ),
        ),
    )?;
    Ok(registry)
}

fn environment(rng: &mut dyn RngCore, ds: &DataState) -> Vec<DataStateUpdate> {
    let mut updates = Vec::with_capacity(9);
    updates.push(DataStateUpdate::new(P1, ds.get(TEMP)));
    for cell in P1 + 1..=P6 {
        updates.push(DataStateUpdate::new(cell, ds.get(cell - 1)));
    }
    let hot = (P1..=P6).filter(|&cell| ds.get(cell) >= 100.0).count();
    if hot > 3 {
        updates.push(DataStateUpdate::new(STRESS, (ds.get(STRESS) + STRESS_INCR).clamp(0.0, 1.0)));
    }
    let next = (ds.get(TEMP) + temperature_variation(rng, ds)).clamp(MIN_TEMP, MAX_TEMP);
    updates.push(DataStateUpdate::new(TEMP, next));
    updates.push(DataStateUpdate::new(CH_TEMP, next));
    updates
}

fn temperature_variation(rng: &mut dyn RngCore, ds: &DataState) -> f64 {
    let u: f64 = rng.gen();
    if ds.get(COOL) == ON {
        -1.2 + u * 0.4
    } else if ds.get(CH_SPEED) == SLOW {
        0.1 + u * 0.2
    } else if ds.get(CH_SPEED) == HALF {
        0.3 + u * 0.4
    } else {
        0.7 + u * 0.5
    }
}

fn initial_state(temp: f64) -> DataState {
    let temperature = DataRange::new(MIN_TEMP, MAX_TEMP);
    let ranges = (0..CELLS)
        .map(|cell| match cell {
            STRESS => DataRange::new(0.0, 1.0),
            P1..=P6 | TEMP | CH_TEMP => temperature,
            _ => DataRange::new(ON, LOW),
        })
        .collect();
    DataState::from_fn(ranges, |cell| match cell {
        P1..=P6 | TEMP | CH_TEMP => temp,
        COOL => OFF,
        CH_SPEED | CH_IN => HALF,
        _ => 0.0,
    })
}

/// The sensor reads up to 1.5 degrees low for `N` consecutive steps.
fn sensor_attack() -> Perturbation {
    Perturbation::iterative(
        N,
        Perturbation::atomic(
            0,
            Arc::new(|rng, ds| {
                let offset = rng.gen::<f64>() * TEMP_OFFSET;
                ds.apply(&[DataStateUpdate::new(CH_TEMP, ds.get(TEMP) + offset)])
            }),
        ),
    )
}

fn robustness_formula(horizon: usize) -> Result<RobustnessFormula> {
    let gap = Distance::leq(Arc::new(|ds: &DataState| {
        (ds.get(TEMP) - ds.get(CH_TEMP)).abs() / (MAX_TEMP - MIN_TEMP)
    }));
    let warning = Distance::leq(Arc::new(|ds: &DataState| if ds.get(CH_WRN) == HOT { 1.0 } else { 0.0 }));
    let stress = Distance::leq(Arc::new(|ds: &DataState| ds.get(STRESS)));

    let atom = |distance: Distance, relop, threshold| {
        RobustnessFormula::atom(RobustnessAtom::new(sensor_attack(), distance, relop, threshold))
    };
    let offset_seen = atom(
        Distance::min_interval(gap.clone(), TAU, TAU + N)?,
        RelationOperator::Ge,
        ETA1,
    );
    let offset_bounded = atom(Distance::max_interval(gap, TAU, TAU + N)?, RelationOperator::Le, ETA2);
    let warned = atom(Distance::max_interval(warning, TAU, K)?, RelationOperator::Le, ETA3);
    let stressed = atom(Distance::max_interval(stress, TAU, K)?, RelationOperator::Gt, ETA4);

    let property = RobustnessFormula::implication(
        RobustnessFormula::conjunction(offset_seen, offset_bounded),
        RobustnessFormula::conjunction(warned, stressed),
    );
    Ok(RobustnessFormula::eventually(property, 0, horizon)?)
}

