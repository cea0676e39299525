//! Joint SOC and Resistance Estimation
//!
//! Simulates a cell with a linear open-circuit voltage and a series
//! resistance under a square-wave current, records noisy terminal voltages,
//! then runs a joint UKF over the record starting from a wrong SOC and a
//! wrong resistance.
//!
//! Set `RUST_LOG=healthkf=debug` to follow the filter step by step.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use healthkf::prelude::*;
use nalgebra::{dmatrix, DMatrix};

// ============================================================================
// Simulation Parameters
// ============================================================================

const NUM_STEPS: usize = 600;
const STEPS_PER_CYCLE: usize = 100;
const DT: f64 = 30.0;
const CURRENT: f64 = 2.0;

/// True cell
const TRUE_SOC: f64 = 0.6;
const TRUE_R0: f64 = 0.05;
const CAPACITY_AH: f64 = 2.5;

/// Voltage sensor noise standard deviation (V)
const VOLTAGE_STD: f64 = 5.0e-4;

// ============================================================================
// Cell model
// ============================================================================

/// Coulomb counter with `ocv = 3.0 + 1.2 * soc` and a series resistance.
///
/// Transients: `soc`. Inputs: `time`, `current`. Health: `q_t` (A·h), `r0`.
struct RintCell;

fn column(health: &HealthParameters<f64>, name: &str) -> Result<DMatrix<f64>> {
    health
        .parameter(name)
        .cloned()
        .ok_or_else(|| Error::UnknownParameter(name.to_string()))
}

impl CellModel<f64> for RintCell {
    fn update_transient_state(
        &self,
        previous_inputs: &Quantities<f64>,
        new_inputs: &Quantities<f64>,
        transients: &Quantities<f64>,
        health: &HealthParameters<f64>,
    ) -> Result<Quantities<f64>> {
        let q_t = column(health, "q_t")?;
        let batch = common_batch_size(&[
            previous_inputs.values(),
            new_inputs.values(),
            transients.values(),
            &q_t,
        ])?;
        let prev = broadcast_rows(previous_inputs.values(), batch)?;
        let new = broadcast_rows(new_inputs.values(), batch)?;
        let soc = broadcast_rows(transients.values(), batch)?;
        let q_t = broadcast_rows(&q_t, batch)?;

        let values = DMatrix::from_fn(batch, 1, |i, _| {
            let charge = new[(i, 1)] * (new[(i, 0)] - prev[(i, 0)]);
            soc[(i, 0)] + charge / (3600.0 * q_t[(i, 0)])
        });
        transients.make_copy(values)
    }

    fn calculate_outputs(
        &self,
        inputs: &Quantities<f64>,
        transients: &Quantities<f64>,
        health: &HealthParameters<f64>,
    ) -> Result<Quantities<f64>> {
        let r0 = column(health, "r0")?;
        let batch = common_batch_size(&[inputs.values(), transients.values(), &r0])?;
        let inputs = broadcast_rows(inputs.values(), batch)?;
        let soc = broadcast_rows(transients.values(), batch)?;
        let r0 = broadcast_rows(&r0, batch)?;

        let voltage = DMatrix::from_fn(batch, 1, |i, _| {
            3.0 + 1.2 * soc[(i, 0)] + r0[(i, 0)] * inputs[(i, 1)]
        });
        Quantities::new(vec!["terminal_voltage".into()], voltage)
    }
}

fn health(r0: f64) -> Result<HealthParameters<f64>> {
    HealthParameters::new()
        .with_parameter("q_t", &[CAPACITY_AH], false)?
        .with_parameter("r0", &[r0], true)
}

// ============================================================================
// Synthetic data
// ============================================================================

fn simulate(seed: u64) -> Result<Timeseries> {
    let model = RintCell;
    let health = health(TRUE_R0)?;
    let mut transients = Quantities::from_slice(&["soc"], &[TRUE_SOC])?;
    let mut inputs = Quantities::from_slice(&["time", "current"], &[0.0, 0.0])?;

    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, VOLTAGE_STD)
        .map_err(|e| Error::InvalidParameter(format!("voltage noise: {e}")))?;

    let mut dataset = Timeseries::new(&["time", "current"], &["terminal_voltage"]);
    for k in 0..NUM_STEPS {
        let time = DT * (k + 1) as f64;
        let current = if (k / 20) % 2 == 0 { CURRENT } else { -CURRENT };
        let new_inputs = Quantities::from_slice(&["time", "current"], &[time, current])?;

        transients =
            model.update_transient_state(&inputs, &new_inputs, &transients, &health)?;
        let voltage =
            model.calculate_outputs(&new_inputs, &transients, &health)?.values()[(0, 0)];
        inputs = new_inputs;

        let cycle = (k / STEPS_PER_CYCLE) as u64;
        dataset.push(time, cycle, &[time, current], &[voltage + noise.sample(&mut rng)])?;
    }
    Ok(dataset)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Joint SOC and Resistance Estimation");
    println!("===================================\n");
    println!("Simulation Parameters:");
    println!("  Steps: {} x {} s", NUM_STEPS, DT);
    println!("  Current: +/-{} A square wave", CURRENT);
    println!("  True SOC: {}, true r0: {} Ohm", TRUE_SOC, TRUE_R0);
    println!("  Voltage noise std: {} V\n", VOLTAGE_STD);

    let dataset = simulate(7)?;

    // Start from a wrong SOC and a resistance 20 % too low
    let setup = EstimatorSetup::new(
        Quantities::from_slice(&["soc"], &[0.5])?,
        health(0.04)?,
        Quantities::from_slice(&["time", "current"], &[0.0, 0.0])?,
        dmatrix![1.0 / 12.0],
        dmatrix![1.0e-4],
    )
    .with_transient_process_noise(dmatrix![1.0e-8])
    .with_asoh_process_noise(dmatrix![1.0e-10])
    .with_sensor_noise(dmatrix![VOLTAGE_STD * VOLTAGE_STD])
    .with_normalized_asoh(true);

    let mut estimator = JointEstimator::initialize_unscented_kalman_filter(
        Arc::new(RintCell),
        setup,
        UkfParams::default(),
    )?;
    let mut writer = StateWriter::new(WriterSettings {
        per_timestep: WritePolicy::Mean,
        per_cycle: WritePolicy::MeanVar,
        resizable: false,
        ..WriterSettings::default()
    });

    let results = run_online_estimate(&dataset, &mut estimator, Some(&mut writer))?;
    println!("Estimated states: {:?}", estimator.state_names());
    println!("Result table: {} x {}\n", results.nrows(), results.ncols());

    println!("Start of each cycle:");
    println!("  {:>6}  {:>8}  {:>10}  {:>12}", "cycle", "soc", "r0", "r0 std");
    for (cycle, record) in writer.read_state_estimates(false)?.enumerate() {
        let (_, state, _) = record?;
        let mean = state.get_mean();
        let variance = state.get_variance();
        println!(
            "  {:>6}  {:>8.4}  {:>10.5}  {:>12.2e}",
            cycle,
            mean[0],
            mean[1],
            variance[1].sqrt()
        );
    }

    let (transients, health) = estimator.get_estimated_state()?;
    let r0 = health.parameter("r0").map_or(f64::NAN, |v| v[(0, 0)]);
    println!("\nFinal estimate:");
    println!("  soc = {:.4}", transients.to_vector()[0]);
    println!("  r0  = {:.5} Ohm (true {})", r0, TRUE_R0);
    Ok(())
}
