//! Common test helpers for estimator integration tests

#![allow(dead_code)]

use std::sync::Arc;

use healthkf::estimators::EstimatorSetup;
use healthkf::interface::Timeseries;
use healthkf::types::containers::{
    broadcast_rows, common_batch_size, HealthParameters, Quantities,
};
use healthkf::models::CellModel;
use healthkf::{Error, Result};
use nalgebra::{dmatrix, DMatrix};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Prior variance of the transients: SOC uniform on [0, 1], hysteresis on [-1, 1]
pub fn transient_covariance() -> DMatrix<f64> {
    DMatrix::from_diagonal(&nalgebra::dvector![1.0 / 12.0, 4.0 / 12.0])
}

pub fn asoh_covariance() -> DMatrix<f64> {
    dmatrix![2.5e-5]
}

pub const VOLTAGE_ERROR: f64 = 1.0e-3;

pub fn sensor_noise() -> DMatrix<f64> {
    dmatrix![(VOLTAGE_ERROR / 2.0).powi(2)]
}

pub fn asoh_process_noise() -> DMatrix<f64> {
    dmatrix![1e-10]
}

pub fn transient_process_noise() -> DMatrix<f64> {
    DMatrix::identity(2, 2) * 1e-8
}

// ============================================================================
// Series-resistance circuit with hysteresis
// ============================================================================

/// Equivalent circuit with an open-circuit voltage, a series resistance and a
/// hysteresis element.
///
/// Transients: `soc`, `hyst`. Inputs: `time` (s), `current` (A, positive
/// charges). Health: `q_t` (A·h), `r0` (Ω), `h0` (V). Output:
/// `terminal_voltage`.
#[derive(Debug, Clone)]
pub struct RintModel {
    /// Decay rate of the hysteresis per unit of charge throughput
    pub gamma: f64,
    /// OCV is `ocv_min + ocv_slope * soc`
    pub ocv_min: f64,
    pub ocv_slope: f64,
}

impl Default for RintModel {
    fn default() -> Self {
        Self {
            gamma: 50.0,
            ocv_min: 3.0,
            ocv_slope: 1.2,
        }
    }
}

fn health_column(health: &HealthParameters<f64>, name: &str) -> Result<DMatrix<f64>> {
    health
        .parameter(name)
        .cloned()
        .ok_or_else(|| Error::UnknownParameter(name.to_string()))
}

impl CellModel<f64> for RintModel {
    fn update_transient_state(
        &self,
        previous_inputs: &Quantities<f64>,
        new_inputs: &Quantities<f64>,
        transients: &Quantities<f64>,
        health: &HealthParameters<f64>,
    ) -> Result<Quantities<f64>> {
        let q_t = health_column(health, "q_t")?;
        let h0 = health_column(health, "h0")?;
        let batch = common_batch_size(&[
            previous_inputs.values(),
            new_inputs.values(),
            transients.values(),
            &q_t,
            &h0,
        ])?;
        let prev = broadcast_rows(previous_inputs.values(), batch)?;
        let new = broadcast_rows(new_inputs.values(), batch)?;
        let state = broadcast_rows(transients.values(), batch)?;
        let q_t = broadcast_rows(&q_t, batch)?;
        let h0 = broadcast_rows(&h0, batch)?;

        let mut out = DMatrix::zeros(batch, 2);
        for i in 0..batch {
            let dt = new[(i, 0)] - prev[(i, 0)];
            let current = new[(i, 1)];
            let throughput = current * dt / (3600.0 * q_t[(i, 0)]);
            out[(i, 0)] = state[(i, 0)] + throughput;

            let decay = (-self.gamma * throughput.abs()).exp();
            let target = h0[(i, 0)] * current.signum();
            out[(i, 1)] = decay * state[(i, 1)] + (1.0 - decay) * target;
        }
        transients.make_copy(out)
    }

    fn calculate_outputs(
        &self,
        inputs: &Quantities<f64>,
        transients: &Quantities<f64>,
        health: &HealthParameters<f64>,
    ) -> Result<Quantities<f64>> {
        let r0 = health_column(health, "r0")?;
        let batch = common_batch_size(&[inputs.values(), transients.values(), &r0])?;
        let inputs = broadcast_rows(inputs.values(), batch)?;
        let state = broadcast_rows(transients.values(), batch)?;
        let r0 = broadcast_rows(&r0, batch)?;

        let voltage = DMatrix::from_fn(batch, 1, |i, _| {
            let ocv = self.ocv_min + self.ocv_slope * state[(i, 0)];
            ocv + state[(i, 1)] + r0[(i, 0)] * inputs[(i, 1)]
        });
        Quantities::new(vec!["terminal_voltage".into()], voltage)
    }
}

/// Health parameters of the simulated cell, with only `r0` updatable.
pub fn rint_health(r0: f64) -> HealthParameters<f64> {
    HealthParameters::new()
        .with_parameter("q_t", &[10.0], false)
        .and_then(|h| h.with_parameter("r0", &[r0], false))
        .and_then(|h| h.with_parameter("h0", &[0.05], false))
        .and_then(|mut h| {
            h.mark_updatable("r0")?;
            Ok(h)
        })
        .expect("valid health parameters")
}

pub fn rint_transients(soc: f64) -> Quantities<f64> {
    Quantities::from_slice(&["soc", "hyst"], &[soc, 0.0]).expect("valid transients")
}

pub fn rint_inputs() -> Quantities<f64> {
    Quantities::from_slice(&["time", "current"], &[0.0, 0.0]).expect("valid inputs")
}

/// Estimator settings for the standard scenario, starting from a wrong SOC
/// and a wrong resistance.
pub fn rint_setup() -> EstimatorSetup<f64> {
    EstimatorSetup::new(
        rint_transients(0.5),
        rint_health(0.045),
        rint_inputs(),
        transient_covariance(),
        asoh_covariance(),
    )
    .with_transient_process_noise(transient_process_noise())
    .with_asoh_process_noise(asoh_process_noise())
    .with_sensor_noise(sensor_noise())
}

pub fn rint_model() -> Arc<RintModel> {
    Arc::new(RintModel::default())
}

// ============================================================================
// Synthetic data
// ============================================================================

/// Simulates the true cell under a square-wave current and records noisy
/// voltages. Cycles change every `steps_per_cycle` records.
pub fn make_timeseries(num_steps: usize, steps_per_cycle: usize, seed: u64) -> Timeseries {
    let model = RintModel::default();
    let health = rint_health(0.05);
    let mut transients = rint_transients(0.6);
    let mut inputs = rint_inputs();

    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, VOLTAGE_ERROR / 2.0).expect("valid noise");

    let mut dataset = Timeseries::new(&["time", "current"], &["terminal_voltage"]);
    for k in 0..num_steps {
        let time = 30.0 * (k + 1) as f64;
        let current = if (k / 10) % 2 == 0 { 2.0 } else { -2.0 };
        let new_inputs = Quantities::from_slice(&["time", "current"], &[time, current])
            .expect("valid inputs");

        transients = model
            .update_transient_state(&inputs, &new_inputs, &transients, &health)
            .expect("simulation step");
        let voltage = model
            .calculate_outputs(&new_inputs, &transients, &health)
            .expect("simulated voltage")
            .values()[(0, 0)];
        inputs = new_inputs;

        let cycle = (k / steps_per_cycle.max(1)) as u64;
        dataset
            .push(time, cycle, &[time, current], &[voltage + noise.sample(&mut rng)])
            .expect("valid record");
    }
    dataset
}

/// A scratch file path unique to one test.
pub fn scratch_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("healthkf-{}-{}.json", std::process::id(), name))
}

/// Installs a test log subscriber; repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
