//! Unscented Kalman Filter (UKF) over a model wrapper
//!
//! The UKF uses the unscented transform to propagate mean and covariance through
//! nonlinear functions without requiring Jacobian computation. All model
//! evaluations go through a [`ModelWrapper`], one batch of sigma points per
//! call.
//!
//! # Algorithm
//!
//! Each [`step`](UnscentedKalmanFilter::step) runs a predict stage followed by
//! an update stage:
//!
//! 1. draw sigma points from the current posterior and push them through the
//!    transition, then add process noise
//! 2. redraw sigma points from the predicted distribution, push them through
//!    the measurement function, add sensor noise and correct with the gain
//!    `K = Pxy Pyy⁻¹`
//!
//! # Sigma Point Selection
//!
//! This implementation uses the symmetric sigma point selection:
//! - χ₀ = μ (mean)
//! - χᵢ = μ + √((n+λ)P)ᵢ for i = 1...n
//! - χᵢ₊ₙ = μ - √((n+λ)P)ᵢ for i = 1...n
//!
//! where λ = α²(n+κ) - n is the scaling parameter.

use nalgebra::{Cholesky, DMatrix, DVector, RealField};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::models::ModelWrapper;
use crate::types::distribution::MultivariateGaussian;
use crate::{Error, Result};

// ============================================================================
// UKF Parameters
// ============================================================================

/// Choice of the tertiary scaling parameter κ.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kappa<T> {
    /// A fixed value
    Value(T),
    /// κ = 3 - n, which matches the fourth moment of a Gaussian
    Automatic,
}

/// Parameters for the Unscented Kalman Filter.
///
/// These parameters control the sigma point spread and weighting.
///
/// # Defaults
///
/// α=1, β=2, κ=0. With these values λ=0, the central sigma point carries no
/// weight in the mean and the remaining points sit at ±√n standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UkfParams<T> {
    /// Primary scaling parameter (controls sigma point spread)
    ///
    /// Typical values: 1e-4 ≤ α ≤ 1
    pub alpha: T,

    /// Secondary scaling parameter (incorporates prior knowledge of distribution)
    ///
    /// For Gaussian distributions, β=2 is optimal.
    pub beta: T,

    /// Tertiary scaling parameter
    pub kappa: Kappa<T>,
}

impl<T: RealField + Copy> Default for UkfParams<T> {
    fn default() -> Self {
        Self {
            alpha: T::one(),
            beta: nalgebra::convert(2.0),
            kappa: Kappa::Value(T::zero()),
        }
    }
}

impl<T: RealField + Copy> UkfParams<T> {
    /// Creates new UKF parameters, rejecting a non-positive α.
    pub fn new(alpha: T, beta: T, kappa: Kappa<T>) -> Result<Self> {
        if alpha <= T::zero() {
            return Err(Error::InvalidParameter("UKF alpha must be positive".into()));
        }
        Ok(Self { alpha, beta, kappa })
    }

    /// Checks that the parameters produce a valid sigma point set for an
    /// `n`-dimensional state.
    pub fn validate(&self, n: usize) -> Result<()> {
        if self.alpha <= T::zero() {
            return Err(Error::InvalidParameter("UKF alpha must be positive".into()));
        }
        if self.spread(n) <= T::zero() {
            return Err(Error::InvalidParameter(format!(
                "UKF scaling gives n + lambda <= 0 for a {n}-dimensional state"
            )));
        }
        Ok(())
    }

    #[inline]
    fn kappa(&self, n: usize) -> T {
        match self.kappa {
            Kappa::Value(k) => k,
            Kappa::Automatic => nalgebra::convert(3.0 - n as f64),
        }
    }

    /// Computes the scaling parameter λ = α²(n + κ) - n
    #[inline]
    pub fn lambda(&self, n: usize) -> T {
        let n_t: T = nalgebra::convert(n as f64);
        self.alpha * self.alpha * (n_t + self.kappa(n)) - n_t
    }

    /// n + λ
    #[inline]
    fn spread(&self, n: usize) -> T {
        let n_t: T = nalgebra::convert(n as f64);
        n_t + self.lambda(n)
    }

    /// Computes γ = √(n + λ) used for sigma point generation
    #[inline]
    fn gamma(&self, n: usize) -> T {
        self.spread(n).sqrt()
    }

    /// Computes the weight for the mean of the central sigma point
    #[inline]
    pub fn weight_mean_0(&self, n: usize) -> T {
        self.lambda(n) / self.spread(n)
    }

    /// Computes the weight for the covariance of the central sigma point
    #[inline]
    pub fn weight_cov_0(&self, n: usize) -> T {
        self.weight_mean_0(n) + (T::one() - self.alpha * self.alpha + self.beta)
    }

    /// Computes the weight for non-central sigma points (same for mean and covariance)
    #[inline]
    pub fn weight_i(&self, n: usize) -> T {
        let two: T = nalgebra::convert(2.0);
        T::one() / (two * self.spread(n))
    }
}

// ============================================================================
// Sigma Points
// ============================================================================

/// Collection of sigma points with their weights.
///
/// For an n-dimensional state there are 2n+1 sigma points, stored one per row.
#[derive(Debug, Clone)]
pub struct SigmaPoints<T: RealField> {
    /// The sigma points: [χ₀; χ₁; ...; χ₂ₙ]
    pub points: DMatrix<T>,
    /// Weight for mean calculation of central point
    pub weight_mean_0: T,
    /// Weight for covariance calculation of central point
    pub weight_cov_0: T,
    /// Weight for mean and covariance of other points
    pub weight_i: T,
}

impl<T: RealField + Copy> SigmaPoints<T> {
    /// Generates sigma points from a distribution.
    ///
    /// Uses the symmetric sigma point selection with Cholesky decomposition.
    /// Fails with [`Error::NotPositiveDefinite`] if the covariance has no
    /// Cholesky factor.
    pub fn generate(
        distribution: &MultivariateGaussian<T>,
        params: &UkfParams<T>,
        context: &'static str,
    ) -> Result<Self> {
        let n = distribution.dimension();
        let mean = distribution.get_mean();

        // Cholesky decomposition: P = L * L^T
        let sqrt_p = Cholesky::new(distribution.get_covariance().clone())
            .ok_or(Error::NotPositiveDefinite(context))?
            .l();

        // Scale by gamma: √((n+λ)P)
        let scaled_sqrt_p = sqrt_p * params.gamma(n);

        let mut points = DMatrix::zeros(2 * n + 1, n);
        points.row_mut(0).copy_from(&mean.transpose());
        for i in 0..n {
            let offset = scaled_sqrt_p.column(i);
            points.row_mut(i + 1).copy_from(&(mean + offset).transpose());
            points.row_mut(n + i + 1).copy_from(&(mean - offset).transpose());
        }

        Ok(Self {
            points,
            weight_mean_0: params.weight_mean_0(n),
            weight_cov_0: params.weight_cov_0(n),
            weight_i: params.weight_i(n),
        })
    }

    /// Number of sigma points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    #[inline]
    fn weight_mean(&self, i: usize) -> T {
        if i == 0 {
            self.weight_mean_0
        } else {
            self.weight_i
        }
    }

    #[inline]
    fn weight_cov(&self, i: usize) -> T {
        if i == 0 {
            self.weight_cov_0
        } else {
            self.weight_i
        }
    }

    /// Recovers the mean and covariance of transformed sigma points.
    ///
    /// `transformed` holds one transformed point per row, in sigma point order.
    pub fn recover_mean_cov(
        &self,
        transformed: &DMatrix<T>,
        additive_noise: Option<&DMatrix<T>>,
    ) -> (DVector<T>, DMatrix<T>) {
        let dim = transformed.ncols();

        let mut mean = DVector::zeros(dim);
        for (i, row) in transformed.row_iter().enumerate() {
            mean += row.transpose() * self.weight_mean(i);
        }

        let mut cov = DMatrix::zeros(dim, dim);
        for (i, row) in transformed.row_iter().enumerate() {
            let diff = row.transpose() - &mean;
            cov += &diff * diff.transpose() * self.weight_cov(i);
        }

        if let Some(noise) = additive_noise {
            cov += noise;
        }

        (mean, cov)
    }

    /// Cross-covariance between the sigma points and their transformed images.
    pub fn cross_covariance(
        &self,
        state_mean: &DVector<T>,
        transformed: &DMatrix<T>,
        transformed_mean: &DVector<T>,
    ) -> DMatrix<T> {
        let mut cross_cov = DMatrix::zeros(self.points.ncols(), transformed.ncols());
        for (i, (point, image)) in self.points.row_iter().zip(transformed.row_iter()).enumerate() {
            let state_diff = point.transpose() - state_mean;
            let trans_diff = image.transpose() - transformed_mean;
            cross_cov += state_diff * trans_diff.transpose() * self.weight_cov(i);
        }
        cross_cov
    }
}

fn check_square<T: RealField>(
    matrix: &DMatrix<T>,
    dim: usize,
    context: &'static str,
) -> Result<()> {
    let found = if matrix.nrows() != dim {
        matrix.nrows()
    } else {
        matrix.ncols()
    };
    if found != dim {
        return Err(Error::DimensionMismatch {
            context,
            expected: dim,
            found,
        });
    }
    Ok(())
}

fn check_rows<T: RealField>(
    rows: &DMatrix<T>,
    expected: (usize, usize),
    context: &'static str,
) -> Result<()> {
    if rows.nrows() != expected.0 {
        return Err(Error::BatchMismatch {
            expected: expected.0,
            found: rows.nrows(),
        });
    }
    if rows.ncols() != expected.1 {
        return Err(Error::DimensionMismatch {
            context,
            expected: expected.1,
            found: rows.ncols(),
        });
    }
    Ok(())
}

// ============================================================================
// Unscented Kalman Filter
// ============================================================================

/// An Unscented Kalman Filter bound to one model wrapper.
///
/// The filter owns the current hidden-state distribution and the controls of
/// the time step it refers to. Both are replaced on every successful
/// [`step`](Self::step) and left untouched when a step fails.
#[derive(Debug, Clone)]
pub struct UnscentedKalmanFilter<T: RealField + Copy, W> {
    model: W,
    hidden: MultivariateGaussian<T>,
    controls: MultivariateGaussian<T>,
    process_noise: DMatrix<T>,
    sensor_noise: DMatrix<T>,
    params: UkfParams<T>,
}

impl<T, W> UnscentedKalmanFilter<T, W>
where
    T: RealField + Copy,
    W: ModelWrapper<T>,
{
    /// Creates a new Unscented Kalman Filter.
    ///
    /// Missing noise covariances default to zero. Every matrix is checked
    /// against the wrapper's dimensions here rather than at the first step.
    pub fn new(
        model: W,
        initial_hidden: MultivariateGaussian<T>,
        initial_controls: MultivariateGaussian<T>,
        process_noise: Option<DMatrix<T>>,
        sensor_noise: Option<DMatrix<T>>,
        params: UkfParams<T>,
    ) -> Result<Self> {
        let n = model.num_hidden_dimensions();
        let m = model.num_output_dimensions();

        if initial_hidden.dimension() != n {
            return Err(Error::DimensionMismatch {
                context: "initial hidden state",
                expected: n,
                found: initial_hidden.dimension(),
            });
        }
        let process_noise = process_noise.unwrap_or_else(|| DMatrix::zeros(n, n));
        check_square(&process_noise, n, "process noise covariance")?;
        let sensor_noise = sensor_noise.unwrap_or_else(|| DMatrix::zeros(m, m));
        check_square(&sensor_noise, m, "sensor noise covariance")?;
        params.validate(n)?;

        debug!(
            hidden_dimensions = n,
            output_dimensions = m,
            control_dimensions = initial_controls.dimension(),
            "created unscented Kalman filter"
        );

        Ok(Self {
            model,
            hidden: initial_hidden,
            controls: initial_controls,
            process_noise,
            sensor_noise,
            params,
        })
    }

    /// Creates a new UKF with default parameters.
    pub fn with_default_params(
        model: W,
        initial_hidden: MultivariateGaussian<T>,
        initial_controls: MultivariateGaussian<T>,
        process_noise: Option<DMatrix<T>>,
        sensor_noise: Option<DMatrix<T>>,
    ) -> Result<Self> {
        Self::new(
            model,
            initial_hidden,
            initial_controls,
            process_noise,
            sensor_noise,
            UkfParams::default(),
        )
    }

    /// Current posterior of the hidden state, in filter coordinates.
    #[inline]
    pub fn hidden(&self) -> &MultivariateGaussian<T> {
        &self.hidden
    }

    /// Controls of the time step the posterior refers to.
    #[inline]
    pub fn controls(&self) -> &MultivariateGaussian<T> {
        &self.controls
    }

    #[inline]
    pub fn model(&self) -> &W {
        &self.model
    }

    /// Mutable access to the wrapper, used to swap its frozen context between
    /// steps.
    #[inline]
    pub fn model_mut(&mut self) -> &mut W {
        &mut self.model
    }

    #[inline]
    pub fn params(&self) -> &UkfParams<T> {
        &self.params
    }

    #[inline]
    pub fn process_noise(&self) -> &DMatrix<T> {
        &self.process_noise
    }

    #[inline]
    pub fn sensor_noise(&self) -> &DMatrix<T> {
        &self.sensor_noise
    }

    fn control_row(&self, controls: &MultivariateGaussian<T>) -> Result<DMatrix<T>> {
        if controls.dimension() != self.controls.dimension() {
            return Err(Error::DimensionMismatch {
                context: "controls",
                expected: self.controls.dimension(),
                found: controls.dimension(),
            });
        }
        let mean = controls.get_mean();
        Ok(DMatrix::from_row_slice(1, mean.len(), mean.as_slice()))
    }

    /// Performs the UKF prediction step.
    ///
    /// 1. Generate sigma points from the current posterior
    /// 2. Propagate sigma points through the transition function
    /// 3. Recover predicted mean and covariance, adding process noise
    pub fn predict(
        &self,
        new_controls: &MultivariateGaussian<T>,
    ) -> Result<MultivariateGaussian<T>> {
        let n = self.hidden.dimension();
        let sigma_points = SigmaPoints::generate(&self.hidden, &self.params, "posterior")?;

        let previous = self.control_row(&self.controls)?;
        let new = self.control_row(new_controls)?;
        let propagated = self
            .model
            .update_hidden_states(&sigma_points.points, &previous, &new)?;
        check_rows(&propagated, (sigma_points.len(), n), "propagated hidden states")?;

        let (mean, cov) = sigma_points.recover_mean_cov(&propagated, Some(&self.process_noise));
        trace!(sigma_points = sigma_points.len(), "ukf predict");
        MultivariateGaussian::new(mean, cov)
    }

    /// Performs the UKF update step with a measurement.
    ///
    /// 1. Generate sigma points from the predicted state
    /// 2. Transform sigma points through the measurement function
    /// 3. Compute predicted measurement mean and covariance
    /// 4. Compute cross-covariance
    /// 5. Compute Kalman gain and update state
    ///
    /// Returns the posterior and the predicted output distribution (which
    /// includes the sensor noise).
    pub fn update(
        &self,
        predicted: &MultivariateGaussian<T>,
        controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)> {
        let m = self.model.num_output_dimensions();
        if measurements.dimension() != m {
            return Err(Error::DimensionMismatch {
                context: "measurements",
                expected: m,
                found: measurements.dimension(),
            });
        }

        let sigma_points = SigmaPoints::generate(predicted, &self.params, "predicted")?;
        let controls = self.control_row(controls)?;
        let outputs = self.model.predict_measurement(&sigma_points.points, &controls)?;
        check_rows(&outputs, (sigma_points.len(), m), "predicted outputs")?;

        // Predicted output statistics
        let (y_mean, y_cov) = sigma_points.recover_mean_cov(&outputs, Some(&self.sensor_noise));

        // Cross-covariance between state and output
        let cross_cov = sigma_points.cross_covariance(predicted.get_mean(), &outputs, &y_mean);

        // Kalman gain: K = P_xy * P_yy^{-1}
        let y_cov_inv = y_cov
            .clone()
            .try_inverse()
            .ok_or(Error::SingularMatrix("output covariance"))?;
        let kalman_gain = &cross_cov * y_cov_inv;

        let innovation = measurements.get_mean() - &y_mean;
        let updated_mean = predicted.get_mean() + &kalman_gain * &innovation;

        // P = P - K * P_yy * K^T
        let updated_cov =
            predicted.get_covariance() - &kalman_gain * &y_cov * kalman_gain.transpose();

        let mut posterior = MultivariateGaussian::new(updated_mean, updated_cov)?;
        posterior.symmetrize();
        debug!(innovation_norm = ?innovation.norm(), "ukf update");

        Ok((posterior, MultivariateGaussian::new(y_mean, y_cov)?))
    }

    /// Performs a single predict-update cycle and stores the result.
    ///
    /// Returns the new posterior of the hidden state and the output the filter
    /// predicted for `measurements`, both in filter coordinates.
    pub fn step(
        &mut self,
        new_controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)> {
        let (posterior, output) = self.advance(new_controls, measurements)?;
        self.commit(posterior.clone(), new_controls.clone())?;
        Ok((posterior, output))
    }

    /// Runs predict and update without storing the result.
    pub fn advance(
        &self,
        new_controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)> {
        let predicted = self.predict(new_controls)?;
        self.update(&predicted, new_controls, measurements)
    }

    /// Stores a posterior and the controls it refers to, as returned by
    /// [`advance`](Self::advance).
    pub fn commit(
        &mut self,
        posterior: MultivariateGaussian<T>,
        controls: MultivariateGaussian<T>,
    ) -> Result<()> {
        if posterior.dimension() != self.hidden.dimension() {
            return Err(Error::DimensionMismatch {
                context: "committed hidden state",
                expected: self.hidden.dimension(),
                found: posterior.dimension(),
            });
        }
        self.control_row(&controls)?;
        self.hidden = posterior;
        self.controls = controls;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
