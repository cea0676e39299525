//! Recursive Bayesian filters
//!
//! - [`ukf::UnscentedKalmanFilter`]: Unscented Kalman Filter over a
//!   [`ModelWrapper`](crate::models::ModelWrapper)

pub mod ukf;
