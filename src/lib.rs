//! healthkf: online estimation of transient state and health parameters
//!
//! Sequential estimation for a dynamical system observed through noisy
//! measurements. A stream of control inputs and output measurements is used to
//! infer both the fast-varying transient state of a physical model and its
//! slow-varying health parameters, together with calibrated uncertainty.
//!
//! # Layout
//!
//! - [`types`]: Gaussian distributions, coordinate conversions and the named
//!   containers exchanged with a physical model
//! - [`models`]: the physical-model contract and the wrappers that adapt it to
//!   the filter's numeric interface
//! - [`filters`]: the Unscented Kalman Filter recursion
//! - [`estimators`]: joint and dual estimation strategies
//! - [`interface`]: run loop over recorded data and an in-memory estimate store

pub mod types;
pub mod models;
pub mod filters;
pub mod estimators;
pub mod interface;

pub mod prelude {
    pub use crate::types::containers::*;
    pub use crate::types::conversion::*;
    pub use crate::types::distribution::*;
    pub use crate::models::*;
    pub use crate::filters::ukf::*;
    pub use crate::estimators::*;
    pub use crate::interface::*;
    pub use crate::{Error, Result};
}

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A vector or matrix does not have the dimension its context requires
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
    /// An estimator was given a container whose batch size is not 1
    #[error("{what} must have a batch size of 1, found {found}")]
    InvalidBatchSize { what: &'static str, found: usize },
    /// Two batched arrays cannot be broadcast to a common batch size
    #[error("cannot broadcast a batch of {found} rows to {expected} rows")]
    BatchMismatch { expected: usize, found: usize },
    /// Number of named components disagrees with the number of supplied values
    #[error("{what}: {expected} components declared but {found} supplied")]
    ComponentCountMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
    /// A health parameter name is not known to the container
    #[error("unknown health parameter: {0}")]
    UnknownParameter(String),
    /// A tuning or configuration value is outside its valid range
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Cholesky decomposition failed while drawing sigma points
    #[error("{0} covariance is not positive definite")]
    NotPositiveDefinite(&'static str),
    /// Matrix is singular and cannot be inverted
    #[error("{0} is singular")]
    SingularMatrix(&'static str),
    /// Nothing was stored for the requested granularity
    #[error("No data stored for {0}")]
    NoData(&'static str),
    /// A writer may only be prepared once
    #[error("writer has already been prepared")]
    AlreadyPrepared,
    /// A writer was used before `prepare`
    #[error("writer has not been prepared")]
    NotPrepared,
    /// Fixed-size storage needs its final length up front
    #[error("fixed-size storage requires the number of {0} up front")]
    MissingStorageSize(&'static str),
    /// Fixed-size storage has no free rows left
    #[error("fixed-size storage for {what} is full ({capacity} rows)")]
    StorageFull { what: &'static str, capacity: usize },
    /// A dataset lacks a quantity the estimator needs
    #[error("dataset has no column named {0}")]
    MissingColumn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = ::core::result::Result<T, Error>;
