//! External-service contracts.
//!
//! The Fay-Herriot estimator, the stepwise-selection procedure, and the
//! spatial-autocorrelation test are black boxes behind narrow traits. This
//! crate never reproduces their numerics; it only consumes the published
//! outputs listed here. Tests use scripted doubles of these traits.

use crate::join::ModelingDataset;
use crate::types::{CandidateModelSpec, Criterion, EstimationMethod, Formula, Transformation};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EstimatorError {
    /// The estimator could not fit this one formula/method/transformation
    /// combination. Isolated to that handle; siblings proceed.
    #[error("estimator failed to converge for '{formula}': {message}")]
    Convergence { formula: String, message: String },
    /// Backward elimination could not produce a reduced formula. Fatal to
    /// the reduced branch only.
    #[error("stepwise selection failed: {message}")]
    Selection { message: String },
    /// A hung fit, treated as a convergence failure for that one handle.
    #[error("fit for '{formula}' exceeded its time budget")]
    Timeout { formula: String },
}

/// One row of the published coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRow {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitStatistics {
    pub aic: f64,
    pub bic: f64,
    pub r_squared: f64,
    pub adj_r_squared: f64,
}

/// Per-region prediction, joinable on the same canonical region key the
/// modeling dataset was built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionPrediction {
    pub region: String,
    pub eblup: f64,
    pub mse: Option<f64>,
    pub cv: Option<f64>,
}

/// The published outputs of a fitted model. Opaque internals stay with the
/// estimator; this is everything the pipeline may inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub formula: Formula,
    pub method: EstimationMethod,
    pub transformation: Transformation,
    pub coefficients: Vec<CoefficientRow>,
    pub stats: FitStatistics,
    pub predictions: Vec<RegionPrediction>,
}

/// The area-level estimator service. `fit` is a pure function of
/// (spec, dataset); `select` runs backward elimination from an existing fit
/// under the named criterion. Implementations must be safe for concurrent
/// invocation: transformation-variant fits run in parallel.
pub trait AreaEstimator: Send + Sync {
    fn fit(
        &self,
        spec: &CandidateModelSpec,
        data: &ModelingDataset,
    ) -> Result<FittedModel, EstimatorError>;

    /// Backward elimination under `criterion`. `bootstrap_reps` is forwarded
    /// to criterion variants that need resampling.
    fn select(
        &self,
        fitted: &FittedModel,
        criterion: Criterion,
        bootstrap_reps: usize,
    ) -> Result<Formula, EstimatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialTestResult {
    pub statistic: f64,
    pub p_value: f64,
}

/// Moran-type spatial autocorrelation test on the direct estimates, given a
/// row-standardized spatial weight matrix aligned with region order.
pub trait SpatialTester {
    fn test(&self, values: &[f64], weights: &Array2<f64>) -> SpatialTestResult;
}
