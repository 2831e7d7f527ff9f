// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are
// used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of analysis: a county/district from the boundary layer.
///
/// The name is canonical (already passed through name normalization); `group`
/// is the coarse grouping factor carried by the boundary attributes (e.g.
/// north/south), if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub group: Option<String>,
}

/// A direct survey estimate for one region, with its derived sampling
/// quantities. Computed once at ingestion and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectEstimate {
    pub region: String,
    pub estimate: f64,
    pub margin: f64,
    pub standard_error: f64,
    pub sampling_variance: f64,
    /// `(estimate / standard_error)^2`. `None` when the standard error is
    /// zero: the quantity is undefined there and must never silently become
    /// infinity.
    pub effective_sample_size: Option<f64>,
}

/// A model formula: response regressed on a set of named predictors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub response: String,
    pub predictors: Vec<String>,
}

impl Formula {
    pub fn new(response: impl Into<String>, predictors: &[&str]) -> Self {
        Self {
            response: response.into(),
            predictors: predictors.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    /// True when every predictor of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &Formula) -> bool {
        self.predictors
            .iter()
            .all(|p| other.predictors.contains(p))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.predictors.is_empty() {
            write!(f, "{} ~ 1", self.response)
        } else {
            write!(f, "{} ~ {}", self.response, self.predictors.join(" + "))
        }
    }
}

/// Variance-component estimation method used by the external estimator.
/// Selection-time fits use `Ml` so the criterion is comparable across nested
/// models; reporting-grade fits use `Reml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMethod {
    Reml,
    Ml,
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimationMethod::Reml => write!(f, "REML"),
            EstimationMethod::Ml => write!(f, "ML"),
        }
    }
}

/// Information criterion driving backward elimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criterion {
    Aic,
    Bic,
}

/// Response transformation applied before fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transformation {
    Identity,
    #[serde(rename = "arcsin")]
    ArcsinSqrt,
    Log,
    Logit,
}

/// Inverse mapping paired with a transformation when predictions are brought
/// back to the original scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackTransformation {
    None,
    BiasCorrectedArcsin,
    BiasCorrectedLog,
    BiasCorrectedLogit,
}

/// How the MSE of the EBLUP is estimated for a given fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MseMethod {
    Analytical,
    Bootstrap,
}

impl Transformation {
    /// The only mathematically valid back-transformation for this
    /// transformation. Bias-corrected inverses lack closed-form MSE, so they
    /// pair with bootstrap MSE; the identity keeps the analytical estimator.
    pub fn back_transformation(self) -> BackTransformation {
        match self {
            Transformation::Identity => BackTransformation::None,
            Transformation::ArcsinSqrt => BackTransformation::BiasCorrectedArcsin,
            Transformation::Log => BackTransformation::BiasCorrectedLog,
            Transformation::Logit => BackTransformation::BiasCorrectedLogit,
        }
    }

    pub fn mse_method(self) -> MseMethod {
        match self {
            Transformation::Identity => MseMethod::Analytical,
            _ => MseMethod::Bootstrap,
        }
    }

    /// Short label used in variant names ("FullLog", "RedArcsin", ...).
    pub fn label(self) -> &'static str {
        match self {
            Transformation::Identity => "Initial",
            Transformation::ArcsinSqrt => "Arcsin",
            Transformation::Log => "Log",
            Transformation::Logit => "Logit",
        }
    }
}

/// A single, immutable submission to the external estimator. A reduced spec
/// is a new value, never an in-place edit of an earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateModelSpec {
    pub formula: Formula,
    pub variance_col: String,
    pub ess_col: Option<String>,
    pub method: EstimationMethod,
    pub transformation: Transformation,
    pub back_transformation: BackTransformation,
    pub compute_mse: bool,
    pub mse_method: MseMethod,
    /// Per-fit wall-clock budget, enforced by the estimator service. `None`
    /// means no budget; a blown budget comes back as
    /// `EstimatorError::Timeout` for this one handle.
    pub fit_timeout_secs: Option<u64>,
}

impl CandidateModelSpec {
    /// Builds a spec with the pairing rules of [`Transformation`] applied.
    pub fn new(
        formula: Formula,
        variance_col: impl Into<String>,
        method: EstimationMethod,
        transformation: Transformation,
        compute_mse: bool,
    ) -> Self {
        Self {
            formula,
            variance_col: variance_col.into(),
            ess_col: None,
            method,
            transformation,
            back_transformation: transformation.back_transformation(),
            compute_mse,
            mse_method: transformation.mse_method(),
            fit_timeout_secs: None,
        }
    }

    pub fn with_ess_col(mut self, ess_col: impl Into<String>) -> Self {
        self.ess_col = Some(ess_col.into());
        self
    }

    pub fn with_fit_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.fit_timeout_secs = secs;
        self
    }
}

/// Non-fatal conditions collected during the run and surfaced alongside the
/// successful output. These are never thrown; the caller decides what to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Warning {
    /// Regions present in a data source but absent from the boundary layer.
    /// Usually means name normalization failed upstream.
    JoinMismatch {
        source: String,
        count: usize,
        names: Vec<String>,
    },
    /// Boundary regions that lack a response value after the join.
    MissingResponse { count: usize },
    /// Screened predictors whose variance inflation factor exceeds the
    /// configured threshold. Advisory only.
    Collinearity { predictors: Vec<String> },
    /// Fewer than two numeric candidates: correlation ranking and the VIF
    /// check were skipped entirely.
    ScreeningSkipped { candidates: usize },
    /// Too few complete cases to regress the selected predictors on each
    /// other: the VIF check did not run, which is different from "ran and
    /// found nothing".
    VifUnchecked { complete_cases: usize },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::JoinMismatch {
                source,
                count,
                names,
            } => write!(
                f,
                "{count} region(s) in source '{source}' not present in the boundary layer: {}",
                names.join(", ")
            ),
            Warning::MissingResponse { count } => {
                write!(f, "{count} region(s) lack a response value after the join")
            }
            Warning::Collinearity { predictors } => write!(
                f,
                "variance inflation above threshold for: {}",
                predictors.join(", ")
            ),
            Warning::ScreeningSkipped { candidates } => write!(
                f,
                "covariate screening skipped: only {candidates} numeric candidate(s)"
            ),
            Warning::VifUnchecked { complete_cases } => write!(
                f,
                "variance inflation not checked: only {complete_cases} complete case(s)"
            ),
        }
    }
}
