//! # Model-Selection Orchestration
//!
//! Drives the external estimator through the four-step sequence: the
//! full/screened fit, a criterion-driven backward reduction (fit under ML so
//! the criterion is comparable across nested models), a reporting-grade REML
//! refit of the reduced formula, and refits of both formulas across the
//! enabled response transformations.
//!
//! Every step produces a new immutable spec; nothing is edited in place. The
//! terminal artifact is a [`FitCollection`] that names every attempted
//! variant and records, per variant, either the fitted handle or the exact
//! failure kind. A convergence failure in one variant never aborts its
//! siblings; a selection failure kills only the reduced branch.

use crate::estimator::{
    AreaEstimator, EstimatorError, FittedModel, SpatialTestResult, SpatialTester,
};
use crate::join::{ESS_COL, ModelingDataset, VARIANCE_COL};
use crate::types::{CandidateModelSpec, Criterion, EstimationMethod, Formula, Transformation};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to run: criterion, bootstrap budget, the enabled transformation
/// set (identity included means the reduced identity refit `RedInitial` is
/// produced alongside `Stepwise`), and the per-fit time budget.
#[derive(Debug, Clone)]
pub struct SelectionPlan {
    pub criterion: Criterion,
    pub bootstrap_reps: usize,
    pub transformations: Vec<Transformation>,
    pub fit_timeout_secs: Option<u64>,
}

impl SelectionPlan {
    pub fn from_config(cfg: &crate::config::SelectionConfig) -> Self {
        Self {
            criterion: cfg.criterion,
            bootstrap_reps: cfg.bootstrap_reps,
            transformations: cfg.transformations.clone(),
            fit_timeout_secs: cfg.fit_timeout_secs,
        }
    }
}

/// Input for the Moran-type autocorrelation diagnostic: the external tester
/// plus a row-standardized weight matrix aligned with the dataset's region
/// order.
pub struct SpatialDiagnostic<'a> {
    pub tester: &'a dyn SpatialTester,
    pub weights: &'a Array2<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitFailureKind {
    Convergence,
    Selection,
    Timeout,
}

impl From<&EstimatorError> for FitFailureKind {
    fn from(err: &EstimatorError) -> Self {
        match err {
            EstimatorError::Convergence { .. } => FitFailureKind::Convergence,
            EstimatorError::Selection { .. } => FitFailureKind::Selection,
            EstimatorError::Timeout { .. } => FitFailureKind::Timeout,
        }
    }
}

/// Per-variant terminal state: a fitted handle or the recorded failure.
/// Failed variants stay in the collection under their name; they are never
/// silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FitOutcome {
    Fitted(FittedModel),
    Failed {
        kind: FitFailureKind,
        message: String,
    },
}

impl FitOutcome {
    pub fn model(&self) -> Option<&FittedModel> {
        match self {
            FitOutcome::Fitted(model) => Some(model),
            FitOutcome::Failed { .. } => None,
        }
    }

    fn from_result(result: Result<FittedModel, EstimatorError>) -> Self {
        match result {
            Ok(model) => FitOutcome::Fitted(model),
            Err(err) => FitOutcome::Failed {
                kind: (&err).into(),
                message: err.to_string(),
            },
        }
    }
}

/// One named variant: the immutable spec it was submitted with plus its
/// outcome. The spec doubles as reporting metadata (formula, method,
/// transformation, MSE strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRecord {
    pub name: String,
    pub spec: CandidateModelSpec,
    pub outcome: FitOutcome,
}

/// The pipeline's terminal artifact: every attempted variant keyed by name,
/// consumed by the mapping/reporting collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitCollection {
    pub variants: BTreeMap<String, VariantRecord>,
    pub full_formula: Formula,
    pub reduced_formula: Option<Formula>,
    pub spatial: Option<SpatialTestResult>,
}

impl FitCollection {
    pub fn names(&self) -> Vec<&str> {
        self.variants.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&VariantRecord> {
        self.variants.get(name)
    }

    pub fn fitted(&self, name: &str) -> Option<&FittedModel> {
        self.variants.get(name).and_then(|v| v.outcome.model())
    }

    pub fn failures(&self) -> Vec<(&str, FitFailureKind)> {
        self.variants
            .iter()
            .filter_map(|(name, record)| match &record.outcome {
                FitOutcome::Failed { kind, .. } => Some((name.as_str(), *kind)),
                FitOutcome::Fitted(_) => None,
            })
            .collect()
    }
}

fn spec_for(
    formula: &Formula,
    method: EstimationMethod,
    transformation: Transformation,
    compute_mse: bool,
    timeout_secs: Option<u64>,
) -> CandidateModelSpec {
    CandidateModelSpec::new(
        formula.clone(),
        VARIANCE_COL,
        method,
        transformation,
        compute_mse,
    )
    .with_ess_col(ESS_COL)
    .with_fit_timeout_secs(timeout_secs)
}

/// Runs the full selection sequence against the estimator and returns the
/// collection of named fitted handles. When a [`SpatialDiagnostic`] is given,
/// the autocorrelation test runs on the direct estimates and its result is
/// carried in the collection.
pub fn run_model_selection(
    estimator: &dyn AreaEstimator,
    data: &ModelingDataset,
    full: &Formula,
    plan: &SelectionPlan,
    spatial: Option<SpatialDiagnostic<'_>>,
) -> FitCollection {
    let timeout = plan.fit_timeout_secs;
    let mut variants: BTreeMap<String, VariantRecord> = BTreeMap::new();

    // Step 1: full fit under the reporting method, MSE on.
    let initial_spec = spec_for(
        full,
        EstimationMethod::Reml,
        Transformation::Identity,
        true,
        timeout,
    );
    log::info!("fitting Initial: {} ({})", full, EstimationMethod::Reml);
    let initial_outcome = FitOutcome::from_result(estimator.fit(&initial_spec, data));
    variants.insert(
        "Initial".to_string(),
        VariantRecord {
            name: "Initial".to_string(),
            spec: initial_spec,
            outcome: initial_outcome,
        },
    );

    // Step 2: ML refit + backward elimination. ML, not REML, so the
    // criterion is comparable across nested models.
    let reduced_formula = reduce(estimator, data, full, plan);

    // Step 3: the reduced formula is refit under the reporting method; the
    // selection-time fit is never reused directly.
    if let Some(reduced) = &reduced_formula {
        let spec = spec_for(
            reduced,
            EstimationMethod::Reml,
            Transformation::Identity,
            true,
            timeout,
        );
        log::info!("fitting Stepwise: {} ({})", reduced, EstimationMethod::Reml);
        let outcome = FitOutcome::from_result(estimator.fit(&spec, data));
        variants.insert(
            "Stepwise".to_string(),
            VariantRecord {
                name: "Stepwise".to_string(),
                spec,
                outcome,
            },
        );
    } else {
        variants.insert(
            "Stepwise".to_string(),
            VariantRecord {
                name: "Stepwise".to_string(),
                spec: spec_for(
                    full,
                    EstimationMethod::Ml,
                    Transformation::Identity,
                    false,
                    timeout,
                ),
                outcome: FitOutcome::Failed {
                    kind: FitFailureKind::Selection,
                    message: "no reduced formula: stepwise selection failed".to_string(),
                },
            },
        );
    }

    // Step 4: transformation variants for both branches. Each job is an
    // independent (name, spec) pair over the same immutable dataset, so they
    // run in parallel and join by name.
    let mut jobs: Vec<(String, CandidateModelSpec)> = Vec::new();
    for &transformation in &plan.transformations {
        match transformation {
            Transformation::Identity => {
                // Full identity is Step 1; only the reduced refit is new.
                if let Some(reduced) = &reduced_formula {
                    jobs.push((
                        "RedInitial".to_string(),
                        spec_for(reduced, EstimationMethod::Reml, transformation, true, timeout),
                    ));
                }
            }
            _ => {
                jobs.push((
                    format!("Full{}", transformation.label()),
                    spec_for(full, EstimationMethod::Reml, transformation, true, timeout),
                ));
                if let Some(reduced) = &reduced_formula {
                    jobs.push((
                        format!("Red{}", transformation.label()),
                        spec_for(reduced, EstimationMethod::Reml, transformation, true, timeout),
                    ));
                }
            }
        }
    }

    let fitted: Vec<(String, CandidateModelSpec, FitOutcome)> = jobs
        .into_par_iter()
        .map(|(name, spec)| {
            log::info!(
                "fitting {name}: {} ({}, {:?})",
                spec.formula,
                spec.method,
                spec.transformation
            );
            let outcome = FitOutcome::from_result(estimator.fit(&spec, data));
            (name, spec, outcome)
        })
        .collect();

    for (name, spec, outcome) in fitted {
        variants.insert(
            name.clone(),
            VariantRecord {
                name,
                spec,
                outcome,
            },
        );
    }

    // Reduced-branch variants that could not even be attempted are still
    // named in the collection, with the selection failure recorded.
    if reduced_formula.is_none() {
        for &transformation in &plan.transformations {
            let name = match transformation {
                Transformation::Identity => "RedInitial".to_string(),
                _ => format!("Red{}", transformation.label()),
            };
            variants.insert(
                name.clone(),
                VariantRecord {
                    name,
                    spec: spec_for(full, EstimationMethod::Reml, transformation, true, timeout),
                    outcome: FitOutcome::Failed {
                        kind: FitFailureKind::Selection,
                        message: "no reduced formula: stepwise selection failed".to_string(),
                    },
                },
            );
        }
    }

    let spatial = spatial.and_then(|diag| run_spatial_diagnostic(diag, data));

    let collection = FitCollection {
        variants,
        full_formula: full.clone(),
        reduced_formula,
        spatial,
    };

    let failures = collection.failures();
    if failures.is_empty() {
        log::info!("all {} variants fitted", collection.variants.len());
    } else {
        for (name, kind) in &failures {
            log::warn!("variant '{name}' failed: {kind:?}");
        }
        log::warn!(
            "{} of {} variants failed",
            failures.len(),
            collection.variants.len()
        );
    }
    collection
}

/// Runs the Moran-type test on the direct estimates. The test needs one
/// value per region in weight-matrix order, so a missing response or a
/// misaligned matrix skips the diagnostic with a warning rather than
/// producing a silently misaligned statistic.
fn run_spatial_diagnostic(
    diag: SpatialDiagnostic<'_>,
    data: &ModelingDataset,
) -> Option<SpatialTestResult> {
    let response = match data.response() {
        Ok(response) => response,
        Err(err) => {
            log::warn!("spatial diagnostic skipped: {err}");
            return None;
        }
    };
    let values: Vec<f64> = response.iter().flatten().copied().collect();
    if values.len() != response.len() {
        log::warn!(
            "spatial diagnostic skipped: {} region(s) lack a response value",
            response.len() - values.len()
        );
        return None;
    }
    if diag.weights.nrows() != values.len() || diag.weights.ncols() != values.len() {
        log::warn!(
            "spatial diagnostic skipped: {}x{} weight matrix for {} regions",
            diag.weights.nrows(),
            diag.weights.ncols(),
            values.len()
        );
        return None;
    }
    let result = diag.tester.test(&values, diag.weights);
    log::info!(
        "spatial autocorrelation: statistic {:.4}, p = {:.4}",
        result.statistic,
        result.p_value
    );
    Some(result)
}

/// Step 2: ML fit of the full formula, then backward elimination. Returns
/// `None` when either half fails; the caller records the failure against the
/// reduced-branch variants.
fn reduce(
    estimator: &dyn AreaEstimator,
    data: &ModelingDataset,
    full: &Formula,
    plan: &SelectionPlan,
) -> Option<Formula> {
    let ml_spec = spec_for(
        full,
        EstimationMethod::Ml,
        Transformation::Identity,
        false,
        plan.fit_timeout_secs,
    );
    let ml_fit = match estimator.fit(&ml_spec, data) {
        Ok(fit) => fit,
        Err(err) => {
            log::warn!("selection-time ML fit failed: {err}");
            return None;
        }
    };
    let reduced = match estimator.select(&ml_fit, plan.criterion, plan.bootstrap_reps) {
        Ok(formula) => formula,
        Err(err) => {
            log::warn!("stepwise selection failed: {err}");
            return None;
        }
    };
    if !reduced.is_subset_of(full) {
        log::error!(
            "selection returned '{reduced}', not a sub-model of '{full}'; discarding it"
        );
        return None;
    }
    Some(reduced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::{CoefficientRow, FitStatistics, RegionPrediction};
    use polars::prelude::*;
    use std::sync::Mutex;

    /// Scripted estimator double: drops the last predictor during selection
    /// and fails any fit whose transformation is in the fail set.
    struct ScriptedEstimator {
        fail_transformations: Vec<Transformation>,
        fail_selection: bool,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedEstimator {
        fn new() -> Self {
            Self {
                fail_transformations: Vec::new(),
                fail_selection: false,
                log: Mutex::new(Vec::new()),
            }
        }

        fn stub_model(spec: &CandidateModelSpec, data: &ModelingDataset) -> FittedModel {
            let mut coefficients = vec![CoefficientRow {
                term: "(Intercept)".to_string(),
                estimate: 0.1,
                std_error: 0.01,
                t_value: 10.0,
                p_value: 0.001,
            }];
            for term in &spec.formula.predictors {
                coefficients.push(CoefficientRow {
                    term: term.clone(),
                    estimate: 0.5,
                    std_error: 0.1,
                    t_value: 5.0,
                    p_value: 0.01,
                });
            }
            let predictions = data
                .region_names()
                .unwrap()
                .into_iter()
                .map(|region| RegionPrediction {
                    region,
                    eblup: 0.42,
                    mse: spec.compute_mse.then_some(0.001),
                    cv: spec.compute_mse.then_some(7.5),
                })
                .collect();
            FittedModel {
                formula: spec.formula.clone(),
                method: spec.method,
                transformation: spec.transformation,
                coefficients,
                stats: FitStatistics {
                    aic: -10.0,
                    bic: -8.0,
                    r_squared: 0.8,
                    adj_r_squared: 0.75,
                },
                predictions,
            }
        }
    }

    impl AreaEstimator for ScriptedEstimator {
        fn fit(
            &self,
            spec: &CandidateModelSpec,
            data: &ModelingDataset,
        ) -> Result<FittedModel, EstimatorError> {
            self.log.lock().unwrap().push(format!(
                "{} {} {:?}",
                spec.formula, spec.method, spec.transformation
            ));
            if self.fail_transformations.contains(&spec.transformation) {
                return Err(EstimatorError::Convergence {
                    formula: spec.formula.to_string(),
                    message: "variance component estimation diverged".to_string(),
                });
            }
            Ok(Self::stub_model(spec, data))
        }

        fn select(
            &self,
            fitted: &FittedModel,
            _criterion: Criterion,
            _bootstrap_reps: usize,
        ) -> Result<Formula, EstimatorError> {
            if self.fail_selection {
                return Err(EstimatorError::Selection {
                    message: "criterion comparison failed".to_string(),
                });
            }
            let mut predictors = fitted.formula.predictors.clone();
            predictors.pop();
            Ok(Formula {
                response: fitted.formula.response.clone(),
                predictors,
            })
        }
    }

    fn dataset() -> ModelingDataset {
        let frame = DataFrame::new(vec![
            Column::new(
                "region".into(),
                vec!["Stockholm", "Uppsala", "Gotland", "Skåne"],
            ),
            Column::new("estimate".into(), vec![0.5, 0.4, 0.3, 0.45]),
            Column::new("variance".into(), vec![1e-4, 2e-4, 3e-4, 1.5e-4]),
            Column::new("ess".into(), vec![2500.0, 1600.0, 900.0, 2000.0]),
            Column::new("a".into(), vec![1.0, 2.0, 3.0, 4.0]),
            Column::new("b".into(), vec![2.0, 1.0, 4.0, 3.0]),
            Column::new("c".into(), vec![0.1, 0.4, 0.2, 0.3]),
        ])
        .unwrap();
        ModelingDataset::from_frame(
            frame,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        )
    }

    fn plan() -> SelectionPlan {
        SelectionPlan {
            criterion: Criterion::Aic,
            bootstrap_reps: 50,
            transformations: vec![
                Transformation::Identity,
                Transformation::ArcsinSqrt,
                Transformation::Log,
                Transformation::Logit,
            ],
            fit_timeout_secs: None,
        }
    }

    #[test]
    fn reduced_variants_share_the_step3_predictor_set() {
        let estimator = ScriptedEstimator::new();
        let full = Formula::new("estimate", &["a", "b", "c"]);
        let collection = run_model_selection(&estimator, &dataset(), &full, &plan(), None);

        let reduced = collection.reduced_formula.clone().unwrap();
        assert_eq!(reduced.predictors, vec!["a", "b"]);
        assert!(reduced.is_subset_of(&full));

        for name in ["Stepwise", "RedInitial", "RedArcsin", "RedLog", "RedLogit"] {
            let record = collection.get(name).unwrap();
            assert_eq!(
                record.spec.formula.predictors, reduced.predictors,
                "variant {name} diverged from the reduced predictor set"
            );
        }
        for name in ["Initial", "FullArcsin", "FullLog", "FullLogit"] {
            let record = collection.get(name).unwrap();
            assert_eq!(record.spec.formula.predictors, full.predictors);
        }
    }

    #[test]
    fn selection_fit_uses_ml_and_reporting_fits_use_reml() {
        let estimator = ScriptedEstimator::new();
        let full = Formula::new("estimate", &["a", "b"]);
        let _ = run_model_selection(&estimator, &dataset(), &full, &plan(), None);
        let calls = estimator.log.lock().unwrap();
        let ml_calls = calls.iter().filter(|c| c.contains(" ML ")).count();
        let reml_calls = calls.iter().filter(|c| c.contains(" REML ")).count();
        // Exactly one selection-time ML fit; everything else is REML.
        assert_eq!(ml_calls, 1);
        assert_eq!(reml_calls, calls.len() - 1);
    }

    #[test]
    fn convergence_failure_is_isolated_to_its_variant() {
        let estimator = ScriptedEstimator {
            fail_transformations: vec![Transformation::Log],
            ..ScriptedEstimator::new()
        };
        let full = Formula::new("estimate", &["a", "b", "c"]);
        let collection = run_model_selection(&estimator, &dataset(), &full, &plan(), None);

        for name in ["RedLog", "FullLog"] {
            match &collection.get(name).unwrap().outcome {
                FitOutcome::Failed { kind, .. } => {
                    assert_eq!(*kind, FitFailureKind::Convergence)
                }
                FitOutcome::Fitted(_) => panic!("{name} should have failed"),
            }
        }
        for name in ["RedArcsin", "RedLogit", "RedInitial", "Initial", "Stepwise"] {
            assert!(
                collection.fitted(name).is_some(),
                "{name} should have survived the sibling failure"
            );
        }
    }

    #[test]
    fn selection_failure_kills_only_the_reduced_branch() {
        let estimator = ScriptedEstimator {
            fail_selection: true,
            ..ScriptedEstimator::new()
        };
        let full = Formula::new("estimate", &["a", "b", "c"]);
        let collection = run_model_selection(&estimator, &dataset(), &full, &plan(), None);

        assert!(collection.reduced_formula.is_none());
        // Full branch still produced.
        for name in ["Initial", "FullArcsin", "FullLog", "FullLogit"] {
            assert!(collection.fitted(name).is_some(), "{name} missing");
        }
        // Reduced branch present by name, marked failed, never omitted.
        for name in ["Stepwise", "RedInitial", "RedArcsin", "RedLog", "RedLogit"] {
            match &collection.get(name).unwrap().outcome {
                FitOutcome::Failed { kind, .. } => {
                    assert_eq!(*kind, FitFailureKind::Selection)
                }
                FitOutcome::Fitted(_) => panic!("{name} should carry the selection failure"),
            }
        }
    }

    #[test]
    fn transformation_pairings_hold_for_every_variant() {
        let estimator = ScriptedEstimator::new();
        let full = Formula::new("estimate", &["a", "b"]);
        let collection = run_model_selection(&estimator, &dataset(), &full, &plan(), None);
        for record in collection.variants.values() {
            assert_eq!(
                record.spec.back_transformation,
                record.spec.transformation.back_transformation(),
                "invalid pairing in {}",
                record.name
            );
            assert_eq!(
                record.spec.mse_method,
                record.spec.transformation.mse_method()
            );
        }
    }

    #[test]
    fn fit_timeout_is_forwarded_to_every_spec() {
        let estimator = ScriptedEstimator::new();
        let full = Formula::new("estimate", &["a", "b"]);
        let timed_plan = SelectionPlan {
            fit_timeout_secs: Some(120),
            ..plan()
        };
        let collection = run_model_selection(&estimator, &dataset(), &full, &timed_plan, None);
        for record in collection.variants.values() {
            assert_eq!(
                record.spec.fit_timeout_secs,
                Some(120),
                "variant {} lost the fit time budget",
                record.name
            );
        }
    }

    /// Scripted spatial tester: records what it was handed and returns a
    /// fixed result.
    struct ScriptedTester {
        seen: Mutex<Option<(Vec<f64>, usize)>>,
    }

    impl SpatialTester for ScriptedTester {
        fn test(&self, values: &[f64], weights: &Array2<f64>) -> SpatialTestResult {
            *self.seen.lock().unwrap() = Some((values.to_vec(), weights.nrows()));
            SpatialTestResult {
                statistic: 0.31,
                p_value: 0.02,
            }
        }
    }

    #[test]
    fn spatial_diagnostic_runs_on_direct_estimates_and_is_carried() {
        let estimator = ScriptedEstimator::new();
        let tester = ScriptedTester {
            seen: Mutex::new(None),
        };
        let weights = Array2::<f64>::from_elem((4, 4), 0.25);
        let full = Formula::new("estimate", &["a"]);
        let collection = run_model_selection(
            &estimator,
            &dataset(),
            &full,
            &plan(),
            Some(SpatialDiagnostic {
                tester: &tester,
                weights: &weights,
            }),
        );

        let result = collection.spatial.expect("diagnostic result should be carried");
        assert_eq!(result.statistic, 0.31);
        assert_eq!(result.p_value, 0.02);
        let (values, n) = tester.seen.lock().unwrap().clone().unwrap();
        assert_eq!(values, vec![0.5, 0.4, 0.3, 0.45]);
        assert_eq!(n, 4);
    }

    #[test]
    fn misaligned_weight_matrix_skips_the_diagnostic() {
        let estimator = ScriptedEstimator::new();
        let tester = ScriptedTester {
            seen: Mutex::new(None),
        };
        // 3x3 matrix for a 4-region dataset: the test must not run.
        let weights = Array2::<f64>::from_elem((3, 3), 1.0 / 3.0);
        let full = Formula::new("estimate", &["a"]);
        let collection = run_model_selection(
            &estimator,
            &dataset(),
            &full,
            &plan(),
            Some(SpatialDiagnostic {
                tester: &tester,
                weights: &weights,
            }),
        );
        assert!(collection.spatial.is_none());
        assert!(tester.seen.lock().unwrap().is_none());
    }
}
