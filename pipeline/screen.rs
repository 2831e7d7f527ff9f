//! # Covariate Screening
//!
//! Ranks numeric candidate covariates by strength of association with the
//! response and flags multicollinearity among the top-ranked set. Screening
//! is advisory: it orders and annotates, it never blocks a model fit.
//!
//! Determinism matters here because the ranking feeds the model formulas:
//! correlations use pairwise-complete observations, the sort is stable, and
//! ties keep the original candidate-list order, so identical input data
//! yields a byte-identical ranking.

use crate::config::ScreeningConfig;
use crate::join::ModelingDataset;
use crate::types::Warning;
use ndarray::{Array1, Array2};
use polars::prelude::PolarsError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScreenError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub name: String,
    /// Pearson correlation with the response over pairwise-complete
    /// observations. NaN when fewer than two complete pairs exist or a side
    /// is constant.
    pub correlation: f64,
    pub n_pairs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VifEntry {
    pub predictor: String,
    pub vif: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreeningResult {
    pub ranking: Vec<RankedCandidate>,
    /// The top-k candidate names, in rank order. These become the screened
    /// model formula.
    pub selected: Vec<String>,
    pub vif: Vec<VifEntry>,
    /// True when the VIF check actually ran; an empty `vif` with this false
    /// means "not checkable", not "all clear".
    pub vif_checked: bool,
    /// True when fewer than two numeric candidates existed and screening was
    /// skipped entirely.
    pub skipped: bool,
}

/// Ranks the dataset's numeric covariates against the response and checks
/// variance inflation among the top-k.
pub fn screen_covariates(
    data: &ModelingDataset,
    cfg: &ScreeningConfig,
) -> Result<(ScreeningResult, Vec<Warning>), ScreenError> {
    let mut warnings = Vec::new();

    let candidates: Vec<String> = data
        .covariates()
        .iter()
        .filter(|c| data.is_numeric(c))
        .cloned()
        .collect();

    if candidates.len() < 2 {
        log::info!(
            "covariate screening skipped: {} numeric candidate(s)",
            candidates.len()
        );
        warnings.push(Warning::ScreeningSkipped {
            candidates: candidates.len(),
        });
        return Ok((
            ScreeningResult {
                ranking: Vec::new(),
                selected: candidates,
                vif: Vec::new(),
                vif_checked: false,
                skipped: true,
            },
            warnings,
        ));
    }

    let response = data.response()?;
    let mut ranking: Vec<RankedCandidate> = Vec::with_capacity(candidates.len());
    for name in &candidates {
        let values = data.numeric(name)?;
        let (correlation, n_pairs) = pearson_pairwise(&values, &response);
        ranking.push(RankedCandidate {
            name: name.clone(),
            correlation,
            n_pairs,
        });
    }

    // Stable sort by |r| descending: ties (and NaNs, ranked last) keep the
    // original candidate order.
    ranking.sort_by(|a, b| sort_key(b.correlation).total_cmp(&sort_key(a.correlation)));

    let k = cfg.top_k.min(ranking.len());
    let selected: Vec<String> = ranking.iter().take(k).map(|c| c.name.clone()).collect();

    let (vif, vif_checked) = match variance_inflation(data, &selected)? {
        VifCheck::Checked(entries) => (entries, true),
        VifCheck::TooFewCases { complete_cases } => {
            warnings.push(Warning::VifUnchecked { complete_cases });
            (Vec::new(), false)
        }
    };
    let offending: Vec<String> = vif
        .iter()
        .filter(|entry| entry.vif > cfg.vif_threshold)
        .map(|entry| entry.predictor.clone())
        .collect();
    if !offending.is_empty() {
        log::warn!(
            "variance inflation above {} for: {}",
            cfg.vif_threshold,
            offending.join(", ")
        );
        warnings.push(Warning::Collinearity {
            predictors: offending,
        });
    }

    Ok((
        ScreeningResult {
            ranking,
            selected,
            vif,
            vif_checked,
            skipped: false,
        },
        warnings,
    ))
}

fn sort_key(r: f64) -> f64 {
    if r.is_nan() { f64::NEG_INFINITY } else { r.abs() }
}

/// Pearson correlation over pairwise-complete observations: a pair is
/// excluded only when either side is missing, never the whole column.
fn pearson_pairwise(x: &[Option<f64>], y: &[Option<f64>]) -> (f64, usize) {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter_map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => Some((*a, *b)),
            _ => None,
        })
        .collect();
    let n = pairs.len();
    if n < 2 {
        return (f64::NAN, n);
    }
    let nf = n as f64;
    let mean_x = pairs.iter().map(|(a, _)| a).sum::<f64>() / nf;
    let mean_y = pairs.iter().map(|(_, b)| b).sum::<f64>() / nf;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in &pairs {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return (f64::NAN, n);
    }
    (sxy / (sxx * syy).sqrt(), n)
}

/// Outcome of the VIF pass: entries, or the reason it could not run.
enum VifCheck {
    Checked(Vec<VifEntry>),
    TooFewCases { complete_cases: usize },
}

/// VIF per selected predictor: regress each on the others (with intercept)
/// over complete cases and take 1 / (1 - R²). A singular system means exact
/// collinearity and is reported as infinite.
fn variance_inflation(
    data: &ModelingDataset,
    selected: &[String],
) -> Result<VifCheck, ScreenError> {
    if selected.len() < 2 {
        return Ok(VifCheck::Checked(
            selected
                .iter()
                .map(|name| VifEntry {
                    predictor: name.clone(),
                    vif: 1.0,
                })
                .collect(),
        ));
    }

    let columns: Vec<Vec<Option<f64>>> = selected
        .iter()
        .map(|name| data.numeric(name))
        .collect::<Result<_, _>>()?;

    // Complete cases across all selected predictors.
    let n_rows = columns[0].len();
    let complete: Vec<usize> = (0..n_rows)
        .filter(|&i| columns.iter().all(|col| col[i].is_some()))
        .collect();
    if complete.len() < selected.len() + 2 {
        log::warn!(
            "too few complete cases ({}) for a VIF check on {} predictors",
            complete.len(),
            selected.len()
        );
        return Ok(VifCheck::TooFewCases {
            complete_cases: complete.len(),
        });
    }

    let matrix: Vec<Vec<f64>> = columns
        .iter()
        .map(|col| complete.iter().map(|&i| col[i].unwrap()).collect())
        .collect();

    let mut out = Vec::with_capacity(selected.len());
    for (j, name) in selected.iter().enumerate() {
        let y: Vec<f64> = matrix[j].clone();
        let others: Vec<&Vec<f64>> = matrix
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != j)
            .map(|(_, col)| col)
            .collect();
        let r2 = ols_r_squared(&others, &y);
        let vif = match r2 {
            Some(r2) if r2 < 1.0 => 1.0 / (1.0 - r2),
            _ => f64::INFINITY,
        };
        out.push(VifEntry {
            predictor: name.clone(),
            vif,
        });
    }
    Ok(VifCheck::Checked(out))
}

/// R² of an intercept-plus-predictors OLS fit. `None` when the normal
/// equations are singular.
fn ols_r_squared(predictors: &[&Vec<f64>], y: &[f64]) -> Option<f64> {
    let n = y.len();
    let p = predictors.len() + 1;
    let mut design = Array2::zeros((n, p));
    for i in 0..n {
        design[[i, 0]] = 1.0;
        for (j, col) in predictors.iter().enumerate() {
            design[[i, j + 1]] = col[i];
        }
    }
    let yv = Array1::from_vec(y.to_vec());

    let xtx = design.t().dot(&design);
    let xty = design.t().dot(&yv);
    let beta = solve_spd(&xtx, &xty)?;

    let fitted = design.dot(&beta);
    let mean_y = yv.sum() / n as f64;
    let sst: f64 = yv.iter().map(|v| (v - mean_y).powi(2)).sum();
    if sst == 0.0 {
        return Some(0.0);
    }
    let ssr: f64 = yv
        .iter()
        .zip(fitted.iter())
        .map(|(obs, fit)| (obs - fit).powi(2))
        .sum();
    Some(1.0 - ssr / sst)
}

/// Cholesky solve of a small symmetric positive-definite system. The normal
/// matrices here are (k+1)x(k+1) with k the screened predictor count, so a
/// dense textbook factorization is all that is needed.
fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 1e-12 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    // Forward substitution L z = b, then back substitution L' x = z.
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * z[k];
        }
        z[i] = sum / l[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use polars::prelude::*;

    fn dataset(columns: Vec<(&str, Vec<Option<f64>>)>) -> ModelingDataset {
        let n = columns[0].1.len();
        let regions: Vec<String> = (0..n).map(|i| format!("R{i:02}")).collect();
        let mut cols = vec![Column::new("region".into(), regions)];
        let mut covariates = Vec::new();
        for (name, values) in columns {
            if name != "estimate" && name != "variance" {
                covariates.push(name.to_string());
            }
            cols.push(Column::new(name.into(), values));
        }
        ModelingDataset::from_frame(DataFrame::new(cols).unwrap(), covariates)
    }

    fn vals(v: &[f64]) -> Vec<Option<f64>> {
        v.iter().copied().map(Some).collect()
    }

    #[test]
    fn ranking_orders_by_absolute_correlation() {
        // b is a perfect copy of the response, c is a noisy negative version,
        // a is noise: expect [b, c] for top-2, in that order.
        let y = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        let b = y.clone();
        let c: Vec<f64> = y
            .iter()
            .enumerate()
            .map(|(i, v)| -v + if i % 2 == 0 { 0.08 } else { -0.05 })
            .collect();
        let a = vec![0.4, 0.1, 0.44, 0.02, 0.31, 0.15, 0.27, 0.33];
        let data = dataset(vec![
            ("estimate", vals(&y)),
            ("a", vals(&a)),
            ("b", vals(&b)),
            ("c", vals(&c)),
        ]);
        let cfg = ScreeningConfig {
            top_k: 2,
            vif_threshold: 5.0,
        };
        let (result, _) = screen_covariates(&data, &cfg).unwrap();
        assert_eq!(result.selected, vec!["b".to_string(), "c".to_string()]);
        assert!(!result.skipped);
        assert_abs_diff_eq!(result.ranking[0].correlation, 1.0, epsilon = 1e-12);
        assert!(result.ranking[1].correlation < 0.0);
    }

    #[test]
    fn ranking_is_deterministic_with_stable_tie_break() {
        // Two identical candidates tie exactly; the original candidate-list
        // order must decide, run after run.
        let y = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let data = dataset(vec![
            ("estimate", vals(&y)),
            ("first", vals(&y)),
            ("second", vals(&y)),
        ]);
        let cfg = ScreeningConfig::default();
        let (a, _) = screen_covariates(&data, &cfg).unwrap();
        let (b, _) = screen_covariates(&data, &cfg).unwrap();
        let order_a: Vec<&str> = a.ranking.iter().map(|c| c.name.as_str()).collect();
        let order_b: Vec<&str> = b.ranking.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(order_a, vec!["first", "second"]);
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn pairwise_complete_uses_only_joint_observations() {
        let x = vec![Some(1.0), None, Some(3.0), Some(4.0), Some(5.0)];
        let y = vec![Some(2.0), Some(9.0), None, Some(8.0), Some(10.0)];
        let (r, n) = pearson_pairwise(&x, &y);
        assert_eq!(n, 3);
        assert!(r.is_finite());
    }

    #[test]
    fn fewer_than_two_candidates_skips_screening() {
        let y = vec![1.0, 2.0, 3.0];
        let data = dataset(vec![("estimate", vals(&y)), ("only", vals(&y))]);
        let (result, warnings) =
            screen_covariates(&data, &ScreeningConfig::default()).unwrap();
        assert!(result.skipped);
        assert_eq!(result.selected, vec!["only".to_string()]);
        assert_eq!(warnings, vec![Warning::ScreeningSkipped { candidates: 1 }]);
    }

    #[test]
    fn collinear_predictors_are_flagged_not_fatal() {
        // second = 2 * first (exact collinearity) -> VIF far above threshold.
        let y = vec![0.2, 0.4, 0.5, 0.7, 0.9, 1.1];
        let first = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let second: Vec<f64> = first.iter().map(|v| v * 2.0).collect();
        let data = dataset(vec![
            ("estimate", vals(&y)),
            ("first", vals(&first)),
            ("second", vals(&second)),
        ]);
        let (result, warnings) =
            screen_covariates(&data, &ScreeningConfig::default()).unwrap();
        assert!(result.vif.iter().all(|entry| entry.vif > 1e6));
        assert!(matches!(&warnings[0], Warning::Collinearity { predictors } if predictors.len() == 2));
    }

    #[test]
    fn too_few_complete_cases_flags_vif_unchecked() {
        // Each predictor is missing on a different pair of rows, leaving only
        // two joint complete cases: not enough to regress one on the other.
        let y = vals(&[0.2, 0.4, 0.5, 0.7, 0.9, 1.1]);
        let first = vec![None, None, Some(3.0), Some(4.0), Some(5.0), Some(6.0)];
        let second = vec![Some(1.0), Some(2.0), None, None, Some(4.5), Some(5.5)];
        let data = dataset(vec![
            ("estimate", y),
            ("first", first),
            ("second", second),
        ]);
        let (result, warnings) =
            screen_covariates(&data, &ScreeningConfig::default()).unwrap();
        assert!(!result.skipped);
        assert!(!result.vif_checked);
        assert!(result.vif.is_empty());
        assert!(warnings.contains(&Warning::VifUnchecked { complete_cases: 2 }));
    }

    #[test]
    fn independent_predictors_have_low_vif() {
        let y = vec![0.2, 0.4, 0.5, 0.7, 0.9, 1.1, 0.8, 0.3];
        let first = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let second = vec![5.0, -3.0, 4.0, -1.0, 2.0, 0.5, -2.0, 3.0];
        let data = dataset(vec![
            ("estimate", vals(&y)),
            ("first", vals(&first)),
            ("second", vals(&second)),
        ]);
        let (result, warnings) =
            screen_covariates(&data, &ScreeningConfig::default()).unwrap();
        assert!(warnings.is_empty());
        assert!(result.vif_checked);
        for entry in &result.vif {
            assert!(entry.vif >= 1.0 && entry.vif < 5.0, "{entry:?}");
        }
    }

    #[test]
    fn solve_spd_recovers_known_solution() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let b = ndarray::arr1(&[10.0, 8.0]);
        let x = solve_spd(&a, &b).unwrap();
        assert_abs_diff_eq!(x[0], 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.5, epsilon = 1e-12);
    }
}
