//! # Source Ingestion & Normalization
//!
//! This module is the exclusive entry point for raw tabular sources: the
//! survey direct estimates, the boundary layer's attribute table, and the
//! covariate tables (zonal geospatial summaries, population density, vacancy
//! counts). Each loader returns data keyed by a canonical region name and
//! fails loudly on anything that smells like upstream format drift.
//!
//! - Missing-value sentinels (SCB's "..") are converted to explicit nulls
//!   before numeric conversion; a parse failure on a non-sentinel token is a
//!   fatal [`IngestError::NonNumeric`], never a silent NaN.
//! - Survey margins of error become sampling variances here, once, and the
//!   result is immutable input to everything downstream.
//! - Covariate columns are year-suffixed (`ndvi_2025`); when the target year
//!   is absent or entirely empty the loader falls back to the most recent
//!   prior year and records the effective year per indicator in a queryable
//!   [`YearProvenance`], not just a log line.

use crate::config::IngestConfig;
use crate::normalize::{NameLookup, normalize_region};
use crate::types::{DirectEstimate, Region};
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Estimates with magnitude below this get a warning when their effective
/// sample size is computed; the value itself is kept (see DESIGN.md).
const NEAR_ZERO_ESTIMATE: f64 = 1e-3;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("the required column '{0}' was not found in the input file")]
    ColumnNotFound(String),
    #[error(
        "column '{column}' contains the non-numeric value '{value}' at row {row}; \
         if this token means 'not available' it must be listed as a sentinel"
    )]
    NonNumeric {
        column: String,
        value: String,
        row: usize,
    },
    #[error("column '{column}' has unsupported type {dtype} where numeric data was expected")]
    NonNumericColumn { column: String, dtype: String },
    #[error("region name is missing at row {row} of column '{column}'")]
    MissingRegionName { column: String, row: usize },
    #[error("region '{name}' appears more than once after normalization")]
    DuplicateRegion { name: String },
    #[error("negative margin of error {margin} for region '{region}'")]
    NegativeMargin { region: String, margin: f64 },
    #[error("covariate table '{path}' has no year-suffixed indicator columns")]
    NoIndicators { path: String },
}

// ========================================================================================
//                              Shared column extraction
// ========================================================================================

pub(crate) fn read_csv(path: &Path) -> Result<DataFrame, IngestError> {
    let file = File::open(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;
    Ok(df)
}

/// Extracts a column of canonical region names, normalizing each raw value.
pub(crate) fn region_column(
    df: &DataFrame,
    column: &str,
    lookup: &NameLookup,
) -> Result<Vec<String>, IngestError> {
    let col = df
        .column(column)
        .map_err(|_| IngestError::ColumnNotFound(column.to_string()))?;
    let casted = col.cast(&DataType::String)?;
    let ca = casted.str()?;
    let mut out = Vec::with_capacity(ca.len());
    for (row, value) in ca.into_iter().enumerate() {
        match value {
            Some(raw) if !raw.trim().is_empty() => out.push(normalize_region(raw, lookup)),
            _ => {
                return Err(IngestError::MissingRegionName {
                    column: column.to_string(),
                    row: row + 1,
                });
            }
        }
    }
    Ok(out)
}

/// Extracts a numeric column, mapping sentinel tokens to nulls first.
///
/// String-typed columns are parsed value by value so that a bad token is
/// reported with its row, instead of polars' cast turning it into a null.
pub(crate) fn numeric_column(
    df: &DataFrame,
    column: &str,
    sentinels: &[String],
) -> Result<Vec<Option<f64>>, IngestError> {
    let col = df
        .column(column)
        .map_err(|_| IngestError::ColumnNotFound(column.to_string()))?;
    match col.dtype() {
        DataType::String => {
            let ca = col.str()?;
            let mut out = Vec::with_capacity(ca.len());
            for (row, value) in ca.into_iter().enumerate() {
                let parsed = match value {
                    None => None,
                    Some(raw) => {
                        let token = raw.trim();
                        if token.is_empty() || sentinels.iter().any(|s| s == token) {
                            None
                        } else {
                            Some(token.parse::<f64>().map_err(|_| {
                                IngestError::NonNumeric {
                                    column: column.to_string(),
                                    value: token.to_string(),
                                    row: row + 1,
                                }
                            })?)
                        }
                    }
                };
                out.push(parsed);
            }
            Ok(out)
        }
        DataType::Float64
        | DataType::Float32
        | DataType::Int64
        | DataType::Int32
        | DataType::Int16
        | DataType::Int8
        | DataType::UInt64
        | DataType::UInt32
        | DataType::UInt16
        | DataType::UInt8 => {
            let casted = col.cast(&DataType::Float64)?;
            Ok(casted.f64()?.into_iter().collect())
        }
        dtype => Err(IngestError::NonNumericColumn {
            column: column.to_string(),
            dtype: format!("{dtype:?}"),
        }),
    }
}

fn check_unique(names: &[String]) -> Result<(), IngestError> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(IngestError::DuplicateRegion { name: name.clone() });
        }
    }
    Ok(())
}

// ========================================================================================
//                              Direct estimates
// ========================================================================================

/// Two-sided critical value of the standard normal for the given confidence
/// level (0.95 -> 1.96). Acklam's rational approximation of the inverse
/// normal CDF; relative error below 1.15e-9 over the whole domain.
pub fn critical_value(confidence: f64) -> f64 {
    inverse_normal_cdf(1.0 - (1.0 - confidence) / 2.0)
}

fn inverse_normal_cdf(p: f64) -> f64 {
    let p = p.clamp(1e-15, 1.0 - 1e-15);

    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;
    const P_HIGH: f64 = 1.0 - P_LOW;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= P_HIGH {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// The ingested survey estimates: a frame ready for joining plus the typed
/// per-region records.
#[derive(Debug, Clone)]
pub struct DirectEstimates {
    /// Columns: `region`, `estimate`, `margin`, `std_error`, `variance`,
    /// `ess`. Null `ess` means the quantity is undefined for that region.
    pub frame: DataFrame,
    pub rows: Vec<DirectEstimate>,
    /// Regions whose standard error was zero, leaving the effective sample
    /// size undefined.
    pub undefined_ess: usize,
}

/// Reads the survey source and derives sampling quantities from the stated
/// margins of error.
pub fn load_direct_estimates(
    path: &Path,
    cfg: &IngestConfig,
    lookup: &NameLookup,
) -> Result<DirectEstimates, IngestError> {
    let df = read_csv(path)?;
    let regions = region_column(&df, &cfg.region_column, lookup)?;
    check_unique(&regions)?;
    let estimates = numeric_column(&df, &cfg.estimate_column, &cfg.sentinels)?;
    let margins = numeric_column(&df, &cfg.margin_column, &cfg.sentinels)?;

    let z = critical_value(cfg.confidence_level);
    let n = regions.len();
    let mut std_errors: Vec<Option<f64>> = Vec::with_capacity(n);
    let mut variances: Vec<Option<f64>> = Vec::with_capacity(n);
    let mut ess: Vec<Option<f64>> = Vec::with_capacity(n);
    let mut rows = Vec::with_capacity(n);
    let mut undefined_ess = 0usize;

    for i in 0..n {
        let (est, margin) = (estimates[i], margins[i]);
        let (se, var, eff) = match (est, margin) {
            (Some(est), Some(margin)) => {
                if margin < 0.0 {
                    return Err(IngestError::NegativeMargin {
                        region: regions[i].clone(),
                        margin,
                    });
                }
                let se = margin / z;
                let var = se * se;
                let eff = if se == 0.0 {
                    undefined_ess += 1;
                    log::warn!(
                        "region '{}': zero standard error, effective sample size undefined",
                        regions[i]
                    );
                    None
                } else {
                    if est.abs() < NEAR_ZERO_ESTIMATE {
                        log::warn!(
                            "region '{}': near-zero estimate {est}, effective sample size may be unstable",
                            regions[i]
                        );
                    }
                    Some((est / se) * (est / se))
                };
                rows.push(DirectEstimate {
                    region: regions[i].clone(),
                    estimate: est,
                    margin,
                    standard_error: se,
                    sampling_variance: var,
                    effective_sample_size: eff,
                });
                (Some(se), Some(var), eff)
            }
            _ => (None, None, None),
        };
        std_errors.push(se);
        variances.push(var);
        ess.push(eff);
    }

    let frame = DataFrame::new(vec![
        Column::new("region".into(), regions),
        Column::new("estimate".into(), estimates),
        Column::new("margin".into(), margins),
        Column::new("std_error".into(), std_errors),
        Column::new("variance".into(), variances),
        Column::new("ess".into(), ess),
    ])?;

    Ok(DirectEstimates {
        frame,
        rows,
        undefined_ess,
    })
}

// ========================================================================================
//                              Boundary attributes
// ========================================================================================

/// The boundary layer's attribute table. The geometry itself is owned by the
/// mapper; this crate only needs the canonical region list and the coarse
/// grouping factor.
#[derive(Debug, Clone)]
pub struct BoundaryAttributes {
    /// Columns: `region` and, when configured, `group`.
    pub frame: DataFrame,
    pub regions: Vec<Region>,
}

pub fn load_boundary_attributes(
    path: &Path,
    cfg: &IngestConfig,
    lookup: &NameLookup,
) -> Result<BoundaryAttributes, IngestError> {
    let df = read_csv(path)?;
    let names = region_column(&df, &cfg.region_column, lookup)?;
    check_unique(&names)?;

    let groups: Vec<Option<String>> = match &cfg.group_column {
        Some(group_col) => {
            let col = df
                .column(group_col)
                .map_err(|_| IngestError::ColumnNotFound(group_col.clone()))?;
            let casted = col.cast(&DataType::String)?;
            casted
                .str()?
                .into_iter()
                .map(|v| v.map(|s| s.trim().to_string()))
                .collect()
        }
        None => vec![None; names.len()],
    };

    let regions: Vec<Region> = names
        .iter()
        .zip(&groups)
        .map(|(name, group)| Region {
            name: name.clone(),
            group: group.clone(),
        })
        .collect();

    let mut columns = vec![Column::new("region".into(), names)];
    if cfg.group_column.is_some() {
        columns.push(Column::new("group".into(), groups));
    }
    let frame = DataFrame::new(columns)?;
    Ok(BoundaryAttributes { frame, regions })
}

// ========================================================================================
//                              Covariate tables with year fallback
// ========================================================================================

/// Which source year actually supplied each indicator. Queryable, per
/// indicator; a fallback is data lineage, not a log line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YearProvenance(BTreeMap<String, u16>);

impl YearProvenance {
    pub fn effective_year(&self, indicator: &str) -> Option<u16> {
        self.0.get(indicator).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// One ingested covariate source, keyed by canonical region name.
#[derive(Debug, Clone)]
pub struct CovariateTable {
    /// Source label used in join-mismatch warnings (file stem).
    pub name: String,
    /// Columns: `region` plus one column per indicator (year suffix removed).
    pub frame: DataFrame,
    pub provenance: YearProvenance,
}

/// Reads a covariate table whose indicator columns carry year suffixes
/// (`ndvi_2025`, `ndvi_2024`, ...). For each indicator the target-year
/// column is preferred; if it is absent or entirely empty, the most recent
/// prior year with any data is used instead and recorded in the provenance.
pub fn load_covariate_source(
    path: &Path,
    cfg: &IngestConfig,
    lookup: &NameLookup,
) -> Result<CovariateTable, IngestError> {
    let df = read_csv(path)?;
    let regions = region_column(&df, &cfg.region_column, lookup)?;
    check_unique(&regions)?;

    // indicator -> available years, in header order within each indicator
    let mut indicators: BTreeMap<String, Vec<u16>> = BTreeMap::new();
    for col_name in df.get_column_names() {
        let col_name = col_name.as_str();
        if col_name == cfg.region_column {
            continue;
        }
        if let Some((indicator, year)) = split_year_suffix(col_name) {
            indicators.entry(indicator.to_string()).or_default().push(year);
        }
    }
    if indicators.is_empty() {
        return Err(IngestError::NoIndicators {
            path: path.display().to_string(),
        });
    }

    let mut columns = vec![Column::new("region".into(), regions)];
    let mut provenance = BTreeMap::new();

    for (indicator, mut years) in indicators {
        years.sort_unstable_by(|a, b| b.cmp(a));
        let chosen = choose_year(&df, &indicator, &years, cfg)?;
        let (year, values) = match chosen {
            Some((year, values)) => (year, values),
            None => {
                // No year has any data; carry the indicator as all-null under
                // the target year so the gap is visible downstream.
                log::warn!(
                    "indicator '{indicator}' in '{}' has no data for any year",
                    path.display()
                );
                (cfg.target_year, vec![None; df.height()])
            }
        };
        if year != cfg.target_year {
            log::info!(
                "indicator '{indicator}': target year {} unavailable, using {year}",
                cfg.target_year
            );
        }
        provenance.insert(indicator.clone(), year);
        columns.push(Column::new(indicator.as_str().into(), values));
    }

    let frame = DataFrame::new(columns)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(CovariateTable {
        name,
        frame,
        provenance: YearProvenance(provenance),
    })
}

/// Picks the column for one indicator: the target year when it has any
/// non-null value, otherwise the most recent prior year that does.
fn choose_year(
    df: &DataFrame,
    indicator: &str,
    years_desc: &[u16],
    cfg: &IngestConfig,
) -> Result<Option<(u16, Vec<Option<f64>>)>, IngestError> {
    for &year in years_desc {
        if year > cfg.target_year {
            continue;
        }
        let column = format!("{indicator}_{year}");
        let values = numeric_column(df, &column, &cfg.sentinels)?;
        if values.iter().any(Option::is_some) {
            return Ok(Some((year, values)));
        }
    }
    Ok(None)
}

/// Splits `ndvi_2024` into `("ndvi", 2024)`. Returns `None` for columns with
/// no plausible year suffix.
fn split_year_suffix(column: &str) -> Option<(&str, u16)> {
    let (indicator, suffix) = column.rsplit_once('_')?;
    if indicator.is_empty() || suffix.len() != 4 {
        return None;
    }
    let year: u16 = suffix.parse().ok()?;
    (1900..=2199).contains(&year).then_some((indicator, year))
}

// ========================================================================================
//                                      Tests
// ========================================================================================
