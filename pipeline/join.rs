//! # Join & Validation
//!
//! Combines the ingested sources into one [`ModelingDataset`]. The canonical
//! region list is the boundary layer, not any individual data source: joins
//! are left-joins anchored on the boundary's region set, so every boundary
//! region appears exactly once in the output even when all of its covariates
//! are missing.
//!
//! Nothing here aborts on incomplete data. Source rows that do not match any
//! boundary region are dropped with a counted [`Warning::JoinMismatch`]
//! (usually a sign that name normalization failed upstream), and missing
//! responses are counted into a [`Warning::MissingResponse`]. The caller
//! decides what to do with a partial set.

use crate::ingest::{BoundaryAttributes, CovariateTable, DirectEstimates};
use crate::types::Warning;
use itertools::Itertools;
use polars::prelude::*;
use std::collections::HashSet;
use thiserror::Error;

pub const REGION_COL: &str = "region";
pub const RESPONSE_COL: &str = "estimate";
pub const VARIANCE_COL: &str = "variance";
pub const ESS_COL: &str = "ess";

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("indicator '{indicator}' from source '{source_name}' collides with an existing column")]
    DuplicateIndicator {
        indicator: String,
        source_name: String,
    },
}

/// The joined, validated modeling input. Immutable after construction: every
/// downstream step takes a shared reference and none mutates it.
#[derive(Debug, Clone)]
pub struct ModelingDataset {
    frame: DataFrame,
    covariates: Vec<String>,
}

impl ModelingDataset {
    /// Wraps an already-joined frame. The frame must carry the canonical
    /// role columns (`region`, `estimate`, `variance`, `ess`); covariates
    /// are the candidate predictor columns.
    pub fn from_frame(frame: DataFrame, covariates: Vec<String>) -> Self {
        Self { frame, covariates }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    pub fn n_regions(&self) -> usize {
        self.frame.height()
    }

    pub fn region_names(&self) -> Result<Vec<String>, PolarsError> {
        let casted = self.frame.column(REGION_COL)?.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect())
    }

    /// A numeric column as `Option<f64>` per region, in boundary order.
    pub fn numeric(&self, column: &str) -> Result<Vec<Option<f64>>, PolarsError> {
        let casted = self.frame.column(column)?.cast(&DataType::Float64)?;
        Ok(casted.f64()?.into_iter().collect())
    }

    pub fn response(&self) -> Result<Vec<Option<f64>>, PolarsError> {
        self.numeric(RESPONSE_COL)
    }

    /// True when `column` holds numeric data (a screening candidate).
    pub fn is_numeric(&self, column: &str) -> bool {
        matches!(
            self.frame.column(column).map(|c| c.dtype().clone()),
            Ok(DataType::Float64
                | DataType::Float32
                | DataType::Int64
                | DataType::Int32
                | DataType::Int16
                | DataType::Int8
                | DataType::UInt64
                | DataType::UInt32
                | DataType::UInt16
                | DataType::UInt8)
        )
    }
}

/// Left-joins the direct estimates and every covariate table onto the
/// boundary region list and validates the result.
pub fn build_modeling_dataset(
    boundary: &BoundaryAttributes,
    direct: &DirectEstimates,
    covariate_tables: &[CovariateTable],
) -> Result<(ModelingDataset, Vec<Warning>), JoinError> {
    let mut warnings = Vec::new();
    let boundary_set: HashSet<String> =
        boundary.regions.iter().map(|r| r.name.clone()).collect();

    report_mismatch(
        &mut warnings,
        "direct_estimates",
        &direct.frame,
        &boundary_set,
    )?;

    let mut joined = boundary
        .frame
        .left_join(&direct.frame, [REGION_COL], [REGION_COL])?;
    let mut covariates: Vec<String> = Vec::new();

    for table in covariate_tables {
        report_mismatch(&mut warnings, &table.name, &table.frame, &boundary_set)?;

        let existing: HashSet<String> = joined
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        for col in table.frame.get_column_names() {
            let col = col.as_str();
            if col != REGION_COL && existing.contains(col) {
                return Err(JoinError::DuplicateIndicator {
                    indicator: col.to_string(),
                    source_name: table.name.clone(),
                });
            }
        }

        joined = joined.left_join(&table.frame, [REGION_COL], [REGION_COL])?;
        covariates.extend(
            table
                .frame
                .get_column_names()
                .iter()
                .map(|s| s.to_string())
                .filter(|c| c != REGION_COL),
        );
    }

    // Join completeness: anchored left joins against unique keys preserve
    // the boundary row set exactly.
    debug_assert_eq!(joined.height(), boundary.regions.len());

    let missing_response = joined.column(RESPONSE_COL)?.null_count();
    if missing_response > 0 {
        log::warn!("{missing_response} region(s) lack a response value after the join");
        warnings.push(Warning::MissingResponse {
            count: missing_response,
        });
    }

    Ok((ModelingDataset::from_frame(joined, covariates), warnings))
}

/// Counts source regions that the boundary layer does not know about. They
/// will be dropped by the anchored join; the warning is what distinguishes
/// "normalization failed" from "legitimately excluded".
fn report_mismatch(
    warnings: &mut Vec<Warning>,
    source: &str,
    frame: &DataFrame,
    boundary_set: &HashSet<String>,
) -> Result<(), JoinError> {
    let casted = frame.column(REGION_COL)?.cast(&DataType::String)?;
    let orphans: Vec<String> = casted
        .str()?
        .into_iter()
        .flatten()
        .filter(|name| !boundary_set.contains(*name))
        .map(str::to_string)
        .sorted()
        .collect();
    if !orphans.is_empty() {
        log::warn!(
            "{} region(s) in source '{source}' not in the boundary layer: {}",
            orphans.len(),
            orphans.join(", ")
        );
        warnings.push(Warning::JoinMismatch {
            source: source.to_string(),
            count: orphans.len(),
            names: orphans,
        });
    }
    Ok(())
}
