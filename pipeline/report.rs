//! Persistence for reporting collaborators.
//!
//! The orchestration's terminal [`FitCollection`] is written as one JSON
//! bundle keyed by variant name (failed variants included, with their error
//! kind), plus flat CSV tables: the coefficient table for report rendering
//! and per-variant region predictions for the mapper, keyed by the same
//! canonical region name the dataset was joined on.

use crate::orchestrate::{FitCollection, FitOutcome};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("table write error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no variant named '{0}' in the collection")]
    UnknownVariant(String),
    #[error("variant '{0}' has no fitted model to export")]
    NotFitted(String),
}

/// Writes the whole collection as a single JSON bundle.
pub fn write_bundle(collection: &FitCollection, path: &Path) -> Result<(), ReportError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), collection)?;
    Ok(())
}

pub fn read_bundle(path: &Path) -> Result<FitCollection, ReportError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// One row of the flat coefficient table. Column headers follow the
/// reporting convention (`std.error`, `t.value`, `p.value`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoefficientExport {
    pub term: String,
    pub estimate: f64,
    #[serde(rename = "std.error")]
    pub std_error: f64,
    #[serde(rename = "t.value")]
    pub t_value: f64,
    #[serde(rename = "p.value")]
    pub p_value: f64,
    pub model: String,
}

/// Flattens every fitted variant's coefficient table into one long table.
/// Variant order is the collection's name order, so output is deterministic.
pub fn coefficient_rows(collection: &FitCollection) -> Vec<CoefficientExport> {
    let mut rows = Vec::new();
    for (name, record) in &collection.variants {
        if let FitOutcome::Fitted(model) = &record.outcome {
            for coef in &model.coefficients {
                rows.push(CoefficientExport {
                    term: coef.term.clone(),
                    estimate: coef.estimate,
                    std_error: coef.std_error,
                    t_value: coef.t_value,
                    p_value: coef.p_value,
                    model: name.clone(),
                });
            }
        }
    }
    rows
}

pub fn write_coefficient_table(
    collection: &FitCollection,
    path: &Path,
) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in coefficient_rows(collection) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the per-region prediction table for one fitted variant. The
/// `region` column is the join key guaranteed to the mapper.
pub fn write_prediction_table(
    collection: &FitCollection,
    variant: &str,
    path: &Path,
) -> Result<(), ReportError> {
    let record = collection
        .get(variant)
        .ok_or_else(|| ReportError::UnknownVariant(variant.to_string()))?;
    let model = record
        .outcome
        .model()
        .ok_or_else(|| ReportError::NotFitted(variant.to_string()))?;
    let mut writer = csv::Writer::from_path(path)?;
    for prediction in &model.predictions {
        writer.serialize(prediction)?;
    }
    writer.flush()?;
    Ok(())
}
