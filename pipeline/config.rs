//! Run configuration.
//!
//! Everything that was ambient state in older versions of this analysis (the
//! name-lookup table, the confidence level, which transformations to enable)
//! is explicit configuration here, deserialized once from a TOML file and
//! passed down by value. Nothing reads configuration from globals.

use crate::normalize::NameLookup;
use crate::types::{Criterion, Transformation};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid confidence level {0}; expected a value in (0, 1)")]
    BadConfidence(f64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub sources: Sources,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub screening: ScreeningConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Alternate/misspelled region name -> canonical name.
    #[serde(default)]
    pub name_lookup: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sources {
    /// Attribute table of the boundary layer: the canonical region list.
    pub boundary: PathBuf,
    /// Survey direct estimates (region, estimate, margin of error).
    pub direct_estimates: PathBuf,
    /// Covariate tables with year-suffixed indicator columns.
    #[serde(default)]
    pub covariates: Vec<PathBuf>,
}

impl Sources {
    /// Re-roots every relative source path under `data_dir`. Absolute paths
    /// are left alone, so a config can mix both.
    pub fn rooted(self, data_dir: &Path) -> Self {
        let root = |p: PathBuf| {
            if p.is_absolute() { p } else { data_dir.join(p) }
        };
        Self {
            boundary: root(self.boundary),
            direct_estimates: root(self.direct_estimates),
            covariates: self.covariates.into_iter().map(root).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Source-format tokens meaning "not available" (SCB uses "..").
    pub sentinels: Vec<String>,
    /// Confidence level the survey margins are stated at.
    pub confidence_level: f64,
    /// Year whose covariate columns are preferred; earlier years are
    /// fallback.
    pub target_year: u16,
    pub region_column: String,
    pub estimate_column: String,
    pub margin_column: String,
    pub group_column: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sentinels: vec!["..".to_string()],
            confidence_level: 0.95,
            target_year: 2025,
            region_column: "region".to_string(),
            estimate_column: "estimate".to_string(),
            margin_column: "margin".to_string(),
            group_column: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    pub top_k: usize,
    pub vif_threshold: f64,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            vif_threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub criterion: Criterion,
    pub bootstrap_reps: usize,
    pub transformations: Vec<Transformation>,
    /// Wall-clock budget per estimator fit, in seconds. `None` disables the
    /// budget; enforcement lives in the estimator service.
    pub fit_timeout_secs: Option<u64>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            criterion: Criterion::Aic,
            bootstrap_reps: 200,
            transformations: vec![
                Transformation::Identity,
                Transformation::ArcsinSqrt,
                Transformation::Log,
                Transformation::Logit,
            ],
            fit_timeout_secs: None,
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: RunConfig = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let c = self.ingest.confidence_level;
        if !(c > 0.0 && c < 1.0) {
            return Err(ConfigError::BadConfidence(c));
        }
        Ok(())
    }

    pub fn name_lookup(&self) -> NameLookup {
        NameLookup::new(
            self.name_lookup
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}
