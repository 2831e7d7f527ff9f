#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, Subcommand};
use polars::prelude::{CsvWriter, SerWriter};
use std::error::Error;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;

use areal::config::RunConfig;
use areal::ingest::{
    CovariateTable, load_boundary_attributes, load_covariate_source, load_direct_estimates,
};
use areal::join::build_modeling_dataset;
use areal::orchestrate::FitCollection;
use areal::report::{read_bundle, write_coefficient_table, write_prediction_table};
use areal::screen::screen_covariates;
use areal::types::Warning;

#[derive(Parser)]
#[clap(
    name = "areal",
    version,
    about = "Builds and screens the modeling dataset for area-level small-area estimation."
)]
struct Cli {
    /// Path to the run configuration TOML.
    #[arg(long, default_value = "areal.toml")]
    config: PathBuf,

    /// Root for relative source paths in the config.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for output tables.
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Override the configured target year for covariate columns.
    #[arg(long)]
    target_year: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest all sources, join onto the boundary layer, and write the
    /// validated modeling dataset.
    Prepare,
    /// Prepare, then rank covariates and run the collinearity check.
    Screen,
    /// Flatten a fitted-model bundle produced by the estimator service into
    /// the coefficient table and per-variant prediction tables.
    Export {
        /// Path to the JSON bundle of fitted variants.
        #[arg(long)]
        bundle: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{err}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let Command::Export { bundle } = &cli.command {
        return export(bundle, &cli.out_dir);
    }

    let mut cfg = RunConfig::load(&cli.config)?;
    if let Some(year) = cli.target_year {
        cfg.ingest.target_year = year;
    }
    if let Some(data_dir) = &cli.data_dir {
        cfg.sources = cfg.sources.rooted(data_dir);
    }
    let lookup = cfg.name_lookup();

    let boundary = load_boundary_attributes(&cfg.sources.boundary, &cfg.ingest, &lookup)?;
    log::info!(
        "boundary layer: {} regions from '{}'",
        boundary.regions.len(),
        cfg.sources.boundary.display()
    );

    let direct = load_direct_estimates(&cfg.sources.direct_estimates, &cfg.ingest, &lookup)?;
    log::info!(
        "direct estimates: {} usable rows ({} with undefined effective sample size)",
        direct.rows.len(),
        direct.undefined_ess
    );

    let mut tables: Vec<CovariateTable> = Vec::new();
    for path in &cfg.sources.covariates {
        let table = load_covariate_source(path, &cfg.ingest, &lookup)?;
        for (indicator, year) in table.provenance.iter() {
            if year != cfg.ingest.target_year {
                log::info!("covariate '{indicator}': using {year} data (fallback)");
            }
        }
        tables.push(table);
    }

    let (dataset, mut warnings) = build_modeling_dataset(&boundary, &direct, &tables)?;

    fs::create_dir_all(&cli.out_dir)?;
    let dataset_path = cli.out_dir.join("modeling_dataset.csv");
    let mut frame = dataset.frame().clone();
    CsvWriter::new(File::create(&dataset_path)?).finish(&mut frame)?;
    log::info!(
        "modeling dataset: {} regions x {} covariates -> '{}'",
        dataset.n_regions(),
        dataset.covariates().len(),
        dataset_path.display()
    );

    if let Command::Screen = cli.command {
        let (result, screen_warnings) = screen_covariates(&dataset, &cfg.screening)?;
        warnings.extend(screen_warnings);

        if result.skipped {
            log::info!("screening skipped; {} candidate(s) pass through", result.selected.len());
        } else {
            for candidate in &result.ranking {
                log::info!(
                    "  {:<24} r = {:+.3}  (n = {})",
                    candidate.name,
                    candidate.correlation,
                    candidate.n_pairs
                );
            }
            log::info!("selected top-{}: {}", result.selected.len(), result.selected.join(", "));
            for entry in &result.vif {
                log::info!("  VIF {:<24} {:.2}", entry.predictor, entry.vif);
            }
        }

        let screening_path = cli.out_dir.join("screening.json");
        serde_json::to_writer_pretty(File::create(&screening_path)?, &result)?;
        log::info!("screening report -> '{}'", screening_path.display());
    }

    report_warnings(&warnings);
    Ok(())
}

/// Reads a persisted fit bundle and writes the flat reporting tables:
/// `coefficients.csv` plus one `predictions_<variant>.csv` per fitted
/// variant, keyed on the canonical region name.
fn export(bundle: &Path, out_dir: &Path) -> Result<(), Box<dyn Error>> {
    let collection = read_bundle(bundle)?;
    fs::create_dir_all(out_dir)?;

    let coef_path = out_dir.join("coefficients.csv");
    write_coefficient_table(&collection, &coef_path)?;
    log::info!("coefficient table -> '{}'", coef_path.display());

    for name in collection.names() {
        if collection.fitted(name).is_none() {
            continue;
        }
        let path = out_dir.join(format!("predictions_{name}.csv"));
        write_prediction_table(&collection, name, &path)?;
        log::info!("predictions for '{name}' -> '{}'", path.display());
    }

    if let Some(spatial) = &collection.spatial {
        log::info!(
            "spatial autocorrelation: statistic {:.4}, p = {:.4}",
            spatial.statistic,
            spatial.p_value
        );
    }
    report_failures(&collection);
    Ok(())
}

fn report_failures(collection: &FitCollection) {
    let failures = collection.failures();
    if failures.is_empty() {
        log::info!("all {} variants fitted", collection.variants.len());
        return;
    }
    log::warn!(
        "{} of {} variants failed:",
        failures.len(),
        collection.variants.len()
    );
    for (name, kind) in &failures {
        log::warn!("  {name}: {kind:?}");
    }
}

fn report_warnings(warnings: &[Warning]) {
    if warnings.is_empty() {
        log::info!("no warnings");
        return;
    }
    log::warn!("{} warning(s):", warnings.len());
    for warning in warnings {
        log::warn!("  {warning}");
    }
}
