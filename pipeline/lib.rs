// ========================================================================================
//
//                                        areal
//
// ========================================================================================
//
// Area-level small-area estimation plumbing: ingest survey direct estimates
// and geospatial covariates, reconcile region names, join and validate
// against the boundary layer, screen covariates, and orchestrate the
// external Fay-Herriot estimator through model selection. The estimator
// itself, the mapper, and the spatial test are external collaborators behind
// the traits in `estimator`.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod estimator;
pub mod ingest;
pub mod join;
pub mod normalize;
pub mod orchestrate;
pub mod report;
pub mod screen;
pub mod types;
