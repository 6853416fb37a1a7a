//! estat-load: batch ELT pipeline mirroring Eurostat statistical datasets
//! into a relational database.
//!
//! Given a dataset identifier, the pipeline fetches the compressed TSV data
//! matrix and its SDMX-ML metadata, unpivots the wide matrix into one row
//! per observation, and bulk-loads the result through the target engine's
//! native ingest path. Code-list lookup tables and an ingestion history
//! (used for delta decisions) are maintained alongside.
//!
//! Component chain: [`fetcher`] → [`parser`] → [`transformer`] → [`loader`],
//! wired by [`pipeline`].

pub mod config;
pub mod fetcher;
pub mod loader;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod transformer;

// Re-export commonly used types
pub use estat_common::{EstatError, Result};
