//! Parsers for the Eurostat artifact formats.
//!
//! - [`inventory`]: the bulk-download inventory (Table of Contents) TSV.
//! - [`sdmx`]: SDMX-ML structure documents (DSDs and code lists).
//! - [`tsv`]: the gzip-compressed wide TSV data matrices.

pub mod inventory;
pub mod sdmx;
pub mod tsv;

pub use inventory::InventoryParser;
pub use sdmx::SdmxParser;
pub use tsv::{TsvChunk, TsvChunks, TsvHeader, TsvParser, TsvRow};
