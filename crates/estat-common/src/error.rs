//! Error types for the estat-load pipeline.
//!
//! Every failure mode of the pipeline maps to one variant here so that the
//! orchestrator can decide retry/terminate/continue behavior from the type
//! alone, without string matching.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EstatError>;

/// Main error type for the estat-load pipeline
#[derive(Error, Debug)]
pub enum EstatError {
    /// A remote artifact does not exist upstream (HTTP 404/401/403/410).
    /// Never retried.
    #[error("'{resource}' not found upstream ({reason})")]
    FetchNotFound { resource: String, reason: String },

    /// A download kept failing with transient errors until the retry budget
    /// was exhausted.
    #[error("download of '{url}' failed after {attempts} attempts: {reason}")]
    FetchTransient {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The local file cache could not be read or written.
    #[error("cache I/O failure at '{path}': {reason}")]
    CacheIo { path: String, reason: String },

    /// The SDMX metadata for a dataset is unusable (e.g. no time dimension).
    #[error("invalid DSD for dataset '{dataset_id}': {reason}")]
    DsdInvalid { dataset_id: String, reason: String },

    /// The TSV matrix violates the expected structure.
    #[error("malformed TSV at line {line}: {reason}")]
    TsvMalformed { line: u64, reason: String },

    /// A dataset is absent from the inventory, or its last-update timestamp
    /// could not be parsed.
    #[error("dataset '{dataset_id}' has no usable inventory entry")]
    InventoryMissing { dataset_id: String },

    /// An existing column's type is incompatible with what the current DSD
    /// requires. Never coerced.
    #[error(
        "schema evolution conflict on '{table}.{column}': existing type \
         '{existing}' is incompatible with required type '{required}'"
    )]
    SchemaEvolutionConflict {
        table: String,
        column: String,
        existing: String,
        required: String,
    },

    /// The bulk path into the staging table failed.
    #[error("bulk load into '{table}' failed: {reason}")]
    BulkLoadFailed { table: String, reason: String },

    /// The swap/merge finalization failed; staging is left for diagnostics.
    #[error("finalize ({strategy}) from '{staging}' into '{target}' failed: {reason}")]
    FinalizeFailed {
        strategy: String,
        staging: String,
        target: String,
        reason: String,
    },

    /// The ingestion history row could not be written. The load itself is
    /// already visible; callers log and continue.
    #[error("failed to record ingestion history for '{dataset_id}': {reason}")]
    HistoryWriteFailed { dataset_id: String, reason: String },

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Database driver error outside the specific load phases above.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP transport error outside the retry loop.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Filesystem error outside the cache.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EstatError {
    pub fn not_found(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FetchNotFound {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(url: impl Into<String>, attempts: u32, reason: impl Into<String>) -> Self {
        Self::FetchTransient {
            url: url.into(),
            attempts,
            reason: reason.into(),
        }
    }

    pub fn cache_io(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheIo {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn dsd_invalid(dataset_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DsdInvalid {
            dataset_id: dataset_id.into(),
            reason: reason.into(),
        }
    }

    pub fn tsv_malformed(line: u64, reason: impl Into<String>) -> Self {
        Self::TsvMalformed {
            line,
            reason: reason.into(),
        }
    }

    pub fn inventory_missing(dataset_id: impl Into<String>) -> Self {
        Self::InventoryMissing {
            dataset_id: dataset_id.into(),
        }
    }

    pub fn bulk_load(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BulkLoadFailed {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn finalize(
        strategy: impl Into<String>,
        staging: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::FinalizeFailed {
            strategy: strategy.into(),
            staging: staging.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for errors the fetcher may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FetchTransient { .. })
    }
}
