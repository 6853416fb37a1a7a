//! Core domain types for the pipeline.
//!
//! SDMX metadata (DSD, code lists), the long-format observation record, and
//! the ingestion history row. These are the data transfer objects passed
//! between fetcher, parsers, transformer and loader.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use estat_common::{EstatError, Result};
use serde::{Deserialize, Serialize};

/// A single code in an SDMX code list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    /// Code value as published (case-sensitive), e.g. "DE".
    pub id: String,
    /// Human-readable label, e.g. "Germany".
    pub label: String,
    pub description: Option<String>,
    /// Parent code in a hierarchical list; refers to another code in the
    /// same list.
    pub parent_code: Option<String>,
}

/// An SDMX code list: the permitted values for one dimension or attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codelist {
    /// Code list identifier as published, e.g. "CL_GEO".
    pub id: String,
    pub version: String,
    /// Codes keyed by their id. Sorted map so iteration (and therefore the
    /// staged upsert content) is deterministic.
    pub codes: BTreeMap<String, Code>,
}

impl Codelist {
    pub fn label_for(&self, code: &str) -> Option<&str> {
        self.codes.get(code).map(|c| c.label.as_str())
    }
}

/// A non-time dimension declared in a DSD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension identifier, case-folded to lowercase.
    pub id: String,
    pub name: Option<String>,
    /// Code list reference, if the dimension is enumerated.
    pub codelist_id: Option<String>,
    /// Declaration position within the DSD.
    pub position: usize,
}

/// An attribute declared in a DSD (e.g. the observation flag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute identifier, case-folded to lowercase.
    pub id: String,
    pub name: Option<String>,
    pub codelist_id: Option<String>,
}

/// Data Structure Definition: the shape of one dataset.
///
/// `dimensions` holds the non-time dimensions in declaration order; the time
/// dimension is carried separately and is always present (construction fails
/// otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dsd {
    /// The dataset/DSD identifier, case-folded to lowercase.
    pub id: String,
    pub name: Option<String>,
    pub version: String,
    /// Non-time dimensions in declaration order.
    pub dimensions: Vec<Dimension>,
    /// Time dimension identifier, case-folded to lowercase.
    pub time_dimension: String,
    pub attributes: Vec<Attribute>,
    /// Identifier of the primary measure column, lowercase.
    pub primary_measure_id: String,
}

/// Default primary measure when the DSD does not declare one.
pub const DEFAULT_PRIMARY_MEASURE: &str = "obs_value";

/// Default flag column when no FLAG-like attribute is declared.
pub const DEFAULT_FLAG_ATTRIBUTE: &str = "obs_flags";

impl Dsd {
    /// Validates the structural invariants: at least one non-time dimension,
    /// unique case-folded dimension ids, and a time dimension that is not
    /// duplicated among them.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(EstatError::dsd_invalid(&self.id, "no non-time dimensions"));
        }
        if self.time_dimension.is_empty() {
            return Err(EstatError::dsd_invalid(&self.id, "no time dimension"));
        }
        let mut seen = std::collections::HashSet::new();
        for dim in &self.dimensions {
            if !seen.insert(dim.id.as_str()) {
                return Err(EstatError::dsd_invalid(
                    &self.id,
                    format!("duplicate dimension id '{}'", dim.id),
                ));
            }
            if dim.id == self.time_dimension {
                return Err(EstatError::dsd_invalid(
                    &self.id,
                    format!(
                        "time dimension '{}' duplicated in non-time dimensions",
                        dim.id
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Non-time dimension ids in declaration order.
    pub fn dimension_ids(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.id.as_str()).collect()
    }

    /// Name of the observation-flag column: first attribute whose id
    /// contains "flag", falling back to `obs_flags`.
    pub fn flag_column(&self) -> &str {
        self.attributes
            .iter()
            .map(|a| a.id.as_str())
            .find(|id| id.contains("flag"))
            .unwrap_or(DEFAULT_FLAG_ATTRIBUTE)
    }

    /// All code list ids referenced by dimensions and attributes, deduplicated
    /// in first-reference order.
    pub fn referenced_codelists(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let refs = self
            .dimensions
            .iter()
            .filter_map(|d| d.codelist_id.as_deref())
            .chain(self.attributes.iter().filter_map(|a| a.codelist_id.as_deref()));
        for id in refs {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }
}

/// One observation in long (tidy) form.
///
/// `dimensions` carries exactly the DSD's non-time dimensions, in DSD order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// (dimension id, value) pairs in DSD declaration order.
    pub dimensions: Vec<(String, String)>,
    pub time_period: String,
    /// Numeric value; `None` for missing observations.
    pub value: Option<f64>,
    /// Flag characters, whitespace-collapsed; `None` when absent.
    pub flags: Option<String>,
}

impl Observation {
    pub fn dimension(&self, id: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(dim, _)| dim == id)
            .map(|(_, v)| v.as_str())
    }
}

/// Status of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Running,
    Success,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Running => "running",
            IngestionStatus::Success => "success",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for IngestionStatus {
    type Err = EstatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(IngestionStatus::Running),
            "success" => Ok(IngestionStatus::Success),
            "failed" => Ok(IngestionStatus::Failed),
            other => Err(EstatError::config(format!(
                "unknown ingestion status '{other}'"
            ))),
        }
    }
}

/// How a dataset run replaces existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Unconditional reload, finalized by atomic table swap.
    Full,
    /// Load only when the source is newer, finalized by merge.
    Delta,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::Full => "full",
            LoadStrategy::Delta => "delta",
        }
    }
}

impl std::fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoadStrategy {
    type Err = EstatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(LoadStrategy::Full),
            "delta" => Ok(LoadStrategy::Delta),
            other => Err(EstatError::config(format!(
                "unknown load strategy '{other}'"
            ))),
        }
    }
}

/// Whether dimension columns contain codes or labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Dimension values verbatim as published.
    Standard,
    /// Dimension codes substituted with their code-list labels.
    Full,
}

impl Representation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Representation::Standard => "standard",
            Representation::Full => "full",
        }
    }
}

impl std::fmt::Display for Representation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Representation {
    type Err = EstatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Representation::Standard),
            "full" => Ok(Representation::Full),
            other => Err(EstatError::config(format!(
                "unknown representation '{other}'"
            ))),
        }
    }
}

/// How a staging table is folded into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeStrategy {
    /// Rename-based atomic replacement.
    Swap,
    /// Upsert on the composite primary key; target rows absent from staging
    /// are left untouched.
    Merge,
}

impl FinalizeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeStrategy::Swap => "swap",
            FinalizeStrategy::Merge => "merge",
        }
    }
}

/// One row of the `_ingestion_history` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionHistory {
    /// Assigned by the database; `None` until persisted.
    pub ingestion_id: Option<i64>,
    pub dataset_id: String,
    pub dsd_version: Option<String>,
    pub load_strategy: LoadStrategy,
    pub representation: Representation,
    pub status: IngestionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub rows_loaded: Option<i64>,
    /// The inventory's last-update timestamp used for the delta decision.
    pub source_last_update: Option<DateTime<Utc>>,
    pub error_details: Option<String>,
}

impl IngestionHistory {
    /// A fresh `running` record for the start of a dataset run.
    pub fn started(
        dataset_id: &str,
        load_strategy: LoadStrategy,
        representation: Representation,
    ) -> Self {
        Self {
            ingestion_id: None,
            dataset_id: dataset_id.to_string(),
            dsd_version: None,
            load_strategy,
            representation,
            status: IngestionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            rows_loaded: None,
            source_last_update: None,
            error_details: None,
        }
    }
}
