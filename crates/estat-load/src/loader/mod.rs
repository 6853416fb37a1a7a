//! Database loader abstraction and adapters.
//!
//! Every adapter implements the [`Loader`] capability set with the same
//! contract: idempotent schema preparation with additive-only evolution,
//! staged-and-merged code-list upserts, a native bulk path into run-scoped
//! staging tables, atomic swap/merge finalization, and the ingestion history
//! used for delta decisions. Adapters are selected by a string key at
//! composition time.

pub mod ident;
pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use estat_common::{EstatError, Result};

use crate::config::{AppConfig, DatabaseKind};
use crate::models::{Codelist, Dsd, FinalizeStrategy, IngestionHistory, Observation};

pub use postgres::PostgresLoader;
pub use sqlite::SqliteLoader;

/// Staging tables older than this are reaped during `prepare_schema`.
pub const STAGING_REAP_AGE_HOURS: i64 = 24;

/// Logical column types of the derived data tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Double,
}

/// One column of a derived data table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    /// Part of the composite primary key (non-time dimensions + time period).
    pub primary_key: bool,
}

/// The relational shape of one dataset, derived from its DSD: one string
/// column per non-time dimension, `time_period`, the value column, and the
/// flag column. The composite primary key covers dimensions + time period.
pub fn derive_columns(dsd: &Dsd) -> Vec<Column> {
    let mut columns = Vec::with_capacity(dsd.dimensions.len() + 3);
    for dim in &dsd.dimensions {
        columns.push(Column {
            name: ident::sanitize(&dim.id),
            ty: ColumnType::Text,
            primary_key: true,
        });
    }
    columns.push(Column {
        name: "time_period".to_string(),
        ty: ColumnType::Text,
        primary_key: true,
    });
    columns.push(Column {
        name: ident::sanitize(&dsd.primary_measure_id),
        ty: ColumnType::Double,
        primary_key: false,
    });
    columns.push(Column {
        name: ident::sanitize(dsd.flag_column()),
        ty: ColumnType::Text,
        primary_key: false,
    });
    columns
}

/// A stream of transformed observations, as the loaders consume it.
pub type ObservationSource<'a> = &'a mut (dyn Iterator<Item = Result<Observation>> + Send);

/// The capability set every database adapter must provide.
#[async_trait]
pub trait Loader: Send {
    /// Idempotently create the schema and the dataset table derived from the
    /// DSD, evolving an existing table additively. Incompatible column types
    /// fail with `SchemaEvolutionConflict`; the check is skipped when the
    /// last successful ingestion used the same DSD version. Also reaps
    /// abandoned staging tables for this target.
    async fn prepare_schema(
        &mut self,
        dsd: &Dsd,
        table: &str,
        schema: &str,
        last_ingestion: Option<&IngestionHistory>,
    ) -> Result<()>;

    /// Idempotently upsert each code list into its per-list table via a
    /// staging table and an engine-native merge.
    async fn manage_codelists(
        &mut self,
        codelists: &BTreeMap<String, Codelist>,
        schema: &str,
    ) -> Result<()>;

    /// Create a fresh run-scoped staging table (minimally logged when
    /// `use_unlogged` and the engine supports it) and consume the observation
    /// stream into it through the engine's native bulk path. Returns the
    /// staging table name and the number of rows loaded.
    async fn bulk_load_staging(
        &mut self,
        table: &str,
        schema: &str,
        observations: ObservationSource<'_>,
        use_unlogged: bool,
    ) -> Result<(String, u64)>;

    /// Fold the staging table into the target inside one transaction: `Swap`
    /// replaces the target atomically by rename, `Merge` upserts on the
    /// composite primary key and never deletes.
    async fn finalize_load(
        &mut self,
        staging: &str,
        target: &str,
        schema: &str,
        strategy: FinalizeStrategy,
    ) -> Result<()>;

    /// Most recent successful ingestion of a dataset, if any.
    async fn get_ingestion_state(
        &mut self,
        dataset_id: &str,
        schema: &str,
    ) -> Result<Option<IngestionHistory>>;

    /// Append one history record, creating the history table when absent.
    async fn save_ingestion_state(
        &mut self,
        record: &IngestionHistory,
        schema: &str,
    ) -> Result<()>;

    /// Release database handles.
    async fn close_connection(&mut self) -> Result<()>;
}

/// Instantiate the adapter selected by the configured database kind.
pub async fn connect(config: &AppConfig) -> Result<Box<dyn Loader>> {
    match config.db.kind {
        DatabaseKind::Postgres => Ok(Box::new(PostgresLoader::connect(&config.db).await?)),
        DatabaseKind::Sqlite => Ok(Box::new(SqliteLoader::connect(&config.db).await?)),
    }
}

/// Text-format encoding shared by the adapters' staged code-list upserts and
/// the Postgres COPY path: `\N` for null, and backslash, tab, newline and
/// carriage return escaped.
pub(crate) fn copy_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn copy_field(value: Option<&str>) -> String {
    match value {
        Some(v) => copy_escape(v),
        None => "\\N".to_string(),
    }
}

/// Guard shared by the adapters: `bulk_load_staging` and a merge finalize
/// need the DSD captured by `prepare_schema`.
pub(crate) fn require_dsd<'a>(dsd: Option<&'a Dsd>, operation: &str) -> Result<&'a Dsd> {
    dsd.ok_or_else(|| {
        EstatError::config(format!(
            "{operation} requires prepare_schema to have run first"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attribute, Dimension};

    fn sample_dsd() -> Dsd {
        Dsd {
            id: "demo".into(),
            name: None,
            version: "1.0".into(),
            dimensions: vec![
                Dimension {
                    id: "geo".into(),
                    name: None,
                    codelist_id: None,
                    position: 0,
                },
                Dimension {
                    id: "freq".into(),
                    name: None,
                    codelist_id: None,
                    position: 1,
                },
            ],
            time_dimension: "time".into(),
            attributes: vec![Attribute {
                id: "obs_flag".into(),
                name: None,
                codelist_id: None,
            }],
            primary_measure_id: "obs_value".into(),
        }
    }

    #[test]
    fn test_derive_columns_shape_and_pk() {
        let columns = derive_columns(&sample_dsd());
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["geo", "freq", "time_period", "obs_value", "obs_flag"]);

        let pk: Vec<&str> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(pk, vec!["geo", "freq", "time_period"]);

        assert_eq!(columns[3].ty, ColumnType::Double);
        assert_eq!(columns[4].ty, ColumnType::Text);
    }

    #[test]
    fn test_copy_escape() {
        assert_eq!(copy_escape("plain"), "plain");
        assert_eq!(copy_escape("a\tb"), "a\\tb");
        assert_eq!(copy_escape("a\\b\nc"), "a\\\\b\\nc");
        assert_eq!(copy_field(None), "\\N");
        assert_eq!(copy_field(Some("x")), "x");
    }

    #[test]
    fn test_require_dsd() {
        assert!(require_dsd(None, "bulk_load_staging").is_err());
        let dsd = sample_dsd();
        assert!(require_dsd(Some(&dsd), "bulk_load_staging").is_ok());
    }
}
