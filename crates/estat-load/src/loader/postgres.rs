//! PostgreSQL loader.
//!
//! The canonical adapter: staging tables are filled through `COPY ... FROM
//! STDIN`, code lists are upserted via a temp table and `INSERT ... ON
//! CONFLICT`, and full loads finalize with a rename-based swap inside one
//! transaction so concurrent readers never see a missing target.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use estat_common::{EstatError, Result};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use sqlx::{Connection, Row};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::loader::{
    copy_field, derive_columns, ident, require_dsd, Column, ColumnType, Loader,
    ObservationSource, STAGING_REAP_AGE_HOURS,
};
use crate::models::{Codelist, Dsd, FinalizeStrategy, IngestionHistory, Observation};

/// Name of the ingestion history table inside the metadata schema.
const HISTORY_TABLE: &str = "_ingestion_history";

/// Bytes buffered between COPY sends.
const COPY_BUFFER_BYTES: usize = 64 * 1024;

pub struct PostgresLoader {
    pool: PgPool,
    /// Captured by `prepare_schema`; drives column order for the bulk path
    /// and the merge key.
    dsd: Option<Dsd>,
}

impl PostgresLoader {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let loader = Self::connect_url(&config.postgres_url()).await?;
        info!(
            host = %config.host,
            database = %config.name,
            "connected to PostgreSQL"
        );
        Ok(loader)
    }

    pub async fn connect_url(url: &str) -> Result<Self> {
        // One connection per loader instance; loaders are not shared across
        // concurrent dataset runs.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        Ok(Self { pool, dsd: None })
    }

    async fn ensure_schema(&self, schema: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            ident::quote(schema)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT FROM information_schema.tables
                 WHERE table_schema = $1 AND table_name = $2
             )",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn existing_column_types(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT column_name, data_type
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    /// Drop staging tables for `target` whose timestamp suffix is older than
    /// the reap threshold.
    async fn reap_staging(&self, schema: &str, target: &str) -> Result<()> {
        let pattern = format!("{}{}\\_%", ident::STAGING_PREFIX, ident::sanitize(target));
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables
             WHERE table_schema = $1 AND table_name LIKE $2",
        )
        .bind(schema)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        let cutoff = Utc::now() - chrono::Duration::hours(STAGING_REAP_AGE_HOURS);
        for row in rows {
            let name: String = row.get(0);
            let Some(created) = ident::staging_timestamp(&name, target) else {
                continue;
            };
            if created < cutoff {
                warn!(table = %name, "reaping abandoned staging table");
                sqlx::query(&format!(
                    "DROP TABLE IF EXISTS {}",
                    ident::qualified(schema, &name)
                ))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn ensure_history_table(&self, schema: &str) -> Result<()> {
        self.ensure_schema(schema).await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 ingestion_id BIGSERIAL PRIMARY KEY,
                 dataset_id TEXT NOT NULL,
                 dsd_version TEXT,
                 load_strategy TEXT NOT NULL,
                 representation TEXT NOT NULL,
                 status TEXT NOT NULL,
                 start_time TIMESTAMPTZ NOT NULL,
                 end_time TIMESTAMPTZ,
                 rows_loaded BIGINT,
                 source_last_update TIMESTAMPTZ,
                 error_details TEXT
             )",
            ident::qualified(schema, HISTORY_TABLE)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn sql_type(ty: ColumnType) -> &'static str {
        match ty {
            ColumnType::Text => "TEXT",
            ColumnType::Double => "DOUBLE PRECISION",
        }
    }

    /// Normalize an information_schema type name for comparison.
    fn normalize_type(pg_type: &str) -> String {
        let t = pg_type.to_lowercase();
        if t.starts_with("character") || t == "char" || t == "varchar" {
            "text".to_string()
        } else if t == "float8" {
            "double precision".to_string()
        } else if t.starts_with("timestamp") {
            "timestamptz".to_string()
        } else {
            t
        }
    }

    fn column_defs(columns: &[Column], with_pk: bool) -> String {
        let mut defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", ident::quote(&c.name), Self::sql_type(c.ty)))
            .collect();
        if with_pk {
            let pk: Vec<String> = columns
                .iter()
                .filter(|c| c.primary_key)
                .map(|c| ident::quote(&c.name))
                .collect();
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }
        defs.join(", ")
    }

    fn column_list(columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| ident::quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// One COPY text-format line for an observation, fields in derived
    /// column order.
    fn copy_line(obs: &Observation) -> String {
        let mut fields: Vec<String> = obs
            .dimensions
            .iter()
            .map(|(_, v)| copy_field(Some(v)))
            .collect();
        fields.push(copy_field(Some(&obs.time_period)));
        fields.push(match obs.value {
            Some(v) => v.to_string(),
            None => "\\N".to_string(),
        });
        fields.push(copy_field(obs.flags.as_deref()));
        let mut line = fields.join("\t");
        line.push('\n');
        line
    }
}

#[async_trait]
impl Loader for PostgresLoader {
    async fn prepare_schema(
        &mut self,
        dsd: &Dsd,
        table: &str,
        schema: &str,
        last_ingestion: Option<&IngestionHistory>,
    ) -> Result<()> {
        self.dsd = Some(dsd.clone());
        info!(schema, table, "preparing schema");

        self.ensure_schema(schema).await?;
        self.reap_staging(schema, table).await?;

        let columns = derive_columns(dsd);

        if !self.table_exists(schema, table).await? {
            let create = format!(
                "CREATE TABLE {} ({})",
                ident::qualified(schema, table),
                Self::column_defs(&columns, true)
            );
            sqlx::query(&create).execute(&self.pool).await?;
            info!(schema, table, "created data table");
            return Ok(());
        }

        if let Some(last) = last_ingestion {
            if last.dsd_version.as_deref() == Some(dsd.version.as_str()) {
                debug!(
                    version = %dsd.version,
                    "DSD version unchanged since last ingestion, skipping evolution check"
                );
                return Ok(());
            }
        }

        let existing = self.existing_column_types(schema, table).await?;
        for column in &columns {
            match existing.get(&column.name) {
                Some(existing_type) => {
                    let have = Self::normalize_type(existing_type);
                    let want = Self::normalize_type(Self::sql_type(column.ty));
                    if have != want {
                        return Err(EstatError::SchemaEvolutionConflict {
                            table: format!("{schema}.{table}"),
                            column: column.name.clone(),
                            existing: existing_type.clone(),
                            required: Self::sql_type(column.ty).to_string(),
                        });
                    }
                },
                None => {
                    info!(column = %column.name, "adding missing column");
                    sqlx::query(&format!(
                        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                        ident::qualified(schema, table),
                        ident::quote(&column.name),
                        Self::sql_type(column.ty)
                    ))
                    .execute(&self.pool)
                    .await?;
                },
            }
        }

        for extra in existing.keys() {
            if !columns.iter().any(|c| &c.name == extra) {
                warn!(
                    column = %extra,
                    "column exists in table but not in current DSD; left in place"
                );
            }
        }

        Ok(())
    }

    async fn manage_codelists(
        &mut self,
        codelists: &BTreeMap<String, Codelist>,
        schema: &str,
    ) -> Result<()> {
        info!(count = codelists.len(), schema, "upserting code lists");
        self.ensure_schema(schema).await?;

        for (list_id, codelist) in codelists {
            let table = ident::codelist_table(list_id);
            let qualified = ident::qualified(schema, &table);
            let stage = format!("{table}_stage");

            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {qualified} (
                     code TEXT PRIMARY KEY,
                     label TEXT,
                     description TEXT,
                     parent_code TEXT
                 )"
            ))
            .execute(&self.pool)
            .await?;

            let mut conn = self.pool.acquire().await?;
            let mut tx = conn.begin().await?;

            sqlx::query(&format!(
                "CREATE TEMP TABLE {} (LIKE {qualified} INCLUDING DEFAULTS) ON COMMIT DROP",
                ident::quote(&stage)
            ))
            .execute(&mut *tx)
            .await?;

            let copy_sql = format!(
                "COPY {} (code, label, description, parent_code) FROM STDIN",
                ident::quote(&stage)
            );
            let mut copy = tx.copy_in_raw(&copy_sql).await?;
            let mut buffer = String::with_capacity(COPY_BUFFER_BYTES);
            for code in codelist.codes.values() {
                buffer.push_str(&copy_field(Some(&code.id)));
                buffer.push('\t');
                buffer.push_str(&copy_field(Some(&code.label)));
                buffer.push('\t');
                buffer.push_str(&copy_field(code.description.as_deref()));
                buffer.push('\t');
                buffer.push_str(&copy_field(code.parent_code.as_deref()));
                buffer.push('\n');
                if buffer.len() >= COPY_BUFFER_BYTES {
                    copy.send(buffer.as_bytes()).await?;
                    buffer.clear();
                }
            }
            if !buffer.is_empty() {
                copy.send(buffer.as_bytes()).await?;
            }
            let staged = copy.finish().await?;

            sqlx::query(&format!(
                "INSERT INTO {qualified} (code, label, description, parent_code)
                 SELECT code, label, description, parent_code FROM {}
                 ON CONFLICT (code) DO UPDATE SET
                     label = EXCLUDED.label,
                     description = EXCLUDED.description,
                     parent_code = EXCLUDED.parent_code",
                ident::quote(&stage)
            ))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            debug!(codelist = %list_id, table = %table, rows = staged, "code list merged");
        }

        Ok(())
    }

    async fn bulk_load_staging(
        &mut self,
        table: &str,
        schema: &str,
        observations: ObservationSource<'_>,
        use_unlogged: bool,
    ) -> Result<(String, u64)> {
        let dsd = require_dsd(self.dsd.as_ref(), "bulk_load_staging")?.clone();
        let columns = derive_columns(&dsd);
        let staging = ident::staging_table(table, Utc::now());
        let qualified = ident::qualified(schema, &staging);
        let bulk_err =
            |reason: String| EstatError::bulk_load(format!("{schema}.{staging}"), reason);

        sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
            .execute(&self.pool)
            .await?;

        // Staging matches the target's columns but carries no uniqueness.
        let unlogged = if use_unlogged { "UNLOGGED " } else { "" };
        sqlx::query(&format!(
            "CREATE {unlogged}TABLE {qualified} ({})",
            Self::column_defs(&columns, false)
        ))
        .execute(&self.pool)
        .await?;
        info!(table = %staging, unlogged = use_unlogged, "created staging table");

        let copy_sql = format!(
            "COPY {qualified} ({}) FROM STDIN",
            Self::column_list(&columns)
        );
        let mut copy = self
            .pool
            .copy_in_raw(&copy_sql)
            .await
            .map_err(|e| bulk_err(e.to_string()))?;

        let mut buffer = String::with_capacity(COPY_BUFFER_BYTES);
        for obs in observations {
            match obs {
                Ok(obs) => {
                    buffer.push_str(&Self::copy_line(&obs));
                    if buffer.len() >= COPY_BUFFER_BYTES {
                        copy.send(buffer.as_bytes())
                            .await
                            .map_err(|e| bulk_err(e.to_string()))?;
                        buffer.clear();
                    }
                },
                Err(e) => {
                    // Upstream produced a bad row: abandon the COPY and
                    // surface the original error.
                    let _ = copy.abort("upstream transform failure").await;
                    return Err(e);
                },
            }
        }
        if !buffer.is_empty() {
            copy.send(buffer.as_bytes())
                .await
                .map_err(|e| bulk_err(e.to_string()))?;
        }
        let rows = copy.finish().await.map_err(|e| bulk_err(e.to_string()))?;

        info!(table = %staging, rows, "staging load complete");
        Ok((staging, rows))
    }

    async fn finalize_load(
        &mut self,
        staging: &str,
        target: &str,
        schema: &str,
        strategy: FinalizeStrategy,
    ) -> Result<()> {
        info!(staging, target, strategy = strategy.as_str(), "finalizing load");
        let fin_err = |reason: String| {
            EstatError::finalize(strategy.as_str(), staging, target, reason)
        };

        match strategy {
            FinalizeStrategy::Swap => {
                let backup = format!("{target}_old");
                let mut tx = self.pool.begin().await.map_err(|e| fin_err(e.to_string()))?;
                for sql in [
                    format!(
                        "DROP TABLE IF EXISTS {} CASCADE",
                        ident::qualified(schema, &backup)
                    ),
                    format!(
                        "ALTER TABLE IF EXISTS {} RENAME TO {}",
                        ident::qualified(schema, target),
                        ident::quote(&backup)
                    ),
                    format!(
                        "ALTER TABLE {} RENAME TO {}",
                        ident::qualified(schema, staging),
                        ident::quote(target)
                    ),
                    format!(
                        "DROP TABLE IF EXISTS {} CASCADE",
                        ident::qualified(schema, &backup)
                    ),
                ] {
                    sqlx::query(&sql)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| fin_err(e.to_string()))?;
                }
                tx.commit().await.map_err(|e| fin_err(e.to_string()))?;
            },
            FinalizeStrategy::Merge => {
                let dsd = require_dsd(self.dsd.as_ref(), "finalize_load(merge)")?.clone();
                let columns = derive_columns(&dsd);
                let pk: Vec<String> = columns
                    .iter()
                    .filter(|c| c.primary_key)
                    .map(|c| ident::quote(&c.name))
                    .collect();
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !c.primary_key)
                    .map(|c| {
                        format!(
                            "{col} = EXCLUDED.{col}",
                            col = ident::quote(&c.name)
                        )
                    })
                    .collect();

                let mut tx = self.pool.begin().await.map_err(|e| fin_err(e.to_string()))?;
                sqlx::query(&format!(
                    "INSERT INTO {} ({cols}) SELECT {cols} FROM {} \
                     ON CONFLICT ({pk}) DO UPDATE SET {updates}",
                    ident::qualified(schema, target),
                    ident::qualified(schema, staging),
                    cols = Self::column_list(&columns),
                    pk = pk.join(", "),
                    updates = updates.join(", "),
                ))
                .execute(&mut *tx)
                .await
                .map_err(|e| fin_err(e.to_string()))?;

                sqlx::query(&format!(
                    "DROP TABLE {}",
                    ident::qualified(schema, staging)
                ))
                .execute(&mut *tx)
                .await
                .map_err(|e| fin_err(e.to_string()))?;
                tx.commit().await.map_err(|e| fin_err(e.to_string()))?;
            },
        }

        info!(target, "load finalized");
        Ok(())
    }

    async fn get_ingestion_state(
        &mut self,
        dataset_id: &str,
        schema: &str,
    ) -> Result<Option<IngestionHistory>> {
        self.ensure_history_table(schema).await?;

        let row = sqlx::query(&format!(
            "SELECT ingestion_id, dataset_id, dsd_version, load_strategy,
                    representation, status, start_time, end_time, rows_loaded,
                    source_last_update, error_details
             FROM {}
             WHERE dataset_id = $1 AND status = 'success'
             ORDER BY end_time DESC NULLS LAST, ingestion_id DESC
             LIMIT 1",
            ident::qualified(schema, HISTORY_TABLE)
        ))
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(IngestionHistory {
                ingestion_id: Some(row.get(0)),
                dataset_id: row.get(1),
                dsd_version: row.get(2),
                load_strategy: row.get::<String, _>(3).parse()?,
                representation: row.get::<String, _>(4).parse()?,
                status: row.get::<String, _>(5).parse()?,
                start_time: row.get(6),
                end_time: row.get(7),
                rows_loaded: row.get(8),
                source_last_update: row.get(9),
                error_details: row.get(10),
            })
        })
        .transpose()
    }

    async fn save_ingestion_state(
        &mut self,
        record: &IngestionHistory,
        schema: &str,
    ) -> Result<()> {
        let write_err = |reason: String| EstatError::HistoryWriteFailed {
            dataset_id: record.dataset_id.clone(),
            reason,
        };

        self.ensure_history_table(schema)
            .await
            .map_err(|e| write_err(e.to_string()))?;

        sqlx::query(&format!(
            "INSERT INTO {} (dataset_id, dsd_version, load_strategy, representation,
                             status, start_time, end_time, rows_loaded,
                             source_last_update, error_details)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            ident::qualified(schema, HISTORY_TABLE)
        ))
        .bind(&record.dataset_id)
        .bind(&record.dsd_version)
        .bind(record.load_strategy.as_str())
        .bind(record.representation.as_str())
        .bind(record.status.as_str())
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.rows_loaded)
        .bind(record.source_last_update)
        .bind(&record.error_details)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e.to_string()))?;

        debug!(
            dataset_id = %record.dataset_id,
            status = record.status.as_str(),
            "ingestion history recorded"
        );
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<()> {
        self.pool.close().await;
        debug!("PostgreSQL connection closed");
        Ok(())
    }
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
            dimensions: vec![Dimension {
                id: "geo".into(),
                name: None,
                codelist_id: None,
                position: 0,
            }],
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
    fn test_column_defs_with_pk() {
        let columns = derive_columns(&sample_dsd());
        let defs = PostgresLoader::column_defs(&columns, true);
        assert_eq!(
            defs,
            "\"geo\" TEXT, \"time_period\" TEXT, \"obs_value\" DOUBLE PRECISION, \
             \"obs_flag\" TEXT, PRIMARY KEY (\"geo\", \"time_period\")"
        );

        let no_pk = PostgresLoader::column_defs(&columns, false);
        assert!(!no_pk.contains("PRIMARY KEY"));
    }

    #[test]
    fn test_normalize_type() {
        assert_eq!(PostgresLoader::normalize_type("character varying"), "text");
        assert_eq!(PostgresLoader::normalize_type("TEXT"), "text");
        assert_eq!(
            PostgresLoader::normalize_type("double precision"),
            "double precision"
        );
        assert_eq!(
            PostgresLoader::normalize_type("timestamp with time zone"),
            "timestamptz"
        );
    }

    #[test]
    fn test_copy_line_formats_nulls_and_escapes() {
        let obs = Observation {
            dimensions: vec![("geo".into(), "DE\tX".into())],
            time_period: "2020".into(),
            value: None,
            flags: None,
        };
        assert_eq!(PostgresLoader::copy_line(&obs), "DE\\tX\t2020\t\\N\t\\N\n");

        let obs = Observation {
            dimensions: vec![("geo".into(), "FR".into())],
            time_period: "2021".into(),
            value: Some(9.5),
            flags: Some("p".into()),
        };
        assert_eq!(PostgresLoader::copy_line(&obs), "FR\t2021\t9.5\tp\n");
    }
}
