//! SQLite loader.
//!
//! File-based fallback adapter, also the test vehicle for the loader
//! contract. SQLite has no schemas and no COPY: logical schemas are fused
//! into table names (`schema__table`), and staging is filled with batched
//! multi-row inserts inside transactions, the engine's last-resort bulk
//! path. Swap and merge finalization carry the same semantics as the
//! canonical adapter.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estat_common::{EstatError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::loader::{
    derive_columns, ident, require_dsd, Column, ColumnType, Loader, ObservationSource,
    STAGING_REAP_AGE_HOURS,
};
use crate::models::{Codelist, Dsd, FinalizeStrategy, IngestionHistory, Observation};

const HISTORY_TABLE: &str = "_ingestion_history";

/// Rows per multi-row INSERT. Kept well under SQLite's bind-variable limit
/// even for wide DSDs.
const INSERT_BATCH_ROWS: usize = 500;

pub struct SqliteLoader {
    pool: SqlitePool,
    dsd: Option<Dsd>,
}

impl SqliteLoader {
    /// Connect using the configured `name` as the database file path
    /// (`:memory:` is honored for tests).
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.name))
            .map_err(EstatError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        info!(path = %config.name, "connected to SQLite");
        Ok(Self { pool, dsd: None })
    }

    /// SQLite has no schemas; fuse the logical schema into the table name.
    fn fqn(schema: &str, table: &str) -> String {
        format!("{}__{}", ident::sanitize(schema), table)
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn existing_column_types(&self, name: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", ident::quote(name)))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("name"),
                    row.get::<String, _>("type"),
                )
            })
            .collect())
    }

    async fn reap_staging(&self, fqn_target: &str) -> Result<()> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ESCAPE '\\'",
        )
        .bind(format!(
            "{}{}\\_%",
            ident::STAGING_PREFIX,
            ident::sanitize(fqn_target).replace('_', "\\_")
        ))
        .fetch_all(&self.pool)
        .await?;

        let cutoff = Utc::now() - chrono::Duration::hours(STAGING_REAP_AGE_HOURS);
        for name in names {
            let Some(created) = ident::staging_timestamp(&name, fqn_target) else {
                continue;
            };
            if created < cutoff {
                warn!(table = %name, "reaping abandoned staging table");
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", ident::quote(&name)))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn ensure_history_table(&self, schema: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 ingestion_id INTEGER PRIMARY KEY AUTOINCREMENT,
                 dataset_id TEXT NOT NULL,
                 dsd_version TEXT,
                 load_strategy TEXT NOT NULL,
                 representation TEXT NOT NULL,
                 status TEXT NOT NULL,
                 start_time TEXT NOT NULL,
                 end_time TEXT,
                 rows_loaded INTEGER,
                 source_last_update TEXT,
                 error_details TEXT
             )",
            ident::quote(&Self::fqn(schema, HISTORY_TABLE))
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn sql_type(ty: ColumnType) -> &'static str {
        match ty {
            ColumnType::Text => "TEXT",
            ColumnType::Double => "REAL",
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

    /// Append one batch of observations as a multi-row INSERT.
    async fn insert_batch(
        &self,
        staging: &str,
        columns: &[Column],
        batch: &[Observation],
    ) -> Result<()> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            ident::quote(staging),
            Self::column_list(columns)
        ));
        builder.push_values(batch, |mut b, obs| {
            for (_, value) in &obs.dimensions {
                b.push_bind(value.clone());
            }
            b.push_bind(obs.time_period.clone());
            b.push_bind(obs.value);
            b.push_bind(obs.flags.clone());
        });
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| EstatError::bulk_load(staging, e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Loader for SqliteLoader {
    async fn prepare_schema(
        &mut self,
        dsd: &Dsd,
        table: &str,
        schema: &str,
        last_ingestion: Option<&IngestionHistory>,
    ) -> Result<()> {
        self.dsd = Some(dsd.clone());
        let fqn = Self::fqn(schema, table);
        info!(table = %fqn, "preparing schema");

        self.reap_staging(&fqn).await?;

        let columns = derive_columns(dsd);

        if !self.table_exists(&fqn).await? {
            sqlx::query(&format!(
                "CREATE TABLE {} ({})",
                ident::quote(&fqn),
                Self::column_defs(&columns, true)
            ))
            .execute(&self.pool)
            .await?;
            info!(table = %fqn, "created data table");
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

        let existing = self.existing_column_types(&fqn).await?;
        for column in &columns {
            match existing.get(&column.name) {
                Some(existing_type) => {
                    let want = Self::sql_type(column.ty);
                    if !existing_type.eq_ignore_ascii_case(want) {
                        return Err(EstatError::SchemaEvolutionConflict {
                            table: fqn.clone(),
                            column: column.name.clone(),
                            existing: existing_type.clone(),
                            required: want.to_string(),
                        });
                    }
                },
                None => {
                    info!(column = %column.name, "adding missing column");
                    sqlx::query(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        ident::quote(&fqn),
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

        for (list_id, codelist) in codelists {
            let table = Self::fqn(schema, &ident::codelist_table(list_id));
            let stage = format!("{table}_stage");

            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     code TEXT PRIMARY KEY,
                     label TEXT,
                     description TEXT,
                     parent_code TEXT
                 )",
                ident::quote(&table)
            ))
            .execute(&self.pool)
            .await?;

            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!(
                "CREATE TEMP TABLE {} (
                     code TEXT PRIMARY KEY,
                     label TEXT,
                     description TEXT,
                     parent_code TEXT
                 )",
                ident::quote(&stage)
            ))
            .execute(&mut *tx)
            .await?;

            let codes: Vec<_> = codelist.codes.values().collect();
            for batch in codes.chunks(INSERT_BATCH_ROWS) {
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                    "INSERT INTO {} (code, label, description, parent_code) ",
                    ident::quote(&stage)
                ));
                builder.push_values(batch, |mut b, code| {
                    b.push_bind(code.id.clone());
                    b.push_bind(code.label.clone());
                    b.push_bind(code.description.clone());
                    b.push_bind(code.parent_code.clone());
                });
                builder.build().execute(&mut *tx).await?;
            }

            sqlx::query(&format!(
                "INSERT INTO {target} (code, label, description, parent_code)
                 SELECT code, label, description, parent_code FROM {stage} WHERE true
                 ON CONFLICT (code) DO UPDATE SET
                     label = excluded.label,
                     description = excluded.description,
                     parent_code = excluded.parent_code",
                target = ident::quote(&table),
                stage = ident::quote(&stage),
            ))
            .execute(&mut *tx)
            .await?;

            sqlx::query(&format!("DROP TABLE {}", ident::quote(&stage)))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            debug!(codelist = %list_id, table = %table, rows = codelist.codes.len(), "code list merged");
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
        let fqn = Self::fqn(schema, table);
        let staging = ident::staging_table(&fqn, Utc::now());

        if use_unlogged {
            debug!("SQLite has no unlogged tables, flag ignored");
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", ident::quote(&staging)))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {} ({})",
            ident::quote(&staging),
            Self::column_defs(&columns, false)
        ))
        .execute(&self.pool)
        .await?;
        info!(table = %staging, "created staging table");

        let mut rows: u64 = 0;
        let mut batch: Vec<Observation> = Vec::with_capacity(INSERT_BATCH_ROWS);
        for obs in observations {
            batch.push(obs?);
            if batch.len() >= INSERT_BATCH_ROWS {
                self.insert_batch(&staging, &columns, &batch).await?;
                rows += batch.len() as u64;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.insert_batch(&staging, &columns, &batch).await?;
            rows += batch.len() as u64;
        }

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
        let fqn = Self::fqn(schema, target);
        info!(staging, target = %fqn, strategy = strategy.as_str(), "finalizing load");
        let fin_err =
            |reason: String| EstatError::finalize(strategy.as_str(), staging, &fqn, reason);

        match strategy {
            FinalizeStrategy::Swap => {
                let backup = format!("{fqn}_old");
                let target_exists = self
                    .table_exists(&fqn)
                    .await
                    .map_err(|e| fin_err(e.to_string()))?;

                let mut tx = self.pool.begin().await.map_err(|e| fin_err(e.to_string()))?;
                let mut statements = vec![format!(
                    "DROP TABLE IF EXISTS {}",
                    ident::quote(&backup)
                )];
                if target_exists {
                    statements.push(format!(
                        "ALTER TABLE {} RENAME TO {}",
                        ident::quote(&fqn),
                        ident::quote(&backup)
                    ));
                }
                statements.push(format!(
                    "ALTER TABLE {} RENAME TO {}",
                    ident::quote(staging),
                    ident::quote(&fqn)
                ));
                statements.push(format!("DROP TABLE IF EXISTS {}", ident::quote(&backup)));

                for sql in statements {
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
                    .map(|c| format!("{col} = excluded.{col}", col = ident::quote(&c.name)))
                    .collect();

                let mut tx = self.pool.begin().await.map_err(|e| fin_err(e.to_string()))?;
                sqlx::query(&format!(
                    "INSERT INTO {} ({cols}) SELECT {cols} FROM {} WHERE true \
                     ON CONFLICT ({pk}) DO UPDATE SET {updates}",
                    ident::quote(&fqn),
                    ident::quote(staging),
                    cols = Self::column_list(&columns),
                    pk = pk.join(", "),
                    updates = updates.join(", "),
                ))
                .execute(&mut *tx)
                .await
                .map_err(|e| fin_err(e.to_string()))?;

                sqlx::query(&format!("DROP TABLE {}", ident::quote(staging)))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| fin_err(e.to_string()))?;
                tx.commit().await.map_err(|e| fin_err(e.to_string()))?;
            },
        }

        info!(target = %fqn, "load finalized");
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
             WHERE dataset_id = ?1 AND status = 'success'
             ORDER BY end_time DESC, ingestion_id DESC
             LIMIT 1",
            ident::quote(&Self::fqn(schema, HISTORY_TABLE))
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
                start_time: row.get::<DateTime<Utc>, _>(6),
                end_time: row.get::<Option<DateTime<Utc>>, _>(7),
                rows_loaded: row.get(8),
                source_last_update: row.get::<Option<DateTime<Utc>>, _>(9),
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
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            ident::quote(&Self::fqn(schema, HISTORY_TABLE))
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
        debug!("SQLite connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqn_fuses_schema_and_table() {
        assert_eq!(
            SqliteLoader::fqn("eurostat_data", "data_nama_10_gdp"),
            "eurostat_data__data_nama_10_gdp"
        );
    }

    #[test]
    fn test_sql_types() {
        assert_eq!(SqliteLoader::sql_type(ColumnType::Text), "TEXT");
        assert_eq!(SqliteLoader::sql_type(ColumnType::Double), "REAL");
    }
}
