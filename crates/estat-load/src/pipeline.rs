//! Pipeline orchestration.
//!
//! Wires Fetcher → Parsers → Transformer → Loader for one dataset and makes
//! the full/delta decision. A delta run whose source is not newer than the
//! last successful ingestion terminates as a no-op: no staging table is
//! created and no history row is written. Failures are recorded as `failed`
//! history rows best-effort and surface to the caller; the batch driver
//! continues with the next dataset.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use estat_common::{EstatError, Result};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::fetcher::Fetcher;
use crate::loader::{self, ident, Loader};
use crate::models::{
    Codelist, FinalizeStrategy, IngestionHistory, IngestionStatus, LoadStrategy, Representation,
};
use crate::parser::{InventoryParser, SdmxParser, TsvParser};
use crate::transformer::Transformer;

/// Result of a single dataset run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Data was staged and finalized.
    Loaded { rows_loaded: u64 },
    /// Delta run found the target already up to date; nothing was touched.
    SkippedUpToDate,
}

/// Run the end-to-end ingestion pipeline for one dataset.
pub async fn run_pipeline(
    dataset_id: &str,
    representation: Representation,
    load_strategy: LoadStrategy,
    config: &AppConfig,
) -> Result<PipelineOutcome> {
    info!(
        dataset_id,
        representation = representation.as_str(),
        load_strategy = load_strategy.as_str(),
        backend = config.db.kind.as_str(),
        "starting pipeline"
    );

    let fetcher = Fetcher::new(config)?;

    let inventory_path = fetcher.get_inventory().await?;
    let inventory = InventoryParser::from_path(&inventory_path)?;
    let remote_last_update = inventory.last_update(dataset_id)?;
    let download_url = inventory.download_url(dataset_id)?.to_string();

    let mut db = loader::connect(config).await?;

    // Delta decision: compare the source timestamp against the last
    // successful ingestion before touching anything.
    let mut last_ingestion = None;
    if load_strategy == LoadStrategy::Delta {
        last_ingestion = db
            .get_ingestion_state(dataset_id, &config.db.meta_schema)
            .await?;
        if let Some(local) = last_ingestion.as_ref().and_then(|l| l.source_last_update) {
            if local >= remote_last_update {
                info!(
                    dataset_id,
                    local = %local,
                    remote = %remote_last_update,
                    "already up to date, skipping"
                );
                db.close_connection().await?;
                return Ok(PipelineOutcome::SkippedUpToDate);
            }
        }
    }

    let mut history = IngestionHistory::started(dataset_id, load_strategy, representation);
    history.source_last_update = Some(remote_last_update);

    let result = execute_load(
        &fetcher,
        db.as_mut(),
        config,
        dataset_id,
        &download_url,
        remote_last_update,
        representation,
        load_strategy,
        last_ingestion.as_ref(),
        &mut history,
    )
    .await;

    history.end_time = Some(Utc::now());
    match &result {
        Ok(rows) => {
            history.status = IngestionStatus::Success;
            history.rows_loaded = Some(*rows as i64);
        },
        Err(e) => {
            history.status = IngestionStatus::Failed;
            history.error_details = Some(e.to_string());
        },
    }

    // Recording history is best-effort: the load itself is already final
    // (or already failed), so a write failure is logged and swallowed.
    if let Err(save_err) = db
        .save_ingestion_state(&history, &config.db.meta_schema)
        .await
    {
        error!(dataset_id, error = %save_err, "failed to record ingestion history");
    }
    if let Err(close_err) = db.close_connection().await {
        warn!(dataset_id, error = %close_err, "failed to close loader connection");
    }

    match result {
        Ok(rows_loaded) => {
            info!(dataset_id, rows_loaded, "pipeline complete");
            Ok(PipelineOutcome::Loaded { rows_loaded })
        },
        Err(e) => {
            error!(dataset_id, error = %e, "pipeline failed");
            Err(e)
        },
    }
}

/// Fetch metadata and data, then stage and finalize. Split out so the caller
/// can uniformly convert any failure into a `failed` history row.
#[allow(clippy::too_many_arguments)]
async fn execute_load(
    fetcher: &Fetcher,
    db: &mut dyn Loader,
    config: &AppConfig,
    dataset_id: &str,
    download_url: &str,
    remote_last_update: DateTime<Utc>,
    representation: Representation,
    load_strategy: LoadStrategy,
    last_ingestion: Option<&IngestionHistory>,
    history: &mut IngestionHistory,
) -> Result<u64> {
    let sdmx = SdmxParser::new();

    // Metadata: DSD plus whatever code lists came bundled with it.
    let dsd_path = fetcher.get_dsd(dataset_id, Some(remote_last_update)).await?;
    let structures = sdmx.parse_structures(&dsd_path, dataset_id)?;
    let dsd = structures.dsd.ok_or_else(|| {
        EstatError::dsd_invalid(dataset_id, "structure document contains no DSD")
    })?;
    dsd.validate()?;
    history.dsd_version = Some(dsd.version.clone());

    let mut codelists: BTreeMap<String, Codelist> = structures
        .codelists
        .into_iter()
        .map(|list| (list.id.clone(), list))
        .collect();

    for codelist_id in dsd.referenced_codelists() {
        if codelists.contains_key(codelist_id) {
            continue;
        }
        match fetcher
            .get_codelist(codelist_id, Some(remote_last_update))
            .await
        {
            Ok(path) => {
                for list in sdmx.parse_codelists(&path, dataset_id)? {
                    codelists.insert(list.id.clone(), list);
                }
            },
            Err(EstatError::FetchNotFound { .. }) => {
                // Unresolved reference: the transformer treats codes as
                // their own labels.
                warn!(codelist_id, "referenced code list unavailable upstream");
            },
            Err(e) => return Err(e),
        }
    }

    db.manage_codelists(&codelists, &config.db.meta_schema).await?;

    let table = ident::dataset_table(dataset_id);
    db.prepare_schema(&dsd, &table, &config.db.data_schema, last_ingestion)
        .await?;

    // Data: stream decode → unpivot → stage.
    let tsv_path = fetcher
        .get_tsv(dataset_id, download_url, Some(remote_last_update))
        .await?;
    let (header, chunks) = TsvParser::new(&tsv_path).parse()?;
    let transformer = Transformer::new(&dsd, &codelists, representation);
    let mut observations = transformer.transform(&header, chunks)?;

    let (staging, rows_loaded) = db
        .bulk_load_staging(
            &table,
            &config.db.data_schema,
            &mut observations,
            config.db.unlogged_staging,
        )
        .await?;

    let strategy = match load_strategy {
        LoadStrategy::Full => FinalizeStrategy::Swap,
        LoadStrategy::Delta => FinalizeStrategy::Merge,
    };
    db.finalize_load(&staging, &table, &config.db.data_schema, strategy)
        .await?;

    Ok(rows_loaded)
}

/// Outcome counters of a batch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct ManagedDatasets {
    datasets: Vec<String>,
}

/// Run a delta pipeline for every dataset listed in a YAML document of the
/// form `datasets: [id, ...]`. Per-dataset failures are counted and the
/// batch continues.
pub async fn run_batch_update(datasets_file: &Path, config: &AppConfig) -> Result<BatchSummary> {
    let content = std::fs::read_to_string(datasets_file).map_err(|e| {
        EstatError::config(format!(
            "cannot read datasets file '{}': {e}",
            datasets_file.display()
        ))
    })?;
    let managed: ManagedDatasets = serde_yaml::from_str(&content).map_err(|e| {
        EstatError::config(format!(
            "invalid datasets file '{}': {e}",
            datasets_file.display()
        ))
    })?;

    if managed.datasets.is_empty() {
        warn!("no datasets listed, nothing to do");
        return Ok(BatchSummary::default());
    }

    info!(count = managed.datasets.len(), "starting batch update");
    let mut summary = BatchSummary::default();

    for dataset_id in &managed.datasets {
        info!(dataset_id, "processing dataset");
        match run_pipeline(
            dataset_id,
            Representation::Standard,
            LoadStrategy::Delta,
            config,
        )
        .await
        {
            Ok(PipelineOutcome::Loaded { rows_loaded }) => {
                info!(dataset_id, rows_loaded, "dataset updated");
                summary.updated += 1;
            },
            Ok(PipelineOutcome::SkippedUpToDate) => {
                summary.skipped += 1;
            },
            Err(e) => {
                error!(dataset_id, error = %e, "dataset failed, continuing batch");
                summary.failed += 1;
            },
        }
    }

    info!(
        updated = summary.updated,
        skipped = summary.skipped,
        failed = summary.failed,
        "batch update finished"
    );
    Ok(summary)
}
