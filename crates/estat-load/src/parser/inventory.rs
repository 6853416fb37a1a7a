//! Parser for the Eurostat data inventory (Table of Contents).
//!
//! The inventory is a TSV whose rows carry at least a dataset code, a record
//! type, the last-update timestamp of the data, and the bulk download URL.
//! Lookups are keyed by lowercased dataset id. Records with a missing or
//! unparseable timestamp stay in the index (the download URL may still be
//! usable) but fail the `last_update` lookup.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use estat_common::{EstatError, Result};
use tracing::{debug, info, warn};

/// One inventory row for a dataset.
#[derive(Debug, Clone)]
pub struct InventoryEntry {
    pub code: String,
    pub last_update: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
}

/// Parsed inventory with per-dataset lookups.
pub struct InventoryParser {
    entries: HashMap<String, InventoryEntry>,
}

impl InventoryParser {
    /// Load and parse the inventory file.
    pub fn from_path(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "parsing inventory");

        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();

        let header = match lines.next() {
            Some(line) => line?,
            None => return Err(EstatError::tsv_malformed(1, "inventory file is empty")),
        };
        let columns = InventoryColumns::from_header(&header)?;

        let mut entries = HashMap::new();
        for (idx, line) in lines.enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let cells: Vec<&str> = line.split('\t').collect();

            let record_type = columns.get(&cells, columns.record_type);
            if !record_type.eq_ignore_ascii_case("dataset") {
                continue;
            }

            let code = columns.get(&cells, columns.code).trim().to_string();
            if code.is_empty() {
                continue;
            }

            let raw_ts = columns.get(&cells, columns.last_update);
            let last_update = parse_utc_timestamp(raw_ts);
            if last_update.is_none() && !raw_ts.trim().is_empty() {
                warn!(
                    dataset_id = %code,
                    line = idx + 2,
                    value = raw_ts,
                    "unparseable last-update timestamp in inventory"
                );
            }

            let download_url = columns
                .download_url
                .map(|i| columns.get(&cells, Some(i)).trim().to_string())
                .filter(|u| !u.is_empty());

            entries.insert(
                code.to_lowercase(),
                InventoryEntry {
                    code,
                    last_update,
                    download_url,
                },
            );
        }

        debug!(datasets = entries.len(), "inventory parsed");
        Ok(Self { entries })
    }

    /// Last-update timestamp for a dataset; `InventoryMissing` when the
    /// dataset is absent or its timestamp was malformed.
    pub fn last_update(&self, dataset_id: &str) -> Result<DateTime<Utc>> {
        self.entries
            .get(&dataset_id.to_lowercase())
            .and_then(|e| e.last_update)
            .ok_or_else(|| EstatError::inventory_missing(dataset_id))
    }

    /// Bulk download URL for a dataset.
    pub fn download_url(&self, dataset_id: &str) -> Result<&str> {
        self.entries
            .get(&dataset_id.to_lowercase())
            .and_then(|e| e.download_url.as_deref())
            .ok_or_else(|| EstatError::inventory_missing(dataset_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Column indices resolved from the header row. Header names vary slightly
/// between inventory revisions, so several spellings are accepted.
struct InventoryColumns {
    code: Option<usize>,
    record_type: Option<usize>,
    last_update: Option<usize>,
    download_url: Option<usize>,
}

impl InventoryColumns {
    fn from_header(header: &str) -> Result<Self> {
        let mut code = None;
        let mut record_type = None;
        let mut last_update = None;
        let mut download_url = None;

        for (idx, name) in header.trim_end_matches('\r').split('\t').enumerate() {
            match name.trim().to_lowercase().as_str() {
                "code" => code = Some(idx),
                "type" => record_type = Some(idx),
                "last data change" | "last update of data" | "last update" => {
                    last_update = Some(idx)
                },
                "data download url (tsv)" | "download url" | "download url (tsv)" => {
                    download_url = Some(idx)
                },
                _ => {},
            }
        }

        if code.is_none() || record_type.is_none() {
            return Err(EstatError::tsv_malformed(
                1,
                format!("inventory header lacks code/type columns: '{header}'"),
            ));
        }

        Ok(Self {
            code,
            record_type,
            last_update,
            download_url,
        })
    }

    fn get<'a>(&self, cells: &[&'a str], idx: Option<usize>) -> &'a str {
        idx.and_then(|i| cells.get(i).copied()).unwrap_or("")
    }
}

/// Parse the timestamp formats observed in the inventory; naive timestamps
/// are interpreted as UTC.
fn parse_utc_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d.%m.%Y %H:%M:%S",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}
