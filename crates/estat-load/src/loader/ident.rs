//! SQL identifier policy.
//!
//! Dataset and code-list ids are opaque upstream strings; everything that
//! becomes a table or column name passes through [`sanitize`] (lowercase,
//! `[a-z0-9_]`, length-capped) and is double-quoted at the SQL boundary by
//! [`quote`]. Staging tables carry a run-scoped timestamp suffix so that
//! abandoned ones are identifiable and drop-safe.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Longest sanitized base name. Leaves room for the staging prefix and
/// timestamp suffix under PostgreSQL's 63-byte identifier limit.
pub const MAX_BASE_LEN: usize = 40;

/// Prefix of every per-dataset data table.
pub const DATA_TABLE_PREFIX: &str = "data_";

/// Prefix of every staging table.
pub const STAGING_PREFIX: &str = "staging_";

/// Timestamp format of the staging suffix.
const STAGING_TS_FORMAT: &str = "%Y%m%d%H%M%S";

/// Lowercase, replace anything outside `[a-z0-9_]` with `_`, prefix with `_`
/// when the first byte is a digit, and cap the length.
pub fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    if out.as_bytes()[0].is_ascii_digit() {
        out.insert(0, '_');
    }
    out.truncate(MAX_BASE_LEN);
    out
}

/// Double-quote an identifier, doubling embedded quotes. Input is expected to
/// be sanitized already; quoting is the second line of defense.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified, quoted name.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote(schema), quote(table))
}

/// Table name for a dataset, e.g. `nama_10_gdp` → `data_nama_10_gdp`.
pub fn dataset_table(dataset_id: &str) -> String {
    format!("{DATA_TABLE_PREFIX}{}", sanitize(dataset_id))
}

/// Table name for a code list, e.g. `CL_GEO` → `cl_geo`.
pub fn codelist_table(codelist_id: &str) -> String {
    sanitize(codelist_id)
}

/// Run-scoped staging table name for a target table.
pub fn staging_table(target: &str, at: DateTime<Utc>) -> String {
    format!(
        "{STAGING_PREFIX}{}_{}",
        sanitize(target),
        at.format(STAGING_TS_FORMAT)
    )
}

/// If `name` is a staging table for `target`, return its creation timestamp.
/// Used by the reaping sweep to find abandoned staging tables.
pub fn staging_timestamp(name: &str, target: &str) -> Option<DateTime<Utc>> {
    let prefix = format!("{STAGING_PREFIX}{}_", sanitize(target));
    let suffix = name.strip_prefix(&prefix)?;
    NaiveDateTime::parse_from_str(suffix, STAGING_TS_FORMAT)
        .ok()
        .map(|ts| ts.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("NAMA_10_GDP"), "nama_10_gdp");
        assert_eq!(sanitize("weird-id.x"), "weird_id_x");
        assert_eq!(sanitize("10_start"), "_10_start");
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize("a; DROP TABLE x--"), "a__drop_table_x__");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "x".repeat(200);
        assert_eq!(sanitize(&long).len(), MAX_BASE_LEN);
    }

    #[test]
    fn test_quote_doubles_embedded_quotes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("meta", "cl_geo"), "\"meta\".\"cl_geo\"");
    }

    #[test]
    fn test_dataset_and_codelist_tables() {
        assert_eq!(dataset_table("NAMA_10_GDP"), "data_nama_10_gdp");
        assert_eq!(codelist_table("CL_GEO"), "cl_geo");
    }

    #[test]
    fn test_staging_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap();
        let name = staging_table("data_nama_10_gdp", at);
        assert_eq!(name, "staging_data_nama_10_gdp_20240601123045");
        assert_eq!(staging_timestamp(&name, "data_nama_10_gdp"), Some(at));
        assert_eq!(staging_timestamp(&name, "data_other"), None);
        assert_eq!(staging_timestamp("staging_data_nama_10_gdp_garbage", "data_nama_10_gdp"), None);
    }

    #[test]
    fn test_staging_name_fits_postgres_limit() {
        let long_target = sanitize(&"y".repeat(200));
        let name = staging_table(&long_target, Utc::now());
        assert!(name.len() <= 63);
    }
}
