//! Streaming parser for the gzip-compressed wide TSV matrices.
//!
//! The header's first cell names the non-time dimensions joined with the
//! time dimension by a backslash (`geo,freq\time`); the remaining header
//! cells are the time-period labels. Each data row's first cell holds the
//! comma-separated dimension values; the remaining cells are raw observation
//! tokens which this parser leaves undecoded (the transformer owns the token
//! grammar).
//!
//! Rows are yielded in bounded chunks so memory use is O(chunk), not O(file).

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use estat_common::{EstatError, Result};
use flate2::read::GzDecoder;
use tracing::{debug, info};

/// Upper bound on rows per chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 50_000;

/// Decoded header of a TSV matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsvHeader {
    /// Non-time dimension ids, case-folded, in header order.
    pub dimension_ids: Vec<String>,
    /// Time dimension id, case-folded.
    pub time_dimension: String,
    /// Time-period labels in declaration order.
    pub time_periods: Vec<String>,
}

/// One data row: dimension values plus one raw token per time period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsvRow {
    pub dimensions: Vec<String>,
    pub tokens: Vec<String>,
}

/// A bounded batch of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsvChunk {
    pub rows: Vec<TsvRow>,
}

/// Streams a compressed TSV matrix as (header, chunk iterator).
pub struct TsvParser {
    path: std::path::PathBuf,
    chunk_rows: usize,
}

impl TsvParser {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    /// Override the chunk bound (mainly for tests).
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    /// Open the file, decode the header, and return the lazy chunk stream.
    pub fn parse(self) -> Result<(TsvHeader, TsvChunks)> {
        info!(path = %self.path.display(), "opening TSV matrix");

        let file = File::open(&self.path)?;
        let mut lines = BufReader::new(GzDecoder::new(file)).lines();

        let header_line = match lines.next() {
            Some(line) => line.map_err(|e| gzip_error(1, e))?,
            None => return Err(EstatError::tsv_malformed(1, "file is empty")),
        };
        let header = parse_header(&header_line)?;

        debug!(
            dimensions = header.dimension_ids.len(),
            time_periods = header.time_periods.len(),
            "TSV header decoded"
        );

        Ok((
            header.clone(),
            TsvChunks {
                lines,
                dim_count: header.dimension_ids.len(),
                period_count: header.time_periods.len(),
                chunk_rows: self.chunk_rows,
                line_no: 1,
                done: false,
            },
        ))
    }
}

/// Lazy iterator over bounded row chunks.
pub struct TsvChunks {
    lines: Lines<BufReader<GzDecoder<File>>>,
    dim_count: usize,
    period_count: usize,
    chunk_rows: usize,
    line_no: u64,
    done: bool,
}

impl Iterator for TsvChunks {
    type Item = Result<TsvChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut rows = Vec::new();
        while rows.len() < self.chunk_rows {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(gzip_error(self.line_no + 1, e)));
                },
                None => {
                    self.done = true;
                    break;
                },
            };
            self.line_no += 1;

            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            match parse_row(line, self.line_no, self.dim_count, self.period_count) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                },
            }
        }

        if rows.is_empty() {
            None
        } else {
            Some(Ok(TsvChunk { rows }))
        }
    }
}

fn parse_header(line: &str) -> Result<TsvHeader> {
    let line = line.trim_end_matches('\r');
    let mut cells = line.split('\t');

    let first = cells.next().unwrap_or("");
    let (dims_part, time_part) = first.split_once('\\').ok_or_else(|| {
        EstatError::tsv_malformed(1, format!("header cell lacks dims\\time separator: '{first}'"))
    })?;

    let dimension_ids: Vec<String> = dims_part
        .split(',')
        .map(|d| d.trim().to_lowercase())
        .collect();
    if dimension_ids.iter().any(|d| d.is_empty()) {
        return Err(EstatError::tsv_malformed(
            1,
            format!("empty dimension id in header: '{first}'"),
        ));
    }

    let time_dimension = time_part.trim().to_lowercase();
    if time_dimension.is_empty() {
        return Err(EstatError::tsv_malformed(1, "empty time dimension id"));
    }

    let time_periods: Vec<String> = cells.map(|c| c.trim().to_string()).collect();
    if time_periods.is_empty() {
        return Err(EstatError::tsv_malformed(1, "header has no time periods"));
    }
    if time_periods.iter().any(|p| p.is_empty()) {
        return Err(EstatError::tsv_malformed(1, "empty time-period label"));
    }

    Ok(TsvHeader {
        dimension_ids,
        time_dimension,
        time_periods,
    })
}

fn parse_row(line: &str, line_no: u64, dim_count: usize, period_count: usize) -> Result<TsvRow> {
    let mut cells = line.split('\t');

    let first = cells.next().unwrap_or("");
    let dimensions: Vec<String> = first.split(',').map(|v| v.trim().to_string()).collect();
    if dimensions.len() != dim_count {
        return Err(EstatError::tsv_malformed(
            line_no,
            format!(
                "expected {dim_count} dimension values, found {} in '{first}'",
                dimensions.len()
            ),
        ));
    }

    let tokens: Vec<String> = cells.map(|c| c.to_string()).collect();
    if tokens.len() != period_count {
        return Err(EstatError::tsv_malformed(
            line_no,
            format!(
                "expected {period_count} observation cells, found {}",
                tokens.len()
            ),
        ));
    }

    Ok(TsvRow { dimensions, tokens })
}

fn gzip_error(line: u64, e: std::io::Error) -> EstatError {
    EstatError::tsv_malformed(line, format!("read failure (corrupt gzip?): {e}"))
}

// ============================================================================
// Tests
// ============================================================================
