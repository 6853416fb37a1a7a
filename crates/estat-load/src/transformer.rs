//! Streaming conversion of wide TSV chunks into long-form observations.
//!
//! Per chunk: unpivot each (row, time-period) cell into one candidate
//! observation, split the raw token into numeric value and flags, and, for
//! the full representation, substitute dimension codes with their code-list
//! labels. Missing observations (`:` cells, empty cells) are emitted as
//! null-valued rows, so every input row contributes exactly one observation
//! per time period.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use estat_common::{EstatError, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::models::{Codelist, Dsd, Observation, Representation};
use crate::parser::{TsvChunk, TsvHeader};

/// Token grammar: an optional signed numeric literal followed by optional
/// flag characters (letters and internal spaces).
static VALUE_FLAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?[0-9.eE+-]+)?\s*([A-Za-z ]*)\s*$").expect("value/flag regex is valid")
});

/// Transforms parsed TSV chunks into a lazy observation stream.
pub struct Transformer {
    /// Non-time dimension ids in DSD order.
    dimension_ids: Vec<String>,
    /// Per-dimension code → label maps, for the full representation.
    labels: HashMap<String, HashMap<String, String>>,
    representation: Representation,
}

impl Transformer {
    pub fn new(
        dsd: &Dsd,
        codelists: &BTreeMap<String, Codelist>,
        representation: Representation,
    ) -> Self {
        let mut labels = HashMap::new();
        if representation == Representation::Full {
            for dim in &dsd.dimensions {
                let Some(codelist_id) = dim.codelist_id.as_deref() else {
                    continue;
                };
                match codelists.get(codelist_id) {
                    Some(list) => {
                        let map: HashMap<String, String> = list
                            .codes
                            .values()
                            .map(|c| (c.id.clone(), c.label.clone()))
                            .collect();
                        labels.insert(dim.id.clone(), map);
                    },
                    None => {
                        // Unresolved reference: codes pass through as their
                        // own labels.
                        warn!(
                            dimension = %dim.id,
                            codelist = codelist_id,
                            "code list not available, emitting codes verbatim"
                        );
                    },
                }
            }
        }

        Self {
            dimension_ids: dsd.dimension_ids().iter().map(|s| s.to_string()).collect(),
            labels,
            representation,
        }
    }

    /// Build the lazy observation sequence over `chunks`.
    ///
    /// The header's dimension columns are reordered to DSD declaration order;
    /// a DSD dimension absent from the header is a malformed input.
    pub fn transform<I>(self, header: &TsvHeader, chunks: I) -> Result<ObservationStream<I>>
    where
        I: Iterator<Item = Result<TsvChunk>>,
    {
        let mut column_of = Vec::with_capacity(self.dimension_ids.len());
        for dim_id in &self.dimension_ids {
            let idx = header
                .dimension_ids
                .iter()
                .position(|h| h == dim_id)
                .ok_or_else(|| {
                    EstatError::tsv_malformed(
                        1,
                        format!("dimension '{dim_id}' missing from TSV header"),
                    )
                })?;
            column_of.push(idx);
        }

        for extra in header
            .dimension_ids
            .iter()
            .filter(|h| !self.dimension_ids.contains(h))
        {
            warn!(dimension = %extra, "TSV header dimension not declared in DSD, ignored");
        }

        debug!(
            representation = self.representation.as_str(),
            dimensions = self.dimension_ids.len(),
            time_periods = header.time_periods.len(),
            "starting transformation"
        );

        Ok(ObservationStream {
            transformer: self,
            time_periods: header.time_periods.clone(),
            column_of,
            chunks,
            current: Vec::new(),
            row_idx: 0,
            period_idx: 0,
            failed: false,
        })
    }

    fn dimension_value(&self, dim_id: &str, code: &str) -> String {
        match self.labels.get(dim_id).and_then(|m| m.get(code)) {
            Some(label) => label.clone(),
            // Codes with no entry pass through unchanged.
            None => code.to_string(),
        }
    }
}

/// Split a raw observation token into `(value, flags)`.
///
/// - `10.5` → `(Some(10.5), None)`
/// - `11 p` → `(Some(11.0), Some("p"))`
/// - `:` / `: ` → `(None, None)`; `: c` → `(None, Some("c"))`
/// - `p` (lone flags) → `(None, Some("p"))`
/// - lone `-`, `.`, other unparseable numerics → `(None, None)`
/// - overflowing literals (`1e999`) → `(None, Some(original))`
///
/// Flag whitespace is collapsed to single spaces and trimmed.
pub fn parse_value(token: &str) -> (Option<f64>, Option<String>) {
    let token = token.trim();
    if token.is_empty() {
        return (None, None);
    }

    // Not-available marker, optionally followed by flags.
    if let Some(rest) = token.strip_prefix(':') {
        return (None, collapse_flags(rest));
    }

    let Some(caps) = VALUE_FLAG_RE.captures(token) else {
        // Outside the grammar entirely: preserve the token as flags.
        return (None, collapse_flags(token));
    };

    let numeric = caps.get(1).map(|m| m.as_str()).filter(|s| !s.is_empty());
    let flags = collapse_flags(caps.get(2).map(|m| m.as_str()).unwrap_or(""));

    match numeric {
        Some(num) => match num.parse::<f64>() {
            Ok(v) if v.is_finite() => (Some(v), flags),
            // NaN / infinity are not permitted as observation values.
            Ok(_) => (None, collapse_flags(token)),
            Err(_) => {
                if token.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
                    // The numeric class and the flag class overlap on 'e'/'E';
                    // a purely alphabetic token is a lone flag string.
                    (None, collapse_flags(token))
                } else {
                    // Lone '-', '.', or similar numeric debris.
                    (None, None)
                }
            },
        },
        None => (None, flags),
    }
}

fn collapse_flags(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Lazy, finite iterator of observations produced from a chunk stream.
pub struct ObservationStream<I> {
    transformer: Transformer,
    time_periods: Vec<String>,
    /// For each DSD dimension, its column index in the TSV rows.
    column_of: Vec<usize>,
    chunks: I,
    current: Vec<crate::parser::TsvRow>,
    row_idx: usize,
    period_idx: usize,
    failed: bool,
}

impl<I> Iterator for ObservationStream<I>
where
    I: Iterator<Item = Result<TsvChunk>>,
{
    type Item = Result<Observation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if self.row_idx < self.current.len() {
                let row = &self.current[self.row_idx];
                let period = &self.time_periods[self.period_idx];
                let token = &row.tokens[self.period_idx];

                let (value, flags) = parse_value(token);
                let dimensions = self
                    .transformer
                    .dimension_ids
                    .iter()
                    .zip(&self.column_of)
                    .map(|(dim_id, &col)| {
                        (
                            dim_id.clone(),
                            self.transformer.dimension_value(dim_id, &row.dimensions[col]),
                        )
                    })
                    .collect();

                let obs = Observation {
                    dimensions,
                    time_period: period.clone(),
                    value,
                    flags,
                };

                self.period_idx += 1;
                if self.period_idx >= self.time_periods.len() {
                    self.period_idx = 0;
                    self.row_idx += 1;
                }
                return Some(Ok(obs));
            }

            match self.chunks.next() {
                Some(Ok(chunk)) => {
                    self.current = chunk.rows;
                    self.row_idx = 0;
                    self.period_idx = 0;
                },
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                },
                None => return None,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attribute, Code, Dimension};
    use crate::parser::TsvRow;

    fn sample_dsd() -> Dsd {
        Dsd {
            id: "demo".into(),
            name: None,
            version: "1.0".into(),
            dimensions: vec![
                Dimension {
                    id: "geo".into(),
                    name: None,
                    codelist_id: Some("CL_GEO".into()),
                    position: 0,
                },
                Dimension {
                    id: "freq".into(),
                    name: None,
                    codelist_id: Some("CL_FREQ".into()),
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

    fn sample_codelists() -> BTreeMap<String, Codelist> {
        let mut geo_codes = BTreeMap::new();
        for (id, label) in [("DE", "Germany"), ("FR", "France")] {
            geo_codes.insert(
                id.to_string(),
                Code {
                    id: id.into(),
                    label: label.into(),
                    description: None,
                    parent_code: None,
                },
            );
        }
        let mut freq_codes = BTreeMap::new();
        freq_codes.insert(
            "A".to_string(),
            Code {
                id: "A".into(),
                label: "Annual".into(),
                description: None,
                parent_code: None,
            },
        );

        let mut lists = BTreeMap::new();
        lists.insert(
            "CL_GEO".to_string(),
            Codelist {
                id: "CL_GEO".into(),
                version: "1.0".into(),
                codes: geo_codes,
            },
        );
        lists.insert(
            "CL_FREQ".to_string(),
            Codelist {
                id: "CL_FREQ".into(),
                version: "1.0".into(),
                codes: freq_codes,
            },
        );
        lists
    }

    fn sample_header() -> TsvHeader {
        TsvHeader {
            dimension_ids: vec!["geo".into(), "freq".into()],
            time_dimension: "time".into(),
            time_periods: vec!["2020".into(), "2021".into()],
        }
    }

    fn sample_chunks() -> Vec<Result<TsvChunk>> {
        vec![Ok(TsvChunk {
            rows: vec![
                TsvRow {
                    dimensions: vec!["DE".into(), "A".into()],
                    tokens: vec!["10.5".into(), "11 p".into()],
                },
                TsvRow {
                    dimensions: vec!["FR".into(), "A".into()],
                    tokens: vec![":".into(), "9".into()],
                },
            ],
        })]
    }

    fn run(representation: Representation) -> Vec<Observation> {
        let transformer = Transformer::new(&sample_dsd(), &sample_codelists(), representation);
        transformer
            .transform(&sample_header(), sample_chunks().into_iter())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_standard_representation_small_full_load() {
        let observations = run(Representation::Standard);

        // Every cell becomes an observation, including the ':' one.
        assert_eq!(observations.len(), 4);

        assert_eq!(observations[0].dimension("geo"), Some("DE"));
        assert_eq!(observations[0].time_period, "2020");
        assert_eq!(observations[0].value, Some(10.5));
        assert_eq!(observations[0].flags, None);

        assert_eq!(observations[1].time_period, "2021");
        assert_eq!(observations[1].value, Some(11.0));
        assert_eq!(observations[1].flags.as_deref(), Some("p"));

        assert_eq!(observations[2].dimension("geo"), Some("FR"));
        assert_eq!(observations[2].time_period, "2020");
        assert_eq!(observations[2].value, None);
        assert_eq!(observations[2].flags, None);

        assert_eq!(observations[3].time_period, "2021");
        assert_eq!(observations[3].value, Some(9.0));
    }

    #[test]
    fn test_full_representation_substitutes_labels() {
        let observations = run(Representation::Full);

        let geos: Vec<&str> = observations
            .iter()
            .map(|o| o.dimension("geo").unwrap())
            .collect();
        assert_eq!(geos, vec!["Germany", "Germany", "France", "France"]);
        for obs in &observations {
            assert_eq!(obs.dimension("freq"), Some("Annual"));
        }
    }

    #[test]
    fn test_unknown_codes_pass_through_in_full_representation() {
        let mut chunks = sample_chunks();
        if let Ok(chunk) = &mut chunks[0] {
            chunk.rows[0].dimensions[0] = "XX".into();
        }
        let transformer =
            Transformer::new(&sample_dsd(), &sample_codelists(), Representation::Full);
        let observations: Vec<_> = transformer
            .transform(&sample_header(), chunks.into_iter())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(observations[0].dimension("geo"), Some("XX"));
    }

    #[test]
    fn test_header_reordered_to_dsd_order() {
        let header = TsvHeader {
            dimension_ids: vec!["freq".into(), "geo".into()],
            time_dimension: "time".into(),
            time_periods: vec!["2020".into()],
        };
        let chunks = vec![Ok(TsvChunk {
            rows: vec![TsvRow {
                dimensions: vec!["A".into(), "DE".into()],
                tokens: vec!["1".into()],
            }],
        })];
        let transformer =
            Transformer::new(&sample_dsd(), &sample_codelists(), Representation::Standard);
        let observations: Vec<_> = transformer
            .transform(&header, chunks.into_iter())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        // DSD order (geo, freq), not header order.
        assert_eq!(
            observations[0].dimensions,
            vec![("geo".to_string(), "DE".to_string()), ("freq".to_string(), "A".to_string())]
        );
    }

    #[test]
    fn test_missing_dsd_dimension_in_header_rejected() {
        let header = TsvHeader {
            dimension_ids: vec!["geo".into()],
            time_dimension: "time".into(),
            time_periods: vec!["2020".into()],
        };
        let transformer =
            Transformer::new(&sample_dsd(), &sample_codelists(), Representation::Standard);
        assert!(transformer
            .transform(&header, std::iter::empty())
            .is_err());
    }

    #[test]
    fn test_chunk_error_propagates_and_stops() {
        let chunks: Vec<Result<TsvChunk>> = vec![
            Ok(TsvChunk {
                rows: vec![TsvRow {
                    dimensions: vec!["DE".into(), "A".into()],
                    tokens: vec!["1".into(), "2".into()],
                }],
            }),
            Err(EstatError::tsv_malformed(7, "boom")),
        ];
        let transformer =
            Transformer::new(&sample_dsd(), &sample_codelists(), Representation::Standard);
        let mut stream = transformer
            .transform(&sample_header(), chunks.into_iter())
            .unwrap();

        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_parse_value_grammar() {
        assert_eq!(parse_value("10.5"), (Some(10.5), None));
        assert_eq!(parse_value("11 p"), (Some(11.0), Some("p".into())));
        assert_eq!(parse_value("-3.2e2"), (Some(-320.0), None));
        assert_eq!(parse_value("5  b  d"), (Some(5.0), Some("b d".into())));
        assert_eq!(parse_value(":"), (None, None));
        assert_eq!(parse_value(": "), (None, None));
        assert_eq!(parse_value(": c"), (None, Some("c".into())));
        assert_eq!(parse_value("p"), (None, Some("p".into())));
        assert_eq!(parse_value("b d"), (None, Some("b d".into())));
        assert_eq!(parse_value(""), (None, None));
        assert_eq!(parse_value("   "), (None, None));
    }

    #[test]
    fn test_parse_value_invalid_numerics() {
        // Lone sign or dot: invalid value, no flag.
        assert_eq!(parse_value("-"), (None, None));
        assert_eq!(parse_value("."), (None, None));
        assert_eq!(parse_value("+-"), (None, None));
        // 'e' alone is a legitimate flag, not a failed number.
        assert_eq!(parse_value("e"), (None, Some("e".into())));
        // Overflow keeps the original token as flags.
        assert_eq!(parse_value("1e999"), (None, Some("1e999".into())));
    }

    #[test]
    fn test_parse_value_outside_grammar() {
        assert_eq!(parse_value("12,3"), (None, Some("12,3".into())));
        assert_eq!(parse_value("n/a"), (None, Some("n/a".into())));
    }

    #[test]
    fn test_row_count_invariant_with_null_policy() {
        // D rows x T periods cells in, D*T observations out.
        let observations = run(Representation::Standard);
        assert_eq!(observations.len(), 2 * 2);
    }
}
