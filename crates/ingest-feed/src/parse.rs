//! Parse step (§4.E Phase 1.2): format-specific row extraction with a
//! bounded list of parse errors. Only CSV is implemented — the spec
//! requires it for v1; XML/JSON parsers are future work for a feed-format
//! expansion, not this crate's concern yet.

use ingest_types::ParseRowError;
use serde_json::{Map, Value};

/// One normalized row pulled out of a feed, still in raw key/value form —
/// the worker maps this onto `Product`/`Price` during processing.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub row_number: u64,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub rows: Vec<ParsedRow>,
    pub errors: Vec<ParseRowError>,
}

pub trait FeedParser: Send + Sync {
    /// Parses `bytes` into rows, capping the persisted error list at
    /// `max_errors` (§4.E.1: "first 100 persisted").
    fn parse(&self, bytes: &[u8], max_errors: u64) -> ParseOutcome;
}

pub struct CsvFeedParser;

impl FeedParser for CsvFeedParser {
    fn parse(&self, bytes: &[u8], max_errors: u64) -> ParseOutcome {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                return ParseOutcome {
                    rows: Vec::new(),
                    errors: vec![ParseRowError { row: 0, message: format!("failed to read header row: {e}") }],
                };
            }
        };

        let mut outcome = ParseOutcome::default();
        for (idx, record) in reader.records().enumerate() {
            let row_number = idx as u64 + 1;
            match record {
                Ok(record) => {
                    let mut fields = Map::new();
                    for (key, value) in headers.iter().zip(record.iter()) {
                        fields.insert(key.to_string(), Value::String(value.to_string()));
                    }
                    outcome.rows.push(ParsedRow { row_number, fields });
                }
                Err(e) => {
                    if (outcome.errors.len() as u64) < max_errors {
                        outcome.errors.push(ParseRowError { row: row_number, message: e.to_string() });
                    }
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_csv_rows() {
        let csv = b"sku,brand,price\nA1,Acme,999\nA2,Acme,1099\n";
        let outcome = CsvFeedParser.parse(csv, 100);
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.rows[0].fields.get("sku").unwrap(), "A1");
    }

    #[test]
    fn error_list_is_capped() {
        // A quoted field with an embedded unescaped quote trips a parse
        // error on that record while `flexible` mode keeps the reader
        // going for subsequent rows.
        let mut csv = String::from("sku,brand\n");
        for i in 0..5 {
            csv.push_str(&format!("\"bad\"quote{i},x\n"));
        }
        let outcome = CsvFeedParser.parse(csv.as_bytes(), 2);
        assert!(outcome.errors.len() <= 2);
    }
}
