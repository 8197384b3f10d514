use async_trait::async_trait;
use cfmc_core::normalize::{parse_date, parse_number, NumberPolicy, DEFAULT_DATE_FORMATS};
use cfmc_core::{etf_flow_schema, Row, TableSchema, Value, ETF_TICKER_FIELDS, ETF_TOTAL_FIELD};
use cfmc_storage::HttpFetcher;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    documents, AdapterContext, AdapterError, Crawlability, FetchedPage, RawRecord, SourceAdapter,
    SourceTarget,
};

pub const SOURCE_ID: &str = "farside-btc-etf";

/// A header row needs at least this many known tickers.
const MIN_HEADER_TICKERS: usize = 3;
/// Data starts this many rows below the ticker header (the next row is the fee row).
const FIRST_DATA_OFFSET: usize = 2;
const ZERO_EPSILON: f64 = 1e-9;

/// Farside US spot bitcoin ETF daily flow table (US$m).
///
/// The page sits behind a browser challenge, so the table reaches us already
/// extracted as `{"rows": [["Date", "IBIT", ...], ...]}` with text cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtfFlowTableAdapter;

fn cell_text(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Column index for each persisted flow field, read off a header row.
fn column_map(header: &[String]) -> Vec<(&'static str, usize)> {
    let mut columns = Vec::new();
    for (idx, cell) in header.iter().enumerate() {
        if let Some((_, field)) = ETF_TICKER_FIELDS.iter().find(|(ticker, _)| ticker == cell) {
            columns.push((*field, idx));
        }
        let upper = cell.to_ascii_uppercase();
        let is_total = upper.starts_with("TOTAL") || upper == "BTC";
        if is_total && !columns.iter().any(|(f, _)| *f == ETF_TOTAL_FIELD) {
            columns.push((ETF_TOTAL_FIELD, idx));
        }
    }
    columns
}

fn header_index(rows: &[Vec<String>]) -> Option<usize> {
    rows.iter().position(|row| {
        ETF_TICKER_FIELDS
            .iter()
            .filter(|(ticker, _)| row.iter().any(|c| c == ticker))
            .count()
            >= MIN_HEADER_TICKERS
    })
}

impl EtfFlowTableAdapter {
    fn table_rows(url: &str, doc: &JsonMap<String, JsonValue>) -> Result<Vec<Vec<String>>, AdapterError> {
        let rows = doc
            .get("rows")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Structure {
                url: url.to_string(),
                reason: "table document has no rows array".to_string(),
            })?;
        Ok(rows
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|cells| cells.iter().map(cell_text).collect())
                    .unwrap_or_default()
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for EtfFlowTableAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::ExtractedTable
    }

    fn schema(&self) -> TableSchema {
        etf_flow_schema()
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        _targets: &[SourceTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        Err(AdapterError::Unsupported {
            source_id: SOURCE_ID.to_string(),
            operation: "live fetch (supply an extracted table file)",
        })
    }

    /// One record per dated data row; cells keyed by persisted field name.
    fn parse(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        let mut records = Vec::new();
        for doc in documents(page)? {
            let rows = Self::table_rows(&page.url, &doc)?;
            let header_at = header_index(&rows).ok_or_else(|| AdapterError::Structure {
                url: page.url.clone(),
                reason: "no header row with known ETF tickers".to_string(),
            })?;
            let columns = column_map(&rows[header_at]);
            debug!(header_at, columns = columns.len(), "etf header located");

            for row in rows.iter().skip(header_at + FIRST_DATA_OFFSET) {
                let Some(date_text) = row.first().filter(|c| !c.is_empty()) else {
                    continue;
                };
                if row.len() < 2 {
                    continue;
                }
                let mut fields = JsonMap::new();
                fields.insert("date".to_string(), JsonValue::String(date_text.clone()));
                for (field, idx) in &columns {
                    if let Some(cell) = row.get(*idx) {
                        fields.insert(field.to_string(), JsonValue::String(cell.clone()));
                    }
                }
                records.push(RawRecord::new(SOURCE_ID, page.fetched_at, fields));
            }
        }
        if records.is_empty() {
            return Err(AdapterError::Structure {
                url: page.url.clone(),
                reason: "table has no data rows".to_string(),
            });
        }
        Ok(records)
    }

    fn normalize(&self, record: &RawRecord, _ctx: &AdapterContext) -> Option<Row> {
        let date_text = record.get("date").and_then(JsonValue::as_str)?;
        // summary rows ("Total", "Average", ...) have no date and drop out here
        let date = parse_date(date_text, DEFAULT_DATE_FORMATS)?;

        let flow = |field: &str| {
            record
                .get(field)
                .and_then(JsonValue::as_str)
                .and_then(|cell| parse_number(cell, NumberPolicy::Flow))
                .unwrap_or(0.0)
        };

        let stamp = record.fetched_at.to_rfc3339();
        let mut row = Row::new()
            .with("date", date.format("%Y-%m-%d").to_string())
            .with("created_at", stamp.clone())
            .with("updated_at", stamp);

        let mut sum_of_parts = 0.0;
        for (_, field) in ETF_TICKER_FIELDS.iter().copied() {
            let value = flow(field);
            sum_of_parts += value;
            row.set(field, value);
        }
        let mut total = flow(ETF_TOTAL_FIELD);
        if total.abs() < ZERO_EPSILON && sum_of_parts.abs() > ZERO_EPSILON {
            warn!(%date, sum_of_parts, "total missing; using sum of ETF flows");
            total = sum_of_parts;
        }
        row.set(ETF_TOTAL_FIELD, Value::Number(total));
        Some(row)
    }
}
