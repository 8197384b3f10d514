//! Source adapter contracts plus the ETF flow and Binance copy-trading adapters.
//!
//! Adapters only turn fetched payloads into [`RawRecord`]s and then into
//! canonical rows. They never read or write the persisted store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use cfmc_core::{Row, TableSchema};
use cfmc_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub mod binance;
mod copy_trade;
mod copy_traders;
mod etf_flow;

pub use binance::{
    lead_id_from_url, lead_portfolio_id_from_app_data, parse_time_range_days, resolve_lead_portfolio_id,
    LeadTarget,
};
pub use copy_trade::CopyTradeMetricsAdapter;
pub use copy_traders::CopyTradersAdapter;
pub use etf_flow::EtfFlowTableAdapter;

pub const CRATE_NAME: &str = "cfmc-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crawlability {
    /// Public JSON endpoints reachable with plain HTTP.
    Api,
    /// Needs a rendered page; tables arrive already extracted by an outside harness.
    ExtractedTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn json(url: impl Into<String>, payload: &JsonValue, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            content_type: "application/json".to_string(),
            body: payload.to_string().into_bytes(),
            fetched_at,
        }
    }

    pub fn body_json(&self) -> Result<JsonValue, AdapterError> {
        serde_json::from_slice(&self.body).map_err(|err| AdapterError::Structure {
            url: self.url.clone(),
            reason: format!("body is not JSON: {err}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// Date stamped into `scraped_date` / `created_date`.
    pub run_date: NaiveDate,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, fetched_at: DateTime<Utc>, run_date: NaiveDate) -> Self {
        Self {
            run_id,
            fetched_at,
            run_date,
        }
    }
}

/// A configured target: a lead-details URL, a bare lead id, or a table URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTarget {
    pub url: String,
}

/// One loosely typed record as a source produced it. The only shape the normalizer sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub fields: JsonMap<String, JsonValue>,
}

impl RawRecord {
    pub fn new(source_id: &str, fetched_at: DateTime<Utc>, fields: JsonMap<String, JsonValue>) -> Self {
        Self {
            source_id: source_id.to_string(),
            fetched_at,
            fields,
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn object(&self, name: &str) -> Option<&JsonMap<String, JsonValue>> {
        self.fields.get(name).and_then(JsonValue::as_object)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("api error from {endpoint}: code {code}: {message}")]
    Api {
        endpoint: String,
        code: String,
        message: String,
    },
    #[error("unexpected payload from {url}: {reason}")]
    Structure { url: String, reason: String },
    #[error("{source_id} does not support {operation}")]
    Unsupported {
        source_id: String,
        operation: &'static str,
    },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// True when the source could not be reached or no longer looks the way the adapter expects.
    pub fn is_source_unavailable(&self) -> bool {
        !matches!(self, AdapterError::Unsupported { .. } | AdapterError::Message(_))
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn crawlability(&self) -> Crawlability;
    fn schema(&self) -> TableSchema;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[SourceTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError>;

    /// `None` when the record cannot form a row (no usable key).
    fn normalize(&self, record: &RawRecord, ctx: &AdapterContext) -> Option<Row>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        etf_flow::SOURCE_ID => Some(Box::new(EtfFlowTableAdapter)),
        copy_trade::SOURCE_ID => Some(Box::new(CopyTradeMetricsAdapter::default())),
        copy_traders::SOURCE_ID => Some(Box::new(CopyTradersAdapter::default())),
        _ => None,
    }
}

pub fn known_source_ids() -> &'static [&'static str] {
    &[etf_flow::SOURCE_ID, copy_trade::SOURCE_ID, copy_traders::SOURCE_ID]
}

/// Every `*.json` file in `dir`, sorted by file name, as pages fetched at `fetched_at`.
pub fn load_fixture_pages(dir: impl AsRef<Path>, fetched_at: DateTime<Utc>) -> Result<Vec<FetchedPage>> {
    let dir = dir.as_ref();
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading fixture directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect::<Vec<PathBuf>>();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            Ok(FetchedPage {
                url: format!("file://{}", path.display()),
                content_type: "application/json".to_string(),
                body,
                fetched_at,
            })
        })
        .collect()
}

/// Pages a fixture/file payload can hold: one JSON document or an array of them.
pub(crate) fn documents(page: &FetchedPage) -> Result<Vec<JsonMap<String, JsonValue>>, AdapterError> {
    match page.body_json()? {
        JsonValue::Object(object) => Ok(vec![object]),
        JsonValue::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(object) => Some(object),
                _ => None,
            })
            .collect()),
        _ => Err(AdapterError::Structure {
            url: page.url.clone(),
            reason: "expected a JSON object or array".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_source() {
        for id in known_source_ids() {
            let adapter = adapter_for_source(id).expect("adapter registered");
            assert_eq!(adapter.source_id(), *id);
        }
        assert!(adapter_for_source("unknown").is_none());
    }

    #[test]
    fn unsupported_operations_are_not_outages() {
        let err = AdapterError::Unsupported {
            source_id: "farside-btc-etf".to_string(),
            operation: "live fetch",
        };
        assert!(!err.is_source_unavailable());
        let api = AdapterError::Api {
            endpoint: "/x".to_string(),
            code: "100001".to_string(),
            message: "rate limited".to_string(),
        };
        assert!(api.is_source_unavailable());
    }

    #[test]
    fn non_json_page_is_structural_error() {
        let page = FetchedPage {
            url: "file://x.json".to_string(),
            content_type: "application/json".to_string(),
            body: b"<html/>".to_vec(),
            fetched_at: Utc::now(),
        };
        assert!(matches!(documents(&page), Err(AdapterError::Structure { .. })));
    }
}
