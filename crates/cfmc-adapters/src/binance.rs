//! Binance copy-trading public endpoints: envelope handling, pagination and
//! lead id discovery.

use cfmc_core::normalize::parse_duration_days;
use cfmc_storage::HttpFetcher;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use crate::{AdapterContext, AdapterError};

pub const BASE_URL: &str = "https://www.binance.com";
pub const OVERVIEW_PATH: &str = "/bapi/copy-trade/lead/v1/public/lead/overview";
pub const PERFORMANCE_PATH: &str = "/bapi/copy-trade/lead/v1/public/lead/spotLeadPortfolioPerformance";
pub const COPY_TRADERS_PATH: &str = "/bapi/copy-trade/lead/v1/public/lead/copyTraders";

pub const SUCCESS_CODE: &str = "000000";
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_TIME_RANGE: &str = "180D";

/// Upper bound on pages walked for one listing.
const MAX_PAGES: usize = 200;

/// Strips the `{code, message, data}` envelope. A present code other than
/// `"000000"` is an API error.
pub fn unwrap_envelope(endpoint: &str, payload: JsonValue) -> Result<JsonValue, AdapterError> {
    let JsonValue::Object(mut object) = payload else {
        return Ok(payload);
    };
    let code = match object.get("code") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    if let Some(code) = code {
        if code != SUCCESS_CODE {
            let message = object
                .get("message")
                .or_else(|| object.get("msg"))
                .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
                .unwrap_or_default();
            return Err(AdapterError::Api {
                endpoint: endpoint.to_string(),
                code,
                message,
            });
        }
    }
    match object.remove("data") {
        Some(data) => Ok(data),
        None => Ok(JsonValue::Object(object)),
    }
}

/// Record list out of a listing payload: a bare array, or the first array
/// under `rows`, `list`, `items` or `data`; a non-empty object counts as one record.
pub fn extract_records(payload: &JsonValue) -> Vec<JsonMap<String, JsonValue>> {
    let objects = |items: &Vec<JsonValue>| {
        items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect::<Vec<_>>()
    };
    match payload {
        JsonValue::Array(items) => objects(items),
        JsonValue::Object(object) => {
            for key in ["rows", "list", "items", "data"] {
                if let Some(JsonValue::Array(items)) = object.get(key) {
                    return objects(items);
                }
            }
            if object.is_empty() {
                Vec::new()
            } else {
                vec![object.clone()]
            }
        }
        _ => Vec::new(),
    }
}

pub async fn get_data(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: &str,
    path: &str,
    query: &[(String, String)],
) -> Result<JsonValue, AdapterError> {
    let url = format!("{BASE_URL}{path}");
    let payload = http.get_json(ctx.run_id, source_id, &url, query).await?;
    unwrap_envelope(path, payload)
}

/// Walks `page=1..` until a short or empty page.
pub async fn paginate(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: &str,
    path: &str,
    base_query: &[(String, String)],
    page_size: usize,
) -> Result<Vec<JsonMap<String, JsonValue>>, AdapterError> {
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    for page in 1..=MAX_PAGES {
        let mut query = base_query.to_vec();
        query.push(("page".to_string(), page.to_string()));
        query.push(("pageSize".to_string(), page_size.to_string()));
        let payload = get_data(http, ctx, source_id, path, &query).await?;
        let batch = extract_records(&payload);
        let fetched = batch.len();
        debug!(source_id, page, fetched, "listing page");
        records.extend(batch);
        if fetched < page_size {
            return Ok(records);
        }
    }
    warn!(source_id, path, "stopped paginating at page limit");
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadTarget {
    pub lead_id: String,
    pub time_range: Option<String>,
}

/// Accepts `.../lead-details/<id>?timeRange=<r>` or a bare numeric id.
pub fn lead_id_from_url(raw: &str) -> Option<LeadTarget> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return Some(LeadTarget {
            lead_id: raw.to_string(),
            time_range: None,
        });
    }

    let (_, after) = raw.split_once("/lead-details/")?;
    let lead_id = after
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>();
    if lead_id.is_empty() {
        return None;
    }
    let time_range = raw
        .split_once('?')
        .map(|(_, query)| query.split('#').next().unwrap_or_default())
        .and_then(|query| {
            query.split('&').find_map(|pair| match pair.split_once('=') {
                Some(("timeRange", value)) if !value.is_empty() => Some(value.to_string()),
                _ => None,
            })
        });
    Some(LeadTarget { lead_id, time_range })
}

/// `routeProps.data.leadPortfolioId` from the page's embedded app data, given
/// as a JSON object or a JSON string.
pub fn lead_portfolio_id_from_app_data(app_data: &JsonValue) -> Option<String> {
    let parsed;
    let app_data = match app_data {
        JsonValue::String(text) => {
            parsed = serde_json::from_str::<JsonValue>(text).ok()?;
            &parsed
        }
        other => other,
    };
    match app_data.pointer("/routeProps/data/leadPortfolioId")? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keys a scraped lead page carries its `__APP_DATA` script under.
const APP_DATA_KEYS: &[&str] = &["__APP_DATA", "appData"];

pub(crate) fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lead id of an extracted document. Without a `leadPortfolioId` field the
/// embedded app data is consulted, and the id found there is written back
/// as `leadPortfolioId`. App data may arrive wrapped in a one-element list.
pub fn resolve_lead_portfolio_id(doc: &mut JsonMap<String, JsonValue>) -> Option<String> {
    if let Some(id) = doc.get("leadPortfolioId").and_then(id_text) {
        return Some(id);
    }
    let from_app_data = APP_DATA_KEYS.iter().find_map(|key| {
        let app_data = match doc.get(*key)? {
            JsonValue::Array(items) => items.first()?,
            other => other,
        };
        lead_portfolio_id_from_app_data(app_data)
    })?;
    for key in APP_DATA_KEYS {
        doc.remove(*key);
    }
    debug!(lead_id = %from_app_data, "lead id taken from app data");
    doc.insert("leadPortfolioId".to_string(), JsonValue::String(from_app_data.clone()));
    Some(from_app_data)
}

/// `"30D"` -> 30, `"2W"` -> 14, `"3M"` -> 90, `"1Y"` -> 365. Months and years are approximate.
pub fn parse_time_range_days(raw: &str) -> Option<i64> {
    let s = raw.trim().to_ascii_uppercase();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n = digits.parse::<i64>().ok()?;
    match unit.trim() {
        "" | "D" => Some(n),
        "W" => n.checked_mul(7),
        "M" => n.checked_mul(30),
        "Y" => n.checked_mul(365),
        _ => parse_duration_days(raw),
    }
}
