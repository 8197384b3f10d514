//! Core row model, natural keys and table schemas for CFMC.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub mod normalize;

pub const CRATE_NAME: &str = "cfmc-core";

/// Integers beyond this magnitude lose precision as `f64` and are kept as text.
const MAX_EXACT_F64_INT: u64 = 1 << 53;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Number(f64),
    Text(String),
}

static NULL: Value = Value::Null;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view that also accepts numeric text.
    pub fn as_number_lossy(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Value::Null => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Text(b.to_string()),
            JsonValue::Number(n) => {
                let big = n
                    .as_u64()
                    .map(|u| u > MAX_EXACT_F64_INT)
                    .or_else(|| n.as_i64().map(|i| i.unsigned_abs() > MAX_EXACT_F64_INT))
                    .unwrap_or(false);
                if big {
                    Value::Text(n.to_string())
                } else {
                    n.as_f64().map(Value::Number).unwrap_or(Value::Null)
                }
            }
            JsonValue::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Canonical row: field name -> typed value. Missing fields read as null.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn from_json_object(object: &JsonMap<String, JsonValue>) -> Self {
        Self {
            fields: object
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        }
    }

    pub fn to_json_object(&self) -> JsonMap<String, JsonValue> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// One component of a natural key. Variant order doubles as the cross-kind sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Int(i64),
    Date(NaiveDate),
    Text(String),
}

impl KeyPart {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e18 => Some(KeyPart::Int(*n as i64)),
            Value::Number(n) => Some(KeyPart::Text(n.to_string())),
            Value::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return None;
                }
                if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                    return Some(KeyPart::Date(date));
                }
                if s.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(i) = s.parse::<i64>() {
                        return Some(KeyPart::Int(i));
                    }
                }
                Some(KeyPart::Text(s.to_string()))
            }
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            KeyPart::Text(s) => f.write_str(s),
        }
    }
}

/// Ordered tuple identifying a row's real-world subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey(pub Vec<KeyPart>);

impl NaturalKey {
    pub fn date(date: NaiveDate) -> Self {
        Self(vec![KeyPart::Date(date)])
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(ToString::to_string).collect::<Vec<_>>();
        f.write_str(&parts.join("|"))
    }
}

/// Derived field computed as a running sum of `source` over the key-ordered series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningSum {
    pub field: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub key_fields: Vec<String>,
    /// Field carrying the series date, if the table is a dated series.
    #[serde(default)]
    pub date_field: Option<String>,
    #[serde(default)]
    pub measurement_fields: Vec<String>,
    #[serde(default)]
    pub derived: Vec<RunningSum>,
    /// Excluded from change comparison.
    #[serde(default)]
    pub audit_fields: Vec<String>,
}

impl TableSchema {
    pub fn key_of(&self, row: &Row) -> Option<NaturalKey> {
        self.key_fields
            .iter()
            .map(|field| KeyPart::from_value(row.get(field)))
            .collect::<Option<Vec<_>>>()
            .map(NaturalKey)
    }

    pub fn conflict_keys(&self) -> &[String] {
        &self.key_fields
    }

    pub fn is_key(&self, field: &str) -> bool {
        self.key_fields.iter().any(|f| f == field)
    }

    pub fn is_audit(&self, field: &str) -> bool {
        self.audit_fields.iter().any(|f| f == field)
    }

    pub fn is_derived(&self, field: &str) -> bool {
        self.derived.iter().any(|d| d.field == field)
    }

    /// The date field when it is the whole natural key.
    pub fn single_date_key(&self) -> Option<&str> {
        match (self.date_field.as_deref(), self.key_fields.as_slice()) {
            (Some(date), [only]) if only == date => Some(date),
            _ => None,
        }
    }

    /// Every declared column, keys first, without duplicates.
    pub fn columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let all = self
            .key_fields
            .iter()
            .chain(self.date_field.iter())
            .chain(self.measurement_fields.iter())
            .chain(self.derived.iter().map(|d| &d.field))
            .chain(self.audit_fields.iter());
        for name in all {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }
}

/// Farside ticker header -> persisted column.
pub const ETF_TICKER_FIELDS: &[(&str, &str)] = &[
    ("IBIT", "ibit_flow"),
    ("FBTC", "fbtc_flow"),
    ("BITB", "bitb_flow"),
    ("ARKB", "arkb_flow"),
    ("BTCO", "btco_flow"),
    ("EZBC", "ezbc_flow"),
    ("BRRR", "brrr_flow"),
    ("HODL", "hodl_flow"),
    ("BTCW", "btcw_flow"),
    ("GBTC", "gbtc_flow"),
];

pub const ETF_TOTAL_FIELD: &str = "total_net_flow";
pub const ETF_CUMULATIVE_FIELD: &str = "cumulated_total_flow";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn etf_flow_schema() -> TableSchema {
    let mut measurements = ETF_TICKER_FIELDS
        .iter()
        .map(|(_, field)| field.to_string())
        .collect::<Vec<_>>();
    measurements.push(ETF_TOTAL_FIELD.to_string());
    TableSchema {
        table: "Bitcoin_ETF_Flow_US$m".to_string(),
        key_fields: strings(&["date"]),
        date_field: Some("date".to_string()),
        measurement_fields: measurements,
        derived: vec![RunningSum {
            field: ETF_CUMULATIVE_FIELD.to_string(),
            source: ETF_TOTAL_FIELD.to_string(),
        }],
        audit_fields: strings(&["created_at", "updated_at"]),
    }
}

pub fn copy_trade_metrics_schema() -> TableSchema {
    TableSchema {
        table: "binance_spot_copy_trade".to_string(),
        key_fields: strings(&["lead_trader_id", "scraped_date", "performance_days"]),
        date_field: Some("scraped_date".to_string()),
        measurement_fields: strings(&[
            "ROI",
            "PnL_usdt",
            "copiers",
            "mock_copiers",
            "AUM_usdt",
            "Leading_Balance_usdt",
            "Copier_PnL_usdt",
            "Sharpe_Ratio",
            "MDD",
            "Win_Rate",
            "Win_Days",
        ]),
        derived: Vec::new(),
        audit_fields: strings(&["id", "created_at", "scraped_at"]),
    }
}

pub fn copy_traders_schema() -> TableSchema {
    TableSchema {
        table: "binance_spot_copy_traders".to_string(),
        key_fields: strings(&["user_id", "created_date"]),
        date_field: Some("created_date".to_string()),
        measurement_fields: strings(&["duration", "amount", "total_pnl", "total_roi"]),
        derived: Vec::new(),
        audit_fields: strings(&["created_at"]),
    }
}

pub fn builtin_schemas() -> Vec<TableSchema> {
    vec![
        etf_flow_schema(),
        copy_trade_metrics_schema(),
        copy_traders_schema(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_read_as_null() {
        let row = Row::new().with("date", "2024-01-01");
        assert!(row.get("ibit_flow").is_null());
        assert_eq!(row.get("date").as_text(), Some("2024-01-01"));
    }

    #[test]
    fn date_keys_sort_chronologically() {
        let schema = etf_flow_schema();
        let a = schema.key_of(&Row::new().with("date", "2024-02-01")).unwrap();
        let b = schema.key_of(&Row::new().with("date", "2024-10-01")).unwrap();
        assert!(a < b);
        assert!(schema.key_of(&Row::new()).is_none());
        assert!(schema.key_of(&Row::new().with("date", "  ")).is_none());
    }

    #[test]
    fn numeric_and_textual_ids_share_a_key() {
        let schema = copy_trade_metrics_schema();
        let from_text = Row::new()
            .with("lead_trader_id", "4458914342020236800")
            .with("scraped_date", "2024-05-01")
            .with("performance_days", 30.0);
        let json: JsonValue = serde_json::from_str(
            r#"{"lead_trader_id": 4458914342020236800, "scraped_date": "2024-05-01", "performance_days": 30}"#,
        )
        .unwrap();
        let from_json = Row::from_json_object(json.as_object().unwrap());
        assert_eq!(
            from_json.get("lead_trader_id"),
            &Value::Text("4458914342020236800".to_string())
        );
        assert_eq!(schema.key_of(&from_text), schema.key_of(&from_json));
    }

    #[test]
    fn schema_columns_are_deduplicated_and_keys_first() {
        let schema = etf_flow_schema();
        let cols = schema.columns();
        assert_eq!(cols.first().map(String::as_str), Some("date"));
        assert_eq!(cols.iter().filter(|c| c.as_str() == "date").count(), 1);
        assert!(cols.contains(&ETF_CUMULATIVE_FIELD.to_string()));
        assert_eq!(schema.single_date_key(), Some("date"));
        assert_eq!(copy_trade_metrics_schema().single_date_key(), None);
    }

    #[test]
    fn row_json_round_trip_keeps_nulls() {
        let row = Row::new()
            .with("date", "2024-01-01")
            .with("total_net_flow", 12.5)
            .with("note", Value::Null);
        let text = serde_json::to_string(&row).unwrap();
        assert_eq!(text, r#"{"date":"2024-01-01","note":null,"total_net_flow":12.5}"#);
        let back: Row = serde_json::from_str(&text).unwrap();
        assert_eq!(back, row);
    }
}
