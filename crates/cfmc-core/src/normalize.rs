//! Field-level parsing of scraped text and loosely typed JSON scalars.
//!
//! Every function here is pure and never fails loudly: unparsable input
//! resolves to `None` (or `0.0` under [`NumberPolicy::Flow`]) and is logged
//! at debug level only.

use chrono::NaiveDate;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

/// Ordered list tried by [`parse_date`] when the caller has no better list.
pub const DEFAULT_DATE_FORMATS: &[&str] = &[
    "%d %b %Y",
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
];

const PLACEHOLDER_TOKENS: &[&str] = &["-", "\u{2013}", "\u{2014}", "N/A", "n/a", "NA", "na"];

const UNIT_TOKENS: &[&str] = &["US$m", "US$", "USM", "USDT", "usdt"];

/// How blank cells and placeholder tokens are read. Chosen by the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberPolicy {
    /// Flow columns: "no value" means nothing moved, so it reads as `0.0`.
    Flow,
    /// Any other metric: "no value" stays unknown.
    Generic,
}

impl NumberPolicy {
    fn missing(self) -> Option<f64> {
        match self {
            NumberPolicy::Flow => Some(0.0),
            NumberPolicy::Generic => None,
        }
    }
}

pub fn parse_number(raw: &str, policy: NumberPolicy) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || PLACEHOLDER_TOKENS.contains(&trimmed) {
        return policy.missing();
    }

    let mut s = trimmed.to_string();
    if let Some(idx) = s.find("!(MISSING)") {
        s.truncate(idx);
    }
    let mut s = s.replace(['\u{2212}', '\u{2013}', '\u{2014}'], "-");
    for token in UNIT_TOKENS {
        s = s.replace(token, "");
    }
    let mut cleaned = s
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '%' | '+' | '\u{a0}') && !c.is_whitespace())
        .collect::<String>();

    if let Some(idx) = cleaned.find('/') {
        cleaned.truncate(idx);
    }

    let negative = cleaned.starts_with('(') && cleaned.ends_with(')') && cleaned.len() >= 2;
    if negative {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
    }

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(if negative { -v } else { v }),
        _ => {
            debug!(raw, "unparsable number");
            None
        }
    }
}

pub fn parse_json_number(value: &JsonValue, policy: NumberPolicy) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_number(s, policy),
        JsonValue::Null => policy.missing(),
        other => {
            debug!(value = %other, "non-scalar where a number was expected");
            None
        }
    }
}

pub fn parse_date(raw: &str, formats: &[&str]) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let parsed = formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok());
    if parsed.is_none() {
        debug!(raw, "no date format matched");
    }
    parsed
}

/// Accepts `"<N>D"` (e.g. `"30D"`, `"7 D"`) or a bare integer.
pub fn parse_duration_days(raw: &str) -> Option<i64> {
    let s = raw.trim();
    let body = s
        .strip_suffix(|c: char| matches!(c, 'd' | 'D'))
        .map(str::trim_end)
        .unwrap_or(s);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        debug!(raw, "not a day count");
        return None;
    }
    body.parse::<i64>().ok()
}

/// Canonical field name -> ordered alias list. Only the normalizer consults it.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: Vec<(String, Vec<String>)>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `aliases` for `canonical`. The canonical name itself is tried first.
    pub fn with(mut self, canonical: &str, aliases: &[&str]) -> Self {
        let mut names = vec![canonical.to_string()];
        names.extend(
            aliases
                .iter()
                .filter(|a| **a != canonical)
                .map(|a| a.to_string()),
        );
        self.entries.retain(|(name, _)| name != canonical);
        self.entries.push((canonical.to_string(), names));
        self
    }

    pub fn names_for<'a>(&'a self, canonical: &'a str) -> Vec<&'a str> {
        self.entries
            .iter()
            .find(|(name, _)| name == canonical)
            .map(|(_, names)| names.iter().map(String::as_str).collect())
            .unwrap_or_else(|| vec![canonical])
    }

    /// First alias present in `object` with a non-null value.
    pub fn resolve<'a>(
        &self,
        object: &'a JsonMap<String, JsonValue>,
        canonical: &str,
    ) -> Option<&'a JsonValue> {
        self.names_for(canonical)
            .into_iter()
            .filter_map(|name| object.get(name))
            .find(|v| !v.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parenthesized_values_are_negative() {
        assert_eq!(parse_number("(1,234.50)", NumberPolicy::Flow), Some(-1234.5));
        assert_eq!(parse_number("(56.1)", NumberPolicy::Generic), Some(-56.1));
    }

    #[test]
    fn placeholders_depend_on_policy() {
        assert_eq!(parse_number("N/A", NumberPolicy::Flow), Some(0.0));
        assert_eq!(parse_number("N/A", NumberPolicy::Generic), None);
        assert_eq!(parse_number("\u{2014}", NumberPolicy::Flow), Some(0.0));
        assert_eq!(parse_number("", NumberPolicy::Flow), Some(0.0));
        assert_eq!(parse_number("   ", NumberPolicy::Generic), None);
    }

    #[test]
    fn units_and_signs_are_stripped() {
        assert_eq!(parse_number("12.3%", NumberPolicy::Generic), Some(12.3));
        assert_eq!(parse_number("+1,024.75 USDT", NumberPolicy::Generic), Some(1024.75));
        assert_eq!(parse_number("\u{2212}35.2", NumberPolicy::Flow), Some(-35.2));
        assert_eq!(parse_number("US$m 410.0", NumberPolicy::Flow), Some(410.0));
        assert_eq!(parse_number("120/300", NumberPolicy::Generic), Some(120.0));
        assert_eq!(parse_number("42!(MISSING)", NumberPolicy::Generic), Some(42.0));
    }

    #[test]
    fn garbage_is_null_under_both_policies() {
        assert_eq!(parse_number("abc", NumberPolicy::Flow), None);
        assert_eq!(parse_number("%", NumberPolicy::Generic), None);
        assert_eq!(parse_number("inf", NumberPolicy::Generic), None);
    }

    #[test]
    fn json_scalars() {
        assert_eq!(parse_json_number(&json!(3.5), NumberPolicy::Generic), Some(3.5));
        assert_eq!(parse_json_number(&json!("7.25%"), NumberPolicy::Generic), Some(7.25));
        assert_eq!(parse_json_number(&JsonValue::Null, NumberPolicy::Flow), Some(0.0));
        assert_eq!(parse_json_number(&JsonValue::Null, NumberPolicy::Generic), None);
        assert_eq!(parse_json_number(&json!([1]), NumberPolicy::Flow), None);
    }

    #[test]
    fn dates_try_formats_in_order() {
        let expected = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        assert_eq!(parse_date("02 Jun 2025", DEFAULT_DATE_FORMATS), Some(expected));
        assert_eq!(parse_date("2025-06-02", DEFAULT_DATE_FORMATS), Some(expected));
        // day-first wins over month-first for ambiguous slashes
        assert_eq!(
            parse_date("03/04/2025", DEFAULT_DATE_FORMATS),
            NaiveDate::from_ymd_opt(2025, 4, 3)
        );
        assert_eq!(parse_date("Total", DEFAULT_DATE_FORMATS), None);
        assert_eq!(parse_date("2025-06-02", &["%d %b %Y"]), None);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_days("30D"), Some(30));
        assert_eq!(parse_duration_days("7 D"), Some(7));
        assert_eq!(parse_duration_days("180"), Some(180));
        assert_eq!(parse_duration_days("D"), None);
        assert_eq!(parse_duration_days(""), None);
        assert_eq!(parse_duration_days(" 30d "), Some(30));
    }

    #[test]
    fn durations_reject_leading_text() {
        assert_eq!(parse_duration_days("-5D"), None);
        assert_eq!(parse_duration_days("abc30"), None);
        assert_eq!(parse_duration_days("30DD"), None);
        assert_eq!(parse_duration_days("3 0D"), None);
    }

    #[test]
    fn aliases_resolve_first_non_null() {
        let table = AliasTable::new().with("roi", &["roiValue", "roiPercentage"]);
        let obj = json!({"roi": null, "roiPercentage": "12.5%", "roiValue": 11.0});
        let obj = obj.as_object().unwrap();
        assert_eq!(table.resolve(obj, "roi"), Some(&json!(11.0)));
        let only_pct = json!({"roiPercentage": "12.5%", "extra": 1});
        assert_eq!(
            table.resolve(only_pct.as_object().unwrap(), "roi"),
            Some(&json!("12.5%"))
        );
        assert_eq!(table.resolve(obj, "pnl"), None);
    }
}
