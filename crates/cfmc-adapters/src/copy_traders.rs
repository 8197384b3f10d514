use async_trait::async_trait;
use cfmc_core::normalize::{parse_duration_days, parse_json_number, AliasTable, NumberPolicy};
use cfmc_core::{copy_traders_schema, Row, TableSchema};
use cfmc_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::binance::{
    extract_records, lead_id_from_url, paginate, resolve_lead_portfolio_id, unwrap_envelope,
    COPY_TRADERS_PATH, DEFAULT_PAGE_SIZE,
};
use crate::{
    documents, AdapterContext, AdapterError, Crawlability, FetchedPage, RawRecord, SourceAdapter,
    SourceTarget,
};

pub const SOURCE_ID: &str = "binance-copy-traders";

/// Copiers currently following a lead portfolio.
#[derive(Debug, Clone)]
pub struct CopyTradersAdapter {
    aliases: AliasTable,
    page_size: usize,
}

impl Default for CopyTradersAdapter {
    fn default() -> Self {
        Self {
            aliases: AliasTable::new()
                .with("user_id", &["uid", "userId"])
                .with("duration", &["days", "copyDuration"])
                .with("amount", &["copyAmount", "investAmount"])
                .with("total_pnl", &["totalPnl", "pnl"])
                .with("total_roi", &["totalRoi", "roi", "returnRate"]),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl CopyTradersAdapter {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn user_id(&self, record: &RawRecord) -> Option<String> {
        match self.aliases.resolve(&record.fields, "user_id")? {
            JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn duration_days(&self, record: &RawRecord) -> i64 {
        match self.aliases.resolve(&record.fields, "duration") {
            Some(JsonValue::Number(n)) => n.as_f64().map(|d| d as i64).unwrap_or(0),
            Some(JsonValue::String(s)) => parse_duration_days(s).unwrap_or(0),
            _ => 0,
        }
    }
}

#[async_trait]
impl SourceAdapter for CopyTradersAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    fn schema(&self) -> TableSchema {
        copy_traders_schema()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[SourceTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(targets.len());
        for target in targets {
            let lead = lead_id_from_url(&target.url).ok_or_else(|| {
                AdapterError::Message(format!("no lead id in target {}", target.url))
            })?;
            let traders = paginate(
                http,
                ctx,
                SOURCE_ID,
                COPY_TRADERS_PATH,
                &[("leadPortfolioId".to_string(), lead.lead_id.clone())],
                self.page_size,
            )
            .await?;
            info!(lead_id = %lead.lead_id, traders = traders.len(), "copy traders fetched");
            let doc = json!({"leadPortfolioId": lead.lead_id, "traders": traders});
            pages.push(FetchedPage::json(&target.url, &doc, ctx.fetched_at));
        }
        Ok(pages)
    }

    /// Accepts fetched `{leadPortfolioId, traders}` documents and raw API pages.
    fn parse(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        let mut records = Vec::new();
        for mut doc in documents(page)? {
            resolve_lead_portfolio_id(&mut doc);
            let lead_id = doc.get("leadPortfolioId").cloned();
            let listed = doc.get("traders").and_then(JsonValue::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_object().cloned())
                    .collect::<Vec<_>>()
            });
            let traders = match listed {
                Some(traders) => traders,
                None => extract_records(&unwrap_envelope(&page.url, JsonValue::Object(doc))?),
            };
            for mut fields in traders {
                if let Some(lead_id) = &lead_id {
                    fields.entry("leadPortfolioId").or_insert_with(|| lead_id.clone());
                }
                records.push(RawRecord::new(SOURCE_ID, page.fetched_at, fields));
            }
        }
        debug!(url = %page.url, records = records.len(), "copy traders parsed");
        Ok(records)
    }

    fn normalize(&self, record: &RawRecord, ctx: &AdapterContext) -> Option<Row> {
        let Some(user_id) = self.user_id(record) else {
            debug!("copy trader without user id dropped");
            return None;
        };
        let number = |field: &str| {
            self.aliases
                .resolve(&record.fields, field)
                .and_then(|v| parse_json_number(v, NumberPolicy::Flow))
                .unwrap_or(0.0)
        };
        Some(
            Row::new()
                .with("user_id", user_id)
                .with("created_date", ctx.run_date.format("%Y-%m-%d").to_string())
                .with("duration", self.duration_days(record))
                .with("amount", number("amount"))
                .with("total_pnl", number("total_pnl"))
                .with("total_roi", number("total_roi"))
                .with("created_at", record.fetched_at.to_rfc3339()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfmc_core::Value;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn ctx() -> AdapterContext {
        AdapterContext::new(
            Uuid::nil(),
            Utc::now(),
            NaiveDate::from_ymd_opt(2025, 6, 4).unwrap(),
        )
    }

    #[test]
    fn raw_api_page_is_accepted() {
        let page = FetchedPage::json(
            "file://page_1.json",
            &json!({"code": "000000", "data": {"total": 2, "list": [
                {"userId": 1001, "copyAmount": "500.00", "totalPnl": "12.5", "totalRoi": "2.5%", "duration": "30D"},
                {"uid": "", "copyAmount": "1"}
            ]}}),
            Utc::now(),
        );
        let adapter = CopyTradersAdapter::default();
        let records = adapter.parse(&page).unwrap();
        assert_eq!(records.len(), 2);

        let rows = records
            .iter()
            .filter_map(|r| adapter.normalize(r, &ctx()))
            .collect::<Vec<_>>();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("user_id").as_text(), Some("1001"));
        assert_eq!(row.get("created_date").as_text(), Some("2025-06-04"));
        assert_eq!(row.get("duration"), &Value::Number(30.0));
        assert_eq!(row.get("amount"), &Value::Number(500.0));
        assert_eq!(row.get("total_roi"), &Value::Number(2.5));
    }

    #[test]
    fn missing_numbers_default_to_zero() {
        let page = FetchedPage::json(
            "file://lead.json",
            &json!({"leadPortfolioId": "77", "traders": [{"user_id": "abc"}]}),
            Utc::now(),
        );
        let adapter = CopyTradersAdapter::default();
        let records = adapter.parse(&page).unwrap();
        assert_eq!(records[0].get("leadPortfolioId"), Some(&json!("77")));
        let row = adapter.normalize(&records[0], &ctx()).unwrap();
        assert_eq!(row.get("duration"), &Value::Number(0.0));
        assert_eq!(row.get("total_pnl"), &Value::Number(0.0));
    }

    #[test]
    fn traders_inherit_lead_id_from_app_data() {
        let app_data = json!({"routeProps": {"data": {"leadPortfolioId": "4458914342020236800"}}});
        let page = FetchedPage::json(
            "file://lead.json",
            &json!({"appData": app_data, "traders": [{"userId": 7, "copyAmount": "10"}]}),
            Utc::now(),
        );
        let records = CopyTradersAdapter::default().parse(&page).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("leadPortfolioId"), Some(&json!("4458914342020236800")));
        assert!(records[0].get("appData").is_none());
    }

    #[test]
    fn api_error_envelope_surfaces() {
        let page = FetchedPage::json(
            "file://page_1.json",
            &json!({"code": "100001005", "message": "too many requests"}),
            Utc::now(),
        );
        let err = CopyTradersAdapter::default().parse(&page).unwrap_err();
        assert!(matches!(err, AdapterError::Api { .. }));
    }
}
