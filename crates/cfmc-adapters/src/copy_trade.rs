use async_trait::async_trait;
use cfmc_core::normalize::{parse_json_number, AliasTable, NumberPolicy};
use cfmc_core::{copy_trade_metrics_schema, Row, TableSchema, Value};
use cfmc_storage::HttpFetcher;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::{info, warn};

use crate::binance::{
    get_data, id_text, lead_id_from_url, parse_time_range_days, resolve_lead_portfolio_id,
    DEFAULT_TIME_RANGE, OVERVIEW_PATH, PERFORMANCE_PATH,
};
use crate::{
    documents, AdapterContext, AdapterError, Crawlability, FetchedPage, RawRecord, SourceAdapter,
    SourceTarget,
};

pub const SOURCE_ID: &str = "binance-copy-trade";

/// Persisted metric column -> payload names seen across endpoint versions.
const METRIC_ALIASES: &[(&str, &[&str])] = &[
    ("ROI", &["roi", "roiValue", "roiPercentage"]),
    ("PnL_usdt", &["pnl", "pnlValue", "totalPnl"]),
    ("copiers", &["currentCopyCount", "copierCount", "copiers"]),
    ("mock_copiers", &["copyMockCount", "mockCopyCount", "mockCopiers"]),
    ("AUM_usdt", &["aumAmount", "aum"]),
    ("Leading_Balance_usdt", &["walletBalanceAmount", "leadingBalance", "marginBalance"]),
    ("Copier_PnL_usdt", &["copierPnl", "copierPnL", "copierPnlAmount"]),
    ("Sharpe_Ratio", &["sharpRatio", "sharpeRatio"]),
    ("MDD", &["mdd", "maxDrawdown"]),
    ("Win_Rate", &["winRate"]),
    ("Win_Days", &["winDays"]),
];

/// Per-lead spot copy-trading metrics for one performance window.
#[derive(Debug, Clone)]
pub struct CopyTradeMetricsAdapter {
    aliases: AliasTable,
}

impl Default for CopyTradeMetricsAdapter {
    fn default() -> Self {
        let aliases = METRIC_ALIASES
            .iter()
            .fold(AliasTable::new(), |table, (canonical, names)| table.with(canonical, names));
        Self { aliases }
    }
}

#[async_trait]
impl SourceAdapter for CopyTradeMetricsAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    fn schema(&self) -> TableSchema {
        copy_trade_metrics_schema()
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
            let time_range = lead
                .time_range
                .clone()
                .unwrap_or_else(|| DEFAULT_TIME_RANGE.to_string());

            let overview = get_data(
                http,
                ctx,
                SOURCE_ID,
                OVERVIEW_PATH,
                &[("leadPortfolioId".to_string(), lead.lead_id.clone())],
            )
            .await?;
            let performance = get_data(
                http,
                ctx,
                SOURCE_ID,
                PERFORMANCE_PATH,
                &[
                    ("portfolioId".to_string(), lead.lead_id.clone()),
                    ("timeRange".to_string(), time_range.clone()),
                ],
            )
            .await?;
            if !overview.is_object() || !performance.is_object() {
                return Err(AdapterError::Structure {
                    url: target.url.clone(),
                    reason: "overview or performance payload is not an object".to_string(),
                });
            }

            info!(lead_id = %lead.lead_id, %time_range, "copy-trade metrics fetched");
            let doc = json!({
                "leadPortfolioId": lead.lead_id,
                "timeRange": time_range,
                "overview": overview,
                "performance": performance,
            });
            pages.push(FetchedPage::json(&target.url, &doc, ctx.fetched_at));
        }
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> Result<Vec<RawRecord>, AdapterError> {
        let mut records = Vec::new();
        for mut doc in documents(page)? {
            if resolve_lead_portfolio_id(&mut doc).is_none() {
                warn!(url = %page.url, "document without leadPortfolioId skipped");
                continue;
            }
            records.push(RawRecord::new(SOURCE_ID, page.fetched_at, doc));
        }
        if records.is_empty() {
            return Err(AdapterError::Structure {
                url: page.url.clone(),
                reason: "no lead documents".to_string(),
            });
        }
        Ok(records)
    }

    fn normalize(&self, record: &RawRecord, ctx: &AdapterContext) -> Option<Row> {
        let lead_id = record.get("leadPortfolioId").and_then(id_text)?;
        let performance_days = record
            .get("timeRange")
            .and_then(JsonValue::as_str)
            .and_then(parse_time_range_days)
            .or_else(|| {
                record
                    .get("performanceDays")
                    .and_then(|v| parse_json_number(v, NumberPolicy::Generic))
                    .map(|d| d as i64)
            })
            .or_else(|| parse_time_range_days(DEFAULT_TIME_RANGE))?;

        // performance wins over overview where both carry a field
        let mut merged: JsonMap<String, JsonValue> = record.object("overview").cloned().unwrap_or_default();
        if let Some(performance) = record.object("performance") {
            merged.extend(performance.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut row = Row::new()
            .with("lead_trader_id", lead_id)
            .with("scraped_date", ctx.run_date.format("%Y-%m-%d").to_string())
            .with("performance_days", performance_days)
            .with("scraped_at", record.fetched_at.to_rfc3339());
        for (column, _) in METRIC_ALIASES {
            let value = self
                .aliases
                .resolve(&merged, column)
                .and_then(|v| parse_json_number(v, NumberPolicy::Generic));
            row.set(*column, Value::from(value));
        }
        Some(row)
    }
}
