use async_trait::async_trait;
use cfmc_core::Row;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{check_conflict_keys, union_columns, SinkError, UpsertSink};

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub api_key: String,
}

/// Hosted Postgres reached through its PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct SupabaseSink {
    client: reqwest::Client,
    rest_base: Url,
    page_size: usize,
}

impl SupabaseSink {
    pub fn new(config: &SupabaseConfig) -> Result<Self, SinkError> {
        if config.api_key.trim().is_empty() {
            return Err(SinkError::Config("supabase api key is empty".to_string()));
        }
        let rest_base = Url::parse(config.url.trim_end_matches('/'))
            .and_then(|base| base.join("/rest/v1/"))
            .map_err(|err| SinkError::Config(format!("invalid supabase url {}: {err}", config.url)))?;

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| SinkError::Config("supabase api key is not a valid header".to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| SinkError::Config("supabase api key is not a valid header".to_string()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            rest_base,
            page_size: PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// `<base>/rest/v1/<table>` with the table name percent-encoded as one segment.
    pub fn table_url(&self, table: &str) -> Result<Url, SinkError> {
        let mut url = self.rest_base.clone();
        url.path_segments_mut()
            .map_err(|_| SinkError::Config(format!("{} cannot be a base url", self.rest_base)))?
            .pop_if_empty()
            .push(table);
        Ok(url)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SinkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Http {
            status: status.as_u16(),
            url,
            body,
        })
    }
}

#[async_trait]
impl UpsertSink for SupabaseSink {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn select_all(&self, table: &str, order_by: &[String]) -> Result<Vec<Row>, SinkError> {
        let url = self.table_url(table)?;
        let order = order_by
            .iter()
            .map(|c| format!("{c}.asc"))
            .collect::<Vec<_>>()
            .join(",");

        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut query = vec![
                ("select", "*".to_string()),
                ("offset", offset.to_string()),
                ("limit", self.page_size.to_string()),
            ];
            if !order.is_empty() {
                query.push(("order", order.clone()));
            }
            let resp = self.client.get(url.clone()).query(&query).send().await?;
            let page: JsonValue = Self::check(resp).await?.json().await?;
            let items = page.as_array().ok_or_else(|| SinkError::Decode {
                table: table.to_string(),
                reason: "expected a JSON array of rows".to_string(),
            })?;
            for item in items {
                let object = item.as_object().ok_or_else(|| SinkError::Decode {
                    table: table.to_string(),
                    reason: format!("row is not an object: {item}"),
                })?;
                rows.push(Row::from_json_object(object));
            }
            debug!(table, offset, fetched = items.len(), "supabase page");
            if items.len() < self.page_size {
                break;
            }
            offset += items.len();
        }
        Ok(rows)
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_keys: &[String],
    ) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }
        check_conflict_keys(table, rows, conflict_keys)?;

        let columns = union_columns(rows).join(",");
        let body = rows
            .iter()
            .map(|row| JsonValue::Object(row.to_json_object()))
            .collect::<Vec<_>>();
        let resp = self
            .client
            .post(self.table_url(table)?)
            .query(&[("on_conflict", conflict_keys.join(",")), ("columns", columns)])
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;

        info!(table, rows = rows.len(), "supabase upsert accepted");
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> SupabaseSink {
        SupabaseSink::new(&SupabaseConfig {
            url: "https://project.supabase.co/".to_string(),
            api_key: "anon-key".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn table_names_are_encoded_as_one_segment() {
        let url = sink().table_url("Bitcoin_ETF_Flow_US$m").unwrap();
        assert_eq!(url.path(), "/rest/v1/Bitcoin_ETF_Flow_US$m");
        let spaced = sink().table_url("my table").unwrap();
        assert_eq!(spaced.path(), "/rest/v1/my%20table");
    }

    #[test]
    fn empty_key_or_bad_url_is_config_error() {
        let err = SupabaseSink::new(&SupabaseConfig {
            url: "https://project.supabase.co".to_string(),
            api_key: " ".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));

        let err = SupabaseSink::new(&SupabaseConfig {
            url: "not a url".to_string(),
            api_key: "k".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[tokio::test]
    async fn missing_conflict_key_fails_before_any_request() {
        let err = sink()
            .upsert(
                "binance_spot_copy_traders",
                &[Row::new().with("user_id", "42")],
                &["user_id".to_string(), "created_date".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::MissingConflictKey { .. }));
    }
}
