//! Persisted-store sinks plus HTTP fetch and raw payload storage for CFMC.

use async_trait::async_trait;
use cfmc_core::{Row, TableSchema};
use thiserror::Error;

mod artifacts;
mod http;
mod memory;
mod sqlite;
mod supabase;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemorySink;
pub use sqlite::SqliteSink;
pub use supabase::{SupabaseConfig, SupabaseSink};

pub const CRATE_NAME: &str = "cfmc-storage";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Http { status: u16, url: String, body: String },
    #[error("could not decode rows of {table}: {reason}")]
    Decode { table: String, reason: String },
    #[error("row for {table} has no value for conflict key {field}")]
    MissingConflictKey { table: String, field: String },
    #[error("sink misconfigured: {0}")]
    Config(String),
}

/// Persisted store the reconciliation pass reads from and writes to.
///
/// `upsert` is all-or-nothing per call: a partially applied batch must come
/// back as an error.
#[async_trait]
pub trait UpsertSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates whatever the backing store needs before the first read.
    async fn prepare(&self, _schema: &TableSchema) -> Result<(), SinkError> {
        Ok(())
    }

    /// Every row of `table`, reassembled from however many pages the store needs.
    async fn select_all(&self, table: &str, order_by: &[String]) -> Result<Vec<Row>, SinkError>;

    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_keys: &[String],
    ) -> Result<usize, SinkError>;
}

/// Fails fast before anything is written when a row lacks a conflict key.
pub(crate) fn check_conflict_keys(
    table: &str,
    rows: &[Row],
    conflict_keys: &[String],
) -> Result<(), SinkError> {
    if conflict_keys.is_empty() {
        return Err(SinkError::Config(format!("no conflict keys given for {table}")));
    }
    for row in rows {
        if let Some(field) = conflict_keys.iter().find(|k| row.get(k).is_null()) {
            return Err(SinkError::MissingConflictKey {
                table: table.to_string(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// Union of field names across `rows`, in first-seen order.
pub(crate) fn union_columns(rows: &[Row]) -> Vec<String> {
    let mut cols: Vec<String> = Vec::new();
    for row in rows {
        for name in row.field_names() {
            if !cols.iter().any(|c| c == name) {
                cols.push(name.to_string());
            }
        }
    }
    cols
}
