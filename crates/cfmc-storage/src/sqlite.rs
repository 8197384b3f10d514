use async_trait::async_trait;
use cfmc_core::{Row, TableSchema, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::{check_conflict_keys, SinkError, UpsertSink};

const DEFAULT_PAGE_SIZE: i64 = 1000;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Local SQLite store. Columns are declared without a type so values keep
/// the storage class they were written with.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
    page_size: i64,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub async fn connect(path: &str) -> Result<Self, SinkError> {
        let options = SqliteConnectOptions::new()
            .filename(path.trim_start_matches("sqlite://").trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        info!(path, "sqlite sink connected");
        Ok(Self::new(pool))
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_table(&self, schema: &TableSchema) -> Result<(), SinkError> {
        let columns = schema
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>();
        let keys = schema
            .key_fields
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            quote_ident(&schema.table),
            columns.join(", "),
            keys.join(", ")
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table = %schema.table, "table ensured");
        Ok(())
    }

    fn decode_row(table: &str, row: &SqliteRow) -> Result<Row, SinkError> {
        let decode_err = |reason: String| SinkError::Decode {
            table: table.to_string(),
            reason,
        };
        let mut out = Row::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let raw = row.try_get_raw(idx)?;
            let is_null = raw.is_null();
            let type_name = raw.type_info().name().to_string();
            let value = if is_null {
                Value::Null
            } else {
                match type_name.as_str() {
                    "INTEGER" => Value::Number(row.try_get::<i64, _>(idx)? as f64),
                    "REAL" => Value::Number(row.try_get::<f64, _>(idx)?),
                    "TEXT" => Value::Text(row.try_get::<String, _>(idx)?),
                    "BLOB" => {
                        let bytes = row.try_get::<Vec<u8>, _>(idx)?;
                        Value::Text(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    other => {
                        return Err(decode_err(format!(
                            "column {} has unsupported type {other}",
                            column.name()
                        )))
                    }
                }
            };
            out.set(column.name(), value);
        }
        Ok(out)
    }
}

#[async_trait]
impl UpsertSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn prepare(&self, schema: &TableSchema) -> Result<(), SinkError> {
        self.ensure_table(schema).await
    }

    async fn select_all(&self, table: &str, order_by: &[String]) -> Result<Vec<Row>, SinkError> {
        let order = if order_by.is_empty() {
            "rowid".to_string()
        } else {
            order_by
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!(
            "SELECT * FROM {} ORDER BY {} LIMIT ? OFFSET ?",
            quote_ident(table),
            order
        );

        let mut rows = Vec::new();
        let mut offset = 0i64;
        loop {
            let page = sqlx::query(&sql)
                .bind(self.page_size)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
            let fetched = page.len() as i64;
            for row in &page {
                rows.push(Self::decode_row(table, row)?);
            }
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        debug!(table, rows = rows.len(), "sqlite snapshot loaded");
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

        let conflict = conflict_keys
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let names = row.field_names().collect::<Vec<_>>();
            let updates = names
                .iter()
                .filter(|n| !conflict_keys.iter().any(|k| k == *n))
                .map(|n| format!("{0} = excluded.{0}", quote_ident(n)))
                .collect::<Vec<_>>();
            let on_conflict = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
                quote_ident(table),
                names
                    .iter()
                    .map(|n| quote_ident(n))
                    .collect::<Vec<_>>()
                    .join(", "),
                vec!["?"; names.len()].join(", "),
                conflict,
                on_conflict
            );

            let mut query = sqlx::query(&sql);
            for (_, value) in row.iter() {
                query = match value {
                    Value::Null => query.bind(Option::<String>::None),
                    Value::Number(n) => query.bind(*n),
                    Value::Text(s) => query.bind(s.clone()),
                };
            }
            // any failure drops `tx`, which rolls the whole batch back
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(table, rows = rows.len(), "sqlite upsert committed");
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfmc_core::etf_flow_schema;
    use tempfile::tempdir;

    async fn sink_in(dir: &std::path::Path) -> SqliteSink {
        let path = dir.join("cfmc.db");
        SqliteSink::connect(path.to_str().unwrap()).await.expect("connect")
    }

    fn etf_row(date: &str, total: f64) -> Row {
        Row::new()
            .with("date", date)
            .with("total_net_flow", total)
            .with("cumulated_total_flow", total)
            .with("created_at", "2024-01-01T00:00:00Z")
    }

    #[tokio::test]
    async fn upsert_then_select_round_trips_values() {
        let dir = tempdir().expect("tempdir");
        let schema = etf_flow_schema();
        let sink = sink_in(dir.path()).await.with_page_size(2);
        sink.prepare(&schema).await.unwrap();

        let rows = vec![
            etf_row("2024-01-02", -5.0),
            etf_row("2024-01-01", 10.0),
            etf_row("2024-01-03", 3.0),
        ];
        let written = sink
            .upsert(&schema.table, &rows, schema.conflict_keys())
            .await
            .unwrap();
        assert_eq!(written, 3);

        let back = sink
            .select_all(&schema.table, schema.conflict_keys())
            .await
            .unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].get("date"), &Value::Text("2024-01-01".into()));
        assert_eq!(back[1].get("total_net_flow"), &Value::Number(-5.0));
        assert!(back[2].get("ibit_flow").is_null());
    }

    #[tokio::test]
    async fn conflicting_key_updates_in_place() {
        let dir = tempdir().expect("tempdir");
        let schema = etf_flow_schema();
        let sink = sink_in(dir.path()).await;
        sink.prepare(&schema).await.unwrap();

        sink.upsert(&schema.table, &[etf_row("2024-01-01", 1.0)], schema.conflict_keys())
            .await
            .unwrap();
        sink.upsert(&schema.table, &[etf_row("2024-01-01", 2.0)], schema.conflict_keys())
            .await
            .unwrap();

        let back = sink
            .select_all(&schema.table, schema.conflict_keys())
            .await
            .unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].get("total_net_flow"), &Value::Number(2.0));
    }

    #[tokio::test]
    async fn failing_row_rolls_back_whole_batch() {
        let dir = tempdir().expect("tempdir");
        let schema = etf_flow_schema();
        let sink = sink_in(dir.path()).await;
        sink.prepare(&schema).await.unwrap();

        let bad = Row::new().with("date", "2024-01-02").with("no_such_column", 1.0);
        let err = sink
            .upsert(
                &schema.table,
                &[etf_row("2024-01-01", 1.0), bad],
                schema.conflict_keys(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Database(_)));

        let back = sink
            .select_all(&schema.table, schema.conflict_keys())
            .await
            .unwrap();
        assert!(back.is_empty());
    }

    #[tokio::test]
    async fn missing_conflict_key_is_rejected_before_writing() {
        let dir = tempdir().expect("tempdir");
        let schema = etf_flow_schema();
        let sink = sink_in(dir.path()).await;
        sink.prepare(&schema).await.unwrap();

        let err = sink
            .upsert(
                &schema.table,
                &[Row::new().with("total_net_flow", 1.0)],
                schema.conflict_keys(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::MissingConflictKey { .. }));
    }
}
