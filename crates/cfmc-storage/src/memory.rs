use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use cfmc_core::{KeyPart, NaturalKey, Row};
use tokio::sync::Mutex;

use crate::{check_conflict_keys, SinkError, UpsertSink};

/// In-process tables for dry runs and tests. Upserts merge fields into the
/// stored row the same way `ON CONFLICT DO UPDATE` does.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, BTreeMap<NaturalKey, Row>>>,
}

fn key_for(row: &Row, conflict_keys: &[String]) -> Option<NaturalKey> {
    conflict_keys
        .iter()
        .map(|k| KeyPart::from_value(row.get(k)))
        .collect::<Option<Vec<_>>>()
        .map(NaturalKey)
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, table: &str, rows: Vec<Row>, conflict_keys: &[String]) {
        let mut tables = self.tables.lock().await;
        let entries = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(key) = key_for(&row, conflict_keys) {
                entries.insert(key, row);
            }
        }
    }

    pub async fn len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl UpsertSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn select_all(&self, table: &str, _order_by: &[String]) -> Result<Vec<Row>, SinkError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
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
        let keyed = rows
            .iter()
            .map(|row| {
                key_for(row, conflict_keys)
                    .map(|key| (key, row))
                    .ok_or_else(|| SinkError::Decode {
                        table: table.to_string(),
                        reason: "conflict key value cannot form a key".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = self.tables.lock().await;
        let entries = tables.entry(table.to_string()).or_default();
        for (key, row) in keyed {
            let stored = entries.entry(key).or_default();
            for (name, value) in row.iter() {
                stored.set(name, value.clone());
            }
        }
        Ok(rows.len())
    }
}
