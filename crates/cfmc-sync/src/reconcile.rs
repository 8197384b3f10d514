//! Merge a fresh batch into the persisted snapshot, recompute derived
//! series fields and keep only the rows that actually changed.

use std::collections::BTreeMap;

use cfmc_core::{NaturalKey, Row, TableSchema, Value};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::placeholder::PlaceholderHook;

/// Numbers are equal when `|a - b| <= max(rel * max(|a|, |b|), abs)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tolerance {
    pub rel: f64,
    pub abs: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { rel: 1e-9, abs: 1e-9 }
    }
}

impl Tolerance {
    pub fn approx_eq(&self, a: f64, b: f64) -> bool {
        if a == b {
            return true;
        }
        let scale = a.abs().max(b.abs());
        (a - b).abs() <= (self.rel * scale).max(self.abs)
    }
}

pub fn values_differ(a: &Value, b: &Value, tolerance: &Tolerance) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => false,
        (Value::Null, _) | (_, Value::Null) => true,
        (Value::Number(x), Value::Number(y)) => !tolerance.approx_eq(*x, *y),
        (Value::Number(x), text @ Value::Text(_)) | (text @ Value::Text(_), Value::Number(x)) => {
            match text.as_number_lossy() {
                Some(y) => !tolerance.approx_eq(*x, y),
                None => true,
            }
        }
        (Value::Text(s), Value::Text(t)) => s != t,
    }
}

/// Rows keyed by natural key. Keyless rows are dropped and counted.
#[derive(Debug, Clone, Default)]
pub struct KeyedRows {
    pub rows: BTreeMap<NaturalKey, Row>,
    pub skipped_without_key: usize,
    pub duplicate_keys: usize,
}

impl KeyedRows {
    /// Later rows win on duplicate keys.
    pub fn index(schema: &TableSchema, rows: &[Row]) -> Self {
        let mut out = KeyedRows::default();
        for row in rows {
            let Some(key) = schema.key_of(row) else {
                out.skipped_without_key += 1;
                continue;
            };
            if out.rows.insert(key, row.clone()).is_some() {
                out.duplicate_keys += 1;
            }
        }
        out
    }
}

/// Outcome of one reconciliation pass. Counts are for reporting only.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Persisted snapshot the pass compared against.
    pub existing: BTreeMap<NaturalKey, Row>,
    /// Whole merged series, key-ordered, derived fields recomputed.
    pub recomputed: BTreeMap<NaturalKey, Row>,
    /// Rows to persist, key-ordered.
    pub to_upload: Vec<Row>,
    pub new_rows: usize,
    pub changed_rows: usize,
    pub skipped_without_key: usize,
    pub duplicate_keys_in_batch: usize,
    /// Key of a synthesized gap-filling row, if one was added.
    pub placeholder: Option<NaturalKey>,
}

impl Reconciliation {
    pub fn upload_keys(&self, schema: &TableSchema) -> Vec<NaturalKey> {
        self.to_upload.iter().filter_map(|row| schema.key_of(row)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler<'a> {
    schema: &'a TableSchema,
    tolerance: Tolerance,
}

impl<'a> Reconciler<'a> {
    pub fn new(schema: &'a TableSchema) -> Self {
        Self {
            schema,
            tolerance: Tolerance::default(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn reconcile(&self, existing: &[Row], incoming: &[Row]) -> Reconciliation {
        let snapshot = KeyedRows::index(self.schema, existing);
        if snapshot.skipped_without_key > 0 || snapshot.duplicate_keys > 0 {
            warn!(
                table = %self.schema.table,
                keyless = snapshot.skipped_without_key,
                duplicates = snapshot.duplicate_keys,
                "persisted snapshot has rows that cannot be keyed uniquely"
            );
        }
        let batch = KeyedRows::index(self.schema, incoming);
        if batch.skipped_without_key > 0 {
            warn!(
                table = %self.schema.table,
                skipped = batch.skipped_without_key,
                "incoming rows without a natural key skipped"
            );
        }
        if batch.duplicate_keys > 0 {
            debug!(
                table = %self.schema.table,
                duplicates = batch.duplicate_keys,
                "duplicate keys in batch; last row wins"
            );
        }

        // incoming fields win; columns the batch does not carry keep their stored value,
        // matching what a conflict-key upsert leaves in place
        let mut combined = snapshot.rows.clone();
        for (key, row) in batch.rows {
            let merged = combined.entry(key).or_default();
            for (field, value) in row.iter() {
                merged.set(field, value.clone());
            }
        }
        let recomputed = self.recompute(combined);

        let mut to_upload = Vec::new();
        let (mut new_rows, mut changed_rows) = (0usize, 0usize);
        for (key, row) in &recomputed {
            match snapshot.rows.get(key) {
                None => {
                    new_rows += 1;
                    to_upload.push(row.clone());
                }
                Some(stored) if self.row_differs(row, stored) => {
                    changed_rows += 1;
                    to_upload.push(row.clone());
                }
                Some(_) => {}
            }
        }
        debug!(
            table = %self.schema.table,
            series = recomputed.len(),
            new_rows,
            changed_rows,
            "reconciled"
        );

        Reconciliation {
            existing: snapshot.rows,
            recomputed,
            to_upload,
            new_rows,
            changed_rows,
            skipped_without_key: batch.skipped_without_key,
            duplicate_keys_in_batch: batch.duplicate_keys,
            placeholder: None,
        }
    }

    /// Running sums restart at zero and fold in key order. Non-numeric sources count as zero.
    fn recompute(&self, mut series: BTreeMap<NaturalKey, Row>) -> BTreeMap<NaturalKey, Row> {
        for derived in &self.schema.derived {
            let mut running = 0.0;
            for row in series.values_mut() {
                running += row.get(&derived.source).as_number_lossy().unwrap_or(0.0);
                row.set(derived.field.clone(), running);
            }
        }
        series
    }

    fn row_differs(&self, candidate: &Row, stored: &Row) -> bool {
        candidate
            .field_names()
            .chain(stored.field_names())
            .filter(|field| !self.schema.is_audit(field))
            .any(|field| values_differ(candidate.get(field), stored.get(field), &self.tolerance))
    }
}

/// Reconciler then the placeholder hook: the single entry point for building an upload batch.
pub fn plan_upload(
    schema: &TableSchema,
    existing: &[Row],
    incoming: &[Row],
    hook: &dyn PlaceholderHook,
    today: NaiveDate,
) -> Reconciliation {
    let reconciliation = Reconciler::new(schema).reconcile(existing, incoming);
    hook.apply(schema, today, reconciliation)
}
