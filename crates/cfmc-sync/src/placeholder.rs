//! Gap filling for daily series.
//!
//! "No data for yesterday" is read as "nothing flowed yesterday", which is a
//! business rule for the ETF flow table. It lives behind [`PlaceholderHook`]
//! so callers can swap it out or turn it off.

use cfmc_core::{NaturalKey, Row, TableSchema};
use chrono::{Days, NaiveDate, Utc};
use tracing::info;

use crate::reconcile::Reconciliation;

pub trait PlaceholderHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, schema: &TableSchema, today: NaiveDate, plan: Reconciliation) -> Reconciliation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPlaceholder;

impl PlaceholderHook for NoopPlaceholder {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn apply(&self, _schema: &TableSchema, _today: NaiveDate, plan: Reconciliation) -> Reconciliation {
        plan
    }
}

/// Adds one zero-flow row for yesterday when neither the batch nor the store has one.
///
/// Only applies to tables keyed by their date alone. The row carries every
/// running total forward, zeroes the measurements and stamps `timestamp_fields`
/// with the current time.
#[derive(Debug, Clone)]
pub struct YesterdayPlaceholder {
    pub timestamp_fields: Vec<String>,
}

impl Default for YesterdayPlaceholder {
    fn default() -> Self {
        Self {
            timestamp_fields: vec!["created_at".to_string(), "updated_at".to_string()],
        }
    }
}

impl YesterdayPlaceholder {
    /// Last running total at or before `cutoff`; then the newest stored value; then zero.
    fn carried_total(plan: &Reconciliation, field: &str, cutoff: &NaturalKey) -> f64 {
        plan.recomputed
            .range(..=cutoff.clone())
            .next_back()
            .and_then(|(_, row)| row.get(field).as_number_lossy())
            .or_else(|| {
                plan.existing
                    .values()
                    .next_back()
                    .and_then(|row| row.get(field).as_number_lossy())
            })
            .unwrap_or(0.0)
    }

    /// Measurement columns present on the newest row at or before `cutoff`.
    /// Falls back to the configured list when there is no such row.
    fn zeroed_fields(schema: &TableSchema, plan: &Reconciliation, cutoff: &NaturalKey) -> Vec<String> {
        let template = plan
            .recomputed
            .range(..=cutoff.clone())
            .next_back()
            .or_else(|| plan.existing.range(..=cutoff.clone()).next_back())
            .map(|(_, row)| row);
        let fields = template
            .map(|row| {
                row.field_names()
                    .filter(|f| schema.measurement_fields.iter().any(|m| m == f))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if fields.is_empty() {
            schema.measurement_fields.clone()
        } else {
            fields
        }
    }
}

impl PlaceholderHook for YesterdayPlaceholder {
    fn name(&self) -> &'static str {
        "yesterday"
    }

    fn apply(&self, schema: &TableSchema, today: NaiveDate, mut plan: Reconciliation) -> Reconciliation {
        let Some(date_field) = schema.single_date_key() else {
            return plan;
        };
        let Some(yesterday) = today.checked_sub_days(Days::new(1)) else {
            return plan;
        };
        let today_key = NaturalKey::date(today);
        let yesterday_key = NaturalKey::date(yesterday);

        let uploading_recent = plan
            .upload_keys(schema)
            .iter()
            .any(|k| *k == today_key || *k == yesterday_key);
        if uploading_recent || plan.existing.contains_key(&yesterday_key) {
            return plan;
        }

        let mut row = Row::new().with(date_field, yesterday.format("%Y-%m-%d").to_string());
        for field in Self::zeroed_fields(schema, &plan, &yesterday_key) {
            row.set(field, 0.0);
        }
        for derived in &schema.derived {
            let carried = Self::carried_total(&plan, &derived.field, &yesterday_key);
            row.set(derived.field.clone(), carried);
        }
        let now = Utc::now().to_rfc3339();
        for field in &self.timestamp_fields {
            row.set(field.clone(), now.clone());
        }

        info!(table = %schema.table, %yesterday, "no data for yesterday; adding zero-flow placeholder");
        plan.to_upload.push(row);
        plan.to_upload
            .sort_by_cached_key(|r| schema.key_of(r).unwrap_or_else(|| NaturalKey(Vec::new())));
        plan.new_rows += 1;
        plan.placeholder = Some(yesterday_key);
        plan
    }
}
