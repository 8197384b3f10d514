use std::path::PathBuf;

use cfmc_adapters::{adapter_for_source, load_fixture_pages, AdapterContext, SourceAdapter};
use cfmc_core::{Row, Value};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

fn fixture_dir(source_id: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(source_id)
        .join("sample")
}

fn fetched_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-05T01:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn ctx() -> AdapterContext {
    AdapterContext::new(
        Uuid::nil(),
        fetched_at(),
        NaiveDate::from_ymd_opt(2025, 6, 5).expect("date"),
    )
}

fn rows_for(source_id: &str) -> (Box<dyn SourceAdapter>, Vec<Row>) {
    let adapter = adapter_for_source(source_id).expect("adapter registered");
    let pages = load_fixture_pages(fixture_dir(source_id), fetched_at()).expect("fixture pages");
    assert!(!pages.is_empty(), "no fixture pages for {source_id}");
    let mut rows = Vec::new();
    for page in &pages {
        for record in adapter.parse(page).expect("parse fixture") {
            assert_eq!(record.source_id, source_id);
            rows.extend(adapter.normalize(&record, &ctx()));
        }
    }
    (adapter, rows)
}

fn num(row: &Row, field: &str) -> f64 {
    row.get(field)
        .as_f64()
        .unwrap_or_else(|| panic!("{field} is not a number: {:?}", row.get(field)))
}

#[test]
fn farside_table_fixture() {
    let (adapter, rows) = rows_for("farside-btc-etf");
    let schema = adapter.schema();
    assert_eq!(rows.len(), 3);

    let dates = rows
        .iter()
        .map(|r| r.get("date").as_text().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(dates, ["2025-06-02", "2025-06-03", "2025-06-04"]);

    assert_eq!(num(&rows[0], "ibit_flow"), 240.1);
    assert_eq!(num(&rows[0], "fbtc_flow"), -30.5);
    assert_eq!(num(&rows[0], "arkb_flow"), 0.0);
    assert_eq!(num(&rows[0], "gbtc_flow"), -10.0);
    assert_eq!(num(&rows[0], "total_net_flow"), 212.0);
    // zero total replaced by the sum of the ETF columns
    assert_eq!(num(&rows[1], "total_net_flow"), -100.0);
    assert_eq!(num(&rows[2], "fbtc_flow"), 15.5);
    assert_eq!(num(&rows[2], "total_net_flow"), 1040.0);

    for row in &rows {
        assert!(schema.key_of(row).is_some());
        for field in &schema.measurement_fields {
            assert!(row.get(field).as_f64().is_some(), "{field} must be numeric");
        }
        assert_eq!(row.get("created_at").as_text(), Some("2025-06-05T01:00:00+00:00"));
    }
}

#[test]
fn copy_trade_fixture() {
    let (adapter, rows) = rows_for("binance-copy-trade");
    let schema = adapter.schema();
    assert_eq!(rows.len(), 2);

    let first = &rows[0];
    assert_eq!(first.get("lead_trader_id").as_text(), Some("4458914342020236800"));
    assert_eq!(first.get("scraped_date").as_text(), Some("2025-06-05"));
    assert_eq!(num(first, "performance_days"), 30.0);
    assert_eq!(num(first, "ROI"), 12.5);
    assert_eq!(num(first, "copiers"), 120.0);
    assert_eq!(num(first, "AUM_usdt"), 1_234_567.89);
    assert_eq!(num(first, "Leading_Balance_usdt"), 50_000.5);
    assert_eq!(num(first, "Copier_PnL_usdt"), -35.2);
    assert_eq!(num(first, "Win_Days"), 18.0);

    let second = &rows[1];
    assert_eq!(num(second, "performance_days"), 7.0);
    assert_eq!(num(second, "ROI"), -3.2);
    assert_eq!(num(second, "PnL_usdt"), -64.0);
    assert_eq!(second.get("MDD"), &Value::Null);
    assert_eq!(second.get("Win_Rate"), &Value::Null);

    assert_ne!(schema.key_of(first), schema.key_of(second));
}

#[test]
fn copy_traders_fixture() {
    let (adapter, rows) = rows_for("binance-copy-traders");
    let schema = adapter.schema();
    assert_eq!(rows.len(), 2, "trader without a user id is dropped");

    let first = &rows[0];
    assert_eq!(first.get("user_id").as_text(), Some("8841"));
    assert_eq!(num(first, "duration"), 45.0);
    assert_eq!(num(first, "amount"), 1500.0);
    assert_eq!(num(first, "total_pnl"), 42.1);
    assert_eq!(num(first, "total_roi"), 2.81);

    let second = &rows[1];
    assert_eq!(second.get("user_id").as_text(), Some("99312"));
    assert_eq!(num(second, "duration"), 3.0);
    assert_eq!(num(second, "total_pnl"), -12.5);
    assert_eq!(num(second, "total_roi"), -5.0);

    for row in &rows {
        assert_eq!(row.get("created_date").as_text(), Some("2025-06-05"));
        assert!(schema.key_of(row).is_some());
    }
}
