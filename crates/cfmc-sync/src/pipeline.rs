use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cfmc_adapters::{adapter_for_source, load_fixture_pages, AdapterContext, AdapterError, FetchedPage, SourceAdapter};
use cfmc_core::{Row, TableSchema};
use cfmc_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, MemorySink, SinkError, SqliteSink, SupabaseConfig,
    SupabaseSink, UpsertSink,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::placeholder::{PlaceholderHook, YesterdayPlaceholder};
use crate::reconcile::plan_upload;
use crate::{SinkKind, SourceConfig, SourceMode, SourceRegistry, SyncConfig, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Run date; also the reference point for the gap-filling hook.
    pub today: NaiveDate,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    /// Restrict the run to these source ids.
    pub sources: Option<Vec<String>>,
    pub dry_run: bool,
}

impl RunOptions {
    pub fn for_date(today: NaiveDate) -> Self {
        Self {
            today,
            since: None,
            until: None,
            sources: None,
            dry_run: false,
        }
    }

    pub fn for_today() -> Self {
        Self::for_date(Utc::now().date_naive())
    }

    fn wants(&self, source_id: &str) -> bool {
        self.sources
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == source_id))
    }

    fn in_range(&self, date: NaiveDate) -> bool {
        self.since.map_or(true, |since| date >= since) && self.until.map_or(true, |until| date <= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Synced,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportedError {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub table: String,
    pub status: SourceStatus,
    pub pages: usize,
    pub raw_records: usize,
    pub normalized_rows: usize,
    pub out_of_range_rows: usize,
    pub existing_rows: usize,
    /// Rows the reconciliation planned to write.
    pub uploaded_rows: usize,
    /// Rows the sink acknowledged; zero on dry runs.
    pub written_rows: usize,
    pub new_rows: usize,
    pub changed_rows: usize,
    pub placeholder_date: Option<String>,
    pub error: Option<ReportedError>,
}

impl SourceReport {
    fn start(source_id: &str, table: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            table: table.to_string(),
            status: SourceStatus::Failed,
            pages: 0,
            raw_records: 0,
            normalized_rows: 0,
            out_of_range_rows: 0,
            existing_rows: 0,
            uploaded_rows: 0,
            written_rows: 0,
            new_rows: 0,
            changed_rows: 0,
            placeholder_date: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_date: NaiveDate,
    pub sink: String,
    pub dry_run: bool,
    pub sources: Vec<SourceReport>,
    pub reports_dir: String,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.sources.iter().any(|s| s.status == SourceStatus::Failed)
    }

    pub fn uploaded_rows(&self) -> usize {
        self.sources.iter().map(|s| s.uploaded_rows).sum()
    }
}

fn adapter_error(source_id: &str, err: AdapterError) -> SyncError {
    if err.is_source_unavailable() {
        SyncError::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: err.to_string(),
        }
    } else {
        SyncError::Adapter {
            source_id: source_id.to_string(),
            source: err,
        }
    }
}

fn sink_error(sink: &dyn UpsertSink, table: &str) -> impl FnOnce(SinkError) -> SyncError {
    let sink = sink.name().to_string();
    let table = table.to_string();
    move |source| SyncError::Sink { sink, table, source }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "application/json" => "json",
        "text/html" => "html",
        _ => "bin",
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    sink: Arc<dyn UpsertSink>,
    artifact_store: ArtifactStore,
    http: HttpFetcher,
    placeholder: Box<dyn PlaceholderHook>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, sink: Arc<dyn UpsertSink>) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            proxy: config.http_proxy.clone(),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            sink,
            artifact_store,
            http,
            placeholder: Box::<YesterdayPlaceholder>::default(),
        })
    }

    pub fn with_placeholder(mut self, placeholder: Box<dyn PlaceholderHook>) -> Self {
        self.placeholder = placeholder;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One collection pass over every enabled source. Source failures are
    /// recorded in the summary; only registry and report I/O errors abort the run.
    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = SourceRegistry::load(&self.config.sources_path).await?;
        let ctx = AdapterContext::new(run_id, started_at, options.today);
        info!(%run_id, sink = self.sink.name(), today = %options.today, dry_run = options.dry_run, "sync run starting");

        let mut reports = Vec::new();
        let mut deltas = Vec::new();
        for source in registry.enabled().filter(|s| options.wants(&s.source_id)) {
            let span = info_span!("source", source_id = %source.source_id, mode = ?source.mode);
            let (report, uploaded) = self.sync_source(source, &ctx, options).instrument(span).await;
            deltas.push((report.source_id.clone(), report.table.clone(), uploaded));
            reports.push(report);
        }
        if reports.is_empty() {
            warn!(%run_id, "no enabled sources selected");
        }

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            run_date: options.today,
            sink: self.sink.name().to_string(),
            dry_run: options.dry_run,
            sources: reports,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary, &deltas).await?;
        info!(%run_id, failed = summary.failed(), uploaded = summary.uploaded_rows(), "sync run finished");
        Ok(summary)
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        ctx: &AdapterContext,
        options: &RunOptions,
    ) -> (SourceReport, Vec<Row>) {
        let Some(adapter) = adapter_for_source(&source.source_id) else {
            let err = SyncError::UnknownSource(source.source_id.clone());
            let mut report = SourceReport::start(&source.source_id, "");
            report.error = Some(ReportedError {
                kind: err.kind(),
                message: err.to_string(),
            });
            return (report, Vec::new());
        };
        let schema = adapter.schema();
        let mut report = SourceReport::start(&source.source_id, &schema.table);
        match self
            .collect_and_upload(adapter.as_ref(), &schema, source, ctx, options, &mut report)
            .await
        {
            Ok(uploaded) => {
                report.status = SourceStatus::Synced;
                info!(
                    table = %schema.table,
                    uploaded = report.uploaded_rows,
                    new = report.new_rows,
                    changed = report.changed_rows,
                    "source synced"
                );
                (report, uploaded)
            }
            Err(err) => {
                let kind = err.kind();
                let message = format!("{:#}", anyhow::Error::from(err));
                error!(kind, error = %message, "source failed");
                report.error = Some(ReportedError { kind, message });
                (report, Vec::new())
            }
        }
    }

    async fn collect_and_upload(
        &self,
        adapter: &dyn SourceAdapter,
        schema: &TableSchema,
        source: &SourceConfig,
        ctx: &AdapterContext,
        options: &RunOptions,
        report: &mut SourceReport,
    ) -> Result<Vec<Row>, SyncError> {
        let source_id = source.source_id.as_str();
        let pages = self.load_pages(adapter, source, ctx).await?;
        report.pages = pages.len();

        let mut rows = Vec::new();
        for page in &pages {
            let stored = self
                .artifact_store
                .store_bytes(page.fetched_at, source_id, extension_for(&page.content_type), &page.body)
                .await?;
            debug!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "raw page stored");

            let records = adapter.parse(page).map_err(|err| adapter_error(source_id, err))?;
            report.raw_records += records.len();
            rows.extend(records.iter().filter_map(|record| adapter.normalize(record, ctx)));
        }
        if report.raw_records == 0 {
            return Err(SyncError::SourceUnavailable {
                source_id: source_id.to_string(),
                reason: "no records found".to_string(),
            });
        }
        report.normalized_rows = rows.len();

        if let Some(date_field) = schema.date_field.as_deref() {
            let before = rows.len();
            rows.retain(|row| {
                row.get(date_field)
                    .as_text()
                    .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
                    .map_or(true, |date| options.in_range(date))
            });
            report.out_of_range_rows = before - rows.len();
        }

        let sink = self.sink.as_ref();
        sink.prepare(schema).await.map_err(sink_error(sink, &schema.table))?;
        let existing = sink
            .select_all(&schema.table, schema.conflict_keys())
            .await
            .map_err(sink_error(sink, &schema.table))?;
        report.existing_rows = existing.len();

        let plan = plan_upload(schema, &existing, &rows, self.placeholder.as_ref(), options.today);
        report.uploaded_rows = plan.to_upload.len();
        report.new_rows = plan.new_rows;
        report.changed_rows = plan.changed_rows;
        report.placeholder_date = plan.placeholder.as_ref().map(ToString::to_string);

        if options.dry_run {
            info!(rows = plan.to_upload.len(), "dry run; upload skipped");
        } else if !plan.to_upload.is_empty() {
            report.written_rows = sink
                .upsert(&schema.table, &plan.to_upload, schema.conflict_keys())
                .await
                .map_err(sink_error(sink, &schema.table))?;
        }
        Ok(plan.to_upload)
    }

    async fn load_pages(
        &self,
        adapter: &dyn SourceAdapter,
        source: &SourceConfig,
        ctx: &AdapterContext,
    ) -> Result<Vec<FetchedPage>, SyncError> {
        let pages = match source.mode {
            SourceMode::Fixture => {
                let dir = source.fixture_dir(&self.config.workspace_root);
                load_fixture_pages(&dir, ctx.fetched_at).map_err(|err| SyncError::SourceUnavailable {
                    source_id: source.source_id.clone(),
                    reason: format!("{err:#}"),
                })?
            }
            SourceMode::Live => adapter
                .fetch(&self.http, ctx, &source.source_targets())
                .await
                .map_err(|err| adapter_error(&source.source_id, err))?,
        };
        if pages.is_empty() {
            return Err(SyncError::SourceUnavailable {
                source_id: source.source_id.clone(),
                reason: "nothing fetched".to_string(),
            });
        }
        Ok(pages)
    }

    async fn write_reports(
        &self,
        reports_dir: &Path,
        summary: &RunSummary,
        deltas: &[(String, String, Vec<Row>)],
    ) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        for (source_id, table, rows) in deltas {
            let body = serde_json::to_vec_pretty(&json!({
                "run_id": summary.run_id,
                "source_id": source_id,
                "table": table,
                "rows": rows,
            }))
            .with_context(|| format!("serializing {source_id} delta"))?;
            let path = reports_dir.join(format!("{source_id}_delta.json"));
            fs::write(&path, body)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }

        let body = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("summary.json"), body)
            .await
            .context("writing summary.json")?;
        Ok(())
    }

    /// Scheduler running `run_once` for the current date on `sync_cron`, if enabled.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&RunOptions::for_today()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync aborted"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Opens the sink named by `config.sink`.
pub async fn sink_from_config(config: &SyncConfig) -> Result<Arc<dyn UpsertSink>> {
    let sink: Arc<dyn UpsertSink> = match config.sink {
        SinkKind::Sqlite => Arc::new(
            SqliteSink::connect(&config.database_url)
                .await
                .with_context(|| format!("opening sqlite database {}", config.database_url))?,
        ),
        SinkKind::Supabase => {
            let (Some(url), Some(api_key)) = (config.supabase_url.clone(), config.supabase_key.clone()) else {
                bail!("supabase sink needs SUPABASE_URL and SUPABASE_KEY");
            };
            Arc::new(SupabaseSink::new(&SupabaseConfig { url, api_key })?)
        }
        SinkKind::Memory => Arc::new(MemorySink::new()),
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cfmc_core::Value;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn fixtures_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    fn write_registry(dir: &Path, entries: &[(&str, &str, String)]) {
        let mut text = String::from("sources:\n");
        for (source_id, crawlability, input_dir) in entries {
            text.push_str(&format!(
                "  - source_id: {source_id}\n    display_name: {source_id}\n    enabled: true\n    crawlability: {crawlability}\n    mode: fixture\n    input_dir: {input_dir}\n"
            ));
        }
        std::fs::write(dir.join("sources.yaml"), text).unwrap();
    }

    fn fixture(source_id: &str) -> String {
        fixtures_root().join(source_id).join("sample").display().to_string()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn pipeline(dir: &TempDir, sink: Arc<dyn UpsertSink>) -> SyncPipeline {
        SyncPipeline::new(SyncConfig::for_workspace(dir.path()), sink).unwrap()
    }

    #[tokio::test]
    async fn etf_fixture_syncs_then_becomes_a_no_op() {
        let dir = TempDir::new().unwrap();
        write_registry(dir.path(), &[("farside-btc-etf", "ExtractedTable", fixture("farside-btc-etf"))]);
        let sink = Arc::new(MemorySink::new());
        let pipeline = pipeline(&dir, sink.clone());
        let options = RunOptions::for_date(date(2025, 6, 5));

        let first = pipeline.run_once(&options).await.unwrap();
        assert!(!first.failed());
        let report = &first.sources[0];
        assert_eq!(report.uploaded_rows, 3);
        assert_eq!(report.written_rows, 3);
        assert_eq!(report.new_rows, 3);
        assert!(report.placeholder_date.is_none());

        let stored = sink.select_all("Bitcoin_ETF_Flow_US$m", &[]).await.unwrap();
        let cumulated = stored
            .iter()
            .map(|r| r.get("cumulated_total_flow").as_f64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(cumulated, [212.0, 112.0, 1152.0]);

        let second = pipeline.run_once(&options).await.unwrap();
        assert_eq!(second.sources[0].uploaded_rows, 0);
        assert_eq!(second.sources[0].existing_rows, 3);

        let summary_path = PathBuf::from(&second.reports_dir).join("summary.json");
        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(summary_path).unwrap()).unwrap();
        assert_eq!(summary["sources"][0]["status"], "synced");
        assert!(PathBuf::from(&first.reports_dir).join("farside-btc-etf_delta.json").exists());
    }

    #[tokio::test]
    async fn stale_series_gets_a_placeholder_for_yesterday() {
        let dir = TempDir::new().unwrap();
        write_registry(dir.path(), &[("farside-btc-etf", "ExtractedTable", fixture("farside-btc-etf"))]);
        let sink = Arc::new(MemorySink::new());
        let summary = pipeline(&dir, sink.clone())
            .run_once(&RunOptions::for_date(date(2025, 6, 10)))
            .await
            .unwrap();

        let report = &summary.sources[0];
        assert_eq!(report.uploaded_rows, 4);
        assert_eq!(report.placeholder_date.as_deref(), Some("2025-06-09"));
        let stored = sink.select_all("Bitcoin_ETF_Flow_US$m", &[]).await.unwrap();
        let last = stored.last().unwrap();
        assert_eq!(last.get("date").as_text(), Some("2025-06-09"));
        assert_eq!(last.get("total_net_flow"), &Value::Number(0.0));
        assert_eq!(last.get("cumulated_total_flow"), &Value::Number(1152.0));
    }

    #[tokio::test]
    async fn date_range_and_dry_run_limit_the_write() {
        let dir = TempDir::new().unwrap();
        write_registry(dir.path(), &[("farside-btc-etf", "ExtractedTable", fixture("farside-btc-etf"))]);
        let sink = Arc::new(MemorySink::new());
        let options = RunOptions {
            since: Some(date(2025, 6, 3)),
            until: Some(date(2025, 6, 3)),
            dry_run: true,
            ..RunOptions::for_date(date(2025, 6, 4))
        };
        let summary = pipeline(&dir, sink.clone()).run_once(&options).await.unwrap();

        let report = &summary.sources[0];
        assert_eq!(report.out_of_range_rows, 2);
        assert_eq!(report.uploaded_rows, 1);
        assert_eq!(report.written_rows, 0);
        assert_eq!(sink.len("Bitcoin_ETF_Flow_US$m").await, 0);
    }

    #[tokio::test]
    async fn copy_trade_fixture_round_trips_through_sqlite() {
        let dir = TempDir::new().unwrap();
        write_registry(dir.path(), &[("binance-copy-trade", "Api", fixture("binance-copy-trade"))]);
        let db = dir.path().join("cfmc.db");
        let sink = Arc::new(SqliteSink::connect(&db.display().to_string()).await.unwrap());
        let pipeline = pipeline(&dir, sink);
        let options = RunOptions::for_date(date(2025, 6, 5));

        let first = pipeline.run_once(&options).await.unwrap();
        assert!(!first.failed(), "{:?}", first.sources[0].error);
        assert_eq!(first.sources[0].written_rows, 2);
        assert!(first.sources[0].placeholder_date.is_none());

        let second = pipeline.run_once(&options).await.unwrap();
        assert_eq!(second.sources[0].existing_rows, 2);
        assert_eq!(second.sources[0].uploaded_rows, 0);
    }

    #[tokio::test]
    async fn missing_source_is_reported_and_others_still_run() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nowhere").display().to_string();
        write_registry(
            dir.path(),
            &[
                ("binance-copy-traders", "Api", missing),
                ("farside-btc-etf", "ExtractedTable", fixture("farside-btc-etf")),
            ],
        );
        let summary = pipeline(&dir, Arc::new(MemorySink::new()))
            .run_once(&RunOptions::for_date(date(2025, 6, 5)))
            .await
            .unwrap();

        assert!(summary.failed());
        let failed = &summary.sources[0];
        assert_eq!(failed.status, SourceStatus::Failed);
        assert_eq!(failed.error.as_ref().map(|e| e.kind), Some("source_unavailable"));
        assert_eq!(summary.sources[1].status, SourceStatus::Synced);
    }

    struct BrokenSink;

    #[async_trait]
    impl UpsertSink for BrokenSink {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn select_all(&self, _table: &str, _order_by: &[String]) -> Result<Vec<Row>, SinkError> {
            Ok(Vec::new())
        }

        async fn upsert(&self, table: &str, _rows: &[Row], _keys: &[String]) -> Result<usize, SinkError> {
            Err(SinkError::Http {
                status: 503,
                url: format!("https://example.invalid/rest/v1/{table}"),
                body: "unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn sink_failure_marks_the_source_failed() {
        let dir = TempDir::new().unwrap();
        write_registry(dir.path(), &[("binance-copy-traders", "Api", fixture("binance-copy-traders"))]);
        let summary = pipeline(&dir, Arc::new(BrokenSink))
            .run_once(&RunOptions::for_date(date(2025, 6, 5)))
            .await
            .unwrap();

        assert!(summary.failed());
        let error = summary.sources[0].error.as_ref().unwrap();
        assert_eq!(error.kind, "sink");
        assert!(error.message.contains("503"), "{}", error.message);
    }
}
