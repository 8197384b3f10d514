use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use cfmc_core::builtin_schemas;
use cfmc_storage::SqliteSink;
use cfmc_sync::{sink_from_config, RunOptions, SinkKind, SyncConfig, SyncPipeline};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cfmc-cli")]
#[command(about = "Crypto flow metrics collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect every enabled source once and upsert what changed.
    Sync(SyncArgs),
    /// Run `sync` on the configured cron until interrupted.
    Schedule(SinkArgs),
    /// Create the built-in tables in the SQLite database.
    Migrate(SinkArgs),
}

#[derive(Debug, Args, Default)]
struct SinkArgs {
    #[arg(long)]
    sink: Option<SinkKind>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    supabase_url: Option<String>,
    #[arg(long)]
    supabase_key: Option<String>,
    /// Source registry file.
    #[arg(long)]
    sources: Option<PathBuf>,
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    #[command(flatten)]
    sink: SinkArgs,
    /// Drop rows dated before this day (YYYY-MM-DD).
    #[arg(long)]
    since: Option<NaiveDate>,
    #[arg(long)]
    until: Option<NaiveDate>,
    /// Run date; defaults to today in UTC.
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Only run these source ids.
    #[arg(long = "source", value_delimiter = ',')]
    only: Vec<String>,
    /// Write the JSON summary here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
}

impl SinkArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(sink) = self.sink {
            config.sink = sink;
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(url) = &self.supabase_url {
            config.supabase_url = Some(url.clone());
        }
        if let Some(key) = &self.supabase_key {
            config.supabase_key = Some(key.clone());
        }
        if let Some(path) = &self.sources {
            config.sources_path = path.clone();
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn pipeline_for(args: &SinkArgs) -> Result<SyncPipeline> {
    let mut config = SyncConfig::from_env()?;
    args.apply(&mut config);
    let sink = sink_from_config(&config).await?;
    SyncPipeline::new(config, sink)
}

async fn sync(args: SyncArgs) -> Result<ExitCode> {
    let pipeline = pipeline_for(&args.sink).await?;
    let options = RunOptions {
        today: args.today.unwrap_or_else(|| Utc::now().date_naive()),
        since: args.since,
        until: args.until,
        sources: (!args.only.is_empty()).then(|| args.only.clone()),
        dry_run: args.dry_run,
    };
    let summary = pipeline.run_once(&options).await?;

    let body = serde_json::to_string_pretty(&summary).context("serializing run summary")?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, body)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "summary written");
        }
        None => println!("{body}"),
    }

    Ok(if summary.failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn schedule(args: SinkArgs) -> Result<ExitCode> {
    let pipeline = pipeline_for(&args).await?;
    let cron = pipeline.config().sync_cron.clone();
    let pipeline = Arc::new(pipeline);
    let Some(mut sched) = pipeline.build_scheduler().await? else {
        eprintln!("scheduler disabled; set CFMC_SCHEDULER_ENABLED=true");
        return Ok(ExitCode::FAILURE);
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}

async fn migrate(args: SinkArgs) -> Result<ExitCode> {
    let mut config = SyncConfig::from_env()?;
    args.apply(&mut config);
    if config.sink != SinkKind::Sqlite {
        eprintln!("migrate only manages the sqlite sink; tables for {:?} are managed outside", config.sink);
        return Ok(ExitCode::FAILURE);
    }
    let sink = SqliteSink::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    for schema in builtin_schemas() {
        sink.ensure_table(&schema)
            .await
            .with_context(|| format!("creating {}", schema.table))?;
        println!("ready: {}", schema.table);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await,
        Commands::Schedule(args) => schedule(args).await,
        Commands::Migrate(args) => migrate(args).await,
    }
}
