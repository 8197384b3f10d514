//! Reconciliation, gap filling and the collection pipeline that drives them.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use cfmc_adapters::{known_source_ids, Crawlability, SourceTarget};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

mod pipeline;
mod placeholder;
mod reconcile;

pub use pipeline::{
    sink_from_config, ReportedError, RunOptions, RunSummary, SourceReport, SourceStatus, SyncPipeline,
};
pub use placeholder::{NoopPlaceholder, PlaceholderHook, YesterdayPlaceholder};
pub use reconcile::{plan_upload, values_differ, KeyedRows, Reconciler, Reconciliation, Tolerance};

pub const CRATE_NAME: &str = "cfmc-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
    #[error("{sink} sink failed on {table}")]
    Sink {
        sink: String,
        table: String,
        #[source]
        source: cfmc_storage::SinkError,
    },
    #[error("adapter {source_id} failed")]
    Adapter {
        source_id: String,
        #[source]
        source: cfmc_adapters::AdapterError,
    },
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Short tag written into run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::Sink { .. } => "sink",
            Self::Adapter { .. } => "adapter",
            Self::UnknownSource(_) => "unknown_source",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Pre-fetched JSON pages on disk.
    #[default]
    Fixture,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub crawlability: Crawlability,
    #[serde(default)]
    pub mode: SourceMode,
    /// Overrides `fixtures/<source_id>/sample` for fixture mode.
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn fixture_dir(&self, workspace_root: &Path) -> PathBuf {
        match &self.input_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace_root.join(dir),
            None => workspace_root
                .join("fixtures")
                .join(&self.source_id)
                .join("sample"),
        }
    }

    pub fn source_targets(&self) -> Vec<SourceTarget> {
        self.targets
            .iter()
            .map(|url| SourceTarget { url: url.clone() })
            .collect()
    }
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry = Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(registry)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        for source in &registry.sources {
            if !known_source_ids().contains(&source.source_id.as_str()) {
                return Err(SyncError::UnknownSource(source.source_id.clone()).into());
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Sqlite,
    Supabase,
    Memory,
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "supabase" => Ok(Self::Supabase),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown sink {other:?}; expected sqlite, supabase or memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sink: SinkKind,
    pub database_url: String,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub sources_path: PathBuf,
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_proxy: Option<String>,
    pub scheduler_enabled: bool,
    /// Six fields, seconds first.
    pub sync_cron: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let workspace_root = env_opt("CFMC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let sink = match env_opt("CFMC_SINK") {
            Some(raw) => raw.parse().context("reading CFMC_SINK")?,
            None => SinkKind::Sqlite,
        };
        Ok(Self {
            sink,
            database_url: env_opt("DATABASE_URL").unwrap_or_else(|| "sqlite://cfmc.db".to_string()),
            supabase_url: env_opt("SUPABASE_URL"),
            supabase_key: env_opt("SUPABASE_KEY"),
            sources_path: env_opt("CFMC_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("sources.yaml")),
            artifacts_dir: env_opt("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("artifacts")),
            reports_dir: env_opt("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("reports")),
            user_agent: env_opt("CFMC_USER_AGENT").unwrap_or_else(|| "cfmc-bot/0.1".to_string()),
            http_timeout_secs: env_opt("CFMC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_proxy: env_opt("CFMC_HTTP_PROXY"),
            scheduler_enabled: env_opt("CFMC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_opt("SYNC_CRON").unwrap_or_else(|| "0 30 1 * * *".to_string()),
            workspace_root,
        })
    }

    /// Local defaults rooted at `workspace_root`, with no environment lookups.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            sink: SinkKind::Memory,
            database_url: "sqlite://cfmc.db".to_string(),
            supabase_url: None,
            supabase_key: None,
            sources_path: workspace_root.join("sources.yaml"),
            artifacts_dir: workspace_root.join("artifacts"),
            reports_dir: workspace_root.join("reports"),
            user_agent: "cfmc-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_proxy: None,
            scheduler_enabled: false,
            sync_cron: "0 30 1 * * *".to_string(),
            workspace_root,
        }
    }
}
