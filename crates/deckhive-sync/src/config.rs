use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::dedup::SourcePriority;

pub const DEFAULT_PARALLEL: usize = 64;
pub const DEFAULT_PROGRESS_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub priority: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Built-in ranking extended by every enabled source in the registry.
    pub fn priority(&self) -> SourcePriority {
        SourcePriority::builtin().with_overrides(
            self.sources
                .iter()
                .filter(|source| source.enabled)
                .map(|source| (source.source_id.clone(), source.priority)),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    /// Dataset prefix inside the blob store, e.g. `magic/mtgtop8`.
    pub prefix: String,
    pub parallel: usize,
    /// Incremental freshness window; zero never re-extracts a seen URL.
    pub max_age: Duration,
    pub progress_interval: Duration,
    pub sources_file: Option<PathBuf>,
    /// Local directory for Parquet snapshots; `None` skips them.
    pub export_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            prefix: "decks".to_string(),
            parallel: DEFAULT_PARALLEL,
            max_age: Duration::ZERO,
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_SECS),
            sources_file: None,
            export_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("DECKHIVE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let prefix = std::env::var("DECKHIVE_PREFIX").unwrap_or_else(|_| "decks".to_string());
        let export_dir = std::env::var("DECKHIVE_EXPORT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| local_export_dir(&data_dir, &prefix));
        Self {
            parallel: std::env::var("DECKHIVE_PARALLEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PARALLEL),
            max_age: std::env::var("DECKHIVE_MAX_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|hours| Duration::from_secs(hours * 3600))
                .unwrap_or(Duration::ZERO),
            progress_interval: std::env::var("DECKHIVE_PROGRESS_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_PROGRESS_SECS)),
            sources_file: std::env::var("DECKHIVE_SOURCES_FILE").ok().map(PathBuf::from),
            export_dir: Some(export_dir),
            data_dir,
            prefix,
        }
    }

    /// Points the config at a local store rooted at `data_dir`, keeping
    /// Parquet snapshots next to the JSONL exports.
    pub fn for_local_store(mut self, data_dir: PathBuf, prefix: String) -> Self {
        self.export_dir = Some(local_export_dir(&data_dir, &prefix));
        self.data_dir = data_dir;
        self.prefix = prefix;
        self
    }

    pub fn source_priority(&self) -> Result<SourcePriority> {
        match &self.sources_file {
            Some(path) => {
                let registry = SourceRegistry::from_path(path)?;
                debug!(path = %path.display(), sources = registry.sources.len(), "loaded source registry");
                Ok(registry.priority())
            }
            None => Ok(SourcePriority::builtin()),
        }
    }
}

fn local_export_dir(data_dir: &Path, prefix: &str) -> PathBuf {
    data_dir.join(prefix).join("exports")
}
