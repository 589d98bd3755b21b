//! Application configuration management

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::scheduler::SchedulerConfig;
use crate::services::detector::{RemoteTitle, StaticCatalog, WatchTarget};
pub use crate::services::load_monitor::LoadThresholds;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing the change cache
    pub cache_db_path: PathBuf,

    /// JSON list of targets to watch
    pub watchlist_path: PathBuf,

    /// How often every watch target is probed
    pub probe_interval: Duration,

    pub scheduler: SchedulerConfig,

    pub load_thresholds: LoadThresholds,

    /// External command run for each re-check, with the model name appended
    pub sync_command: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let scheduler_defaults = SchedulerConfig::default();
        let threshold_defaults = LoadThresholds::default();

        Ok(Self {
            cache_db_path: lookup("CACHE_DB_PATH")
                .unwrap_or_else(|| "./data/change_cache.db".to_string())
                .into(),

            watchlist_path: lookup("WATCHLIST_PATH")
                .unwrap_or_else(|| "./data/watchlist.json".to_string())
                .into(),

            probe_interval: Duration::from_secs(positive_or(&lookup, "PROBE_INTERVAL_SECS", 3600)?),

            scheduler: SchedulerConfig {
                max_concurrent_tasks: parse_or(
                    &lookup,
                    "SCHEDULER_MAX_CONCURRENT",
                    scheduler_defaults.max_concurrent_tasks,
                )?,
                check_interval: Duration::from_secs(positive_or(
                    &lookup,
                    "SCHEDULER_CHECK_INTERVAL_SECS",
                    scheduler_defaults.check_interval.as_secs(),
                )?),
                adaptive_scheduling: flag_or(
                    &lookup,
                    "SCHEDULER_ADAPTIVE",
                    scheduler_defaults.adaptive_scheduling,
                ),
                load_aware: flag_or(&lookup, "SCHEDULER_LOAD_AWARE", scheduler_defaults.load_aware),
                task_timeout: lookup("SCHEDULER_TASK_TIMEOUT_SECS")
                    .map(|v| v.trim().parse::<u64>())
                    .transpose()
                    .context("Invalid SCHEDULER_TASK_TIMEOUT_SECS")?
                    .map(Duration::from_secs),
            },

            load_thresholds: LoadThresholds {
                cpu_percent: parse_or(&lookup, "LOAD_CPU_THRESHOLD", threshold_defaults.cpu_percent)?,
                memory_percent: parse_or(
                    &lookup,
                    "LOAD_MEMORY_THRESHOLD",
                    threshold_defaults.memory_percent,
                )?,
            },

            sync_command: lookup("SYNC_COMMAND").filter(|c| !c.trim().is_empty()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is rejected
fn positive_or<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value == 0 {
        bail!("Invalid {}: must be at least 1", key);
    }
    Ok(value)
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// One watchlist entry: a target plus its latest catalogue snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    #[serde(flatten)]
    pub target: WatchTarget,

    #[serde(default)]
    pub remote_titles: Vec<RemoteTitle>,
}

/// Read the watchlist. A missing file is an empty watchlist.
pub fn load_watchlist(path: &Path) -> Result<Vec<WatchEntry>> {
    if !path.exists() {
        warn!(path = %path.display(), "Watchlist not found, nothing to watch");
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read watchlist {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid watchlist {}", path.display()))
}

/// Catalogue serving every entry's snapshot
pub fn catalog_from_watchlist(entries: &[WatchEntry]) -> StaticCatalog {
    let mut catalog = StaticCatalog::new();
    for entry in entries {
        catalog.insert(&entry.target.url, entry.remote_titles.clone());
    }
    catalog
}
