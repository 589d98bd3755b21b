//! Probe, compare and commit: decides whether a target needs a re-check
//!
//! A probe computes fresh signatures for one watch target and compares them
//! with the cached entry. Committing stores the probed state so the next probe
//! compares against it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::archive::ArchiveFacts;
use super::signature::{local_signature_from_facts, normalize_title, remote_signature, remote_signature_full};
use crate::db::change_cache::{CacheEntry, ChangeCache, MissingTitle, UpsertCacheEntry, build_cache_key};
use crate::jobs::task::TaskPriority;

/// A title listed on a remote catalogue page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTitle {
    pub title: String,
    pub url: String,
}

/// Supplies the titles currently listed at a catalogue URL
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_titles(&self, url: &str) -> Result<Vec<RemoteTitle>>;
}

/// Catalogue backed by in-memory snapshots, keyed by URL
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    pages: HashMap<String, Vec<RemoteTitle>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: &str, titles: Vec<RemoteTitle>) {
        self.pages.insert(catalog_key(url), titles);
    }

    pub fn with_page(mut self, url: &str, titles: Vec<RemoteTitle>) -> Self {
        self.insert(url, titles);
        self
    }
}

fn catalog_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch_titles(&self, url: &str) -> Result<Vec<RemoteTitle>> {
        self.pages
            .get(&catalog_key(url))
            .cloned()
            .ok_or_else(|| anyhow!("No catalogue snapshot for {}", url))
    }
}

/// One (model, module, url) triple and where its files live locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub model_name: String,
    pub module: String,
    pub url: String,
    #[serde(default)]
    pub archive_roots: Vec<PathBuf>,
}

impl WatchTarget {
    pub fn cache_key(&self) -> String {
        build_cache_key(&self.model_name, &self.module, &self.url)
    }
}

/// Fresh state of a target next to what the cache last saw
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target: WatchTarget,
    pub cache_key: String,
    pub local_signature: String,
    pub remote_signature: String,
    pub remote_signature_full: String,
    pub online_count: usize,
    pub local_count: u64,
    /// Remote titles with no local counterpart, in remote order
    pub missing: Vec<MissingTitle>,
    /// Remote titles with nothing left after normalization
    pub invalid_titles: Vec<String>,
    pub local_changed: bool,
    pub remote_changed: bool,
    pub previous: Option<CacheEntry>,
}

impl ProbeResult {
    pub fn needs_recheck(&self) -> bool {
        self.local_changed || self.remote_changed
    }

    pub fn missing_titles(&self) -> Vec<String> {
        self.missing.iter().map(|m| m.title.clone()).collect()
    }

    pub fn to_upsert(&self) -> UpsertCacheEntry {
        UpsertCacheEntry {
            model_name: self.target.model_name.clone(),
            module: self.target.module.clone(),
            url: self.target.url.clone(),
            remote_signature: self.remote_signature.clone(),
            remote_signature_full: Some(self.remote_signature_full.clone()),
            local_signature: self.local_signature.clone(),
            online_count: self.online_count as i64,
            local_count: self.local_count as i64,
            missing_titles: self.missing_titles(),
            missing_with_urls: self.missing.clone(),
            invalid_titles: self.invalid_titles.clone(),
            local_changed: self.local_changed,
            remote_changed: self.remote_changed,
        }
    }
}

/// Priority for a re-check given how much is missing
pub fn suggested_priority(probe: &ProbeResult) -> TaskPriority {
    match probe.missing.len() {
        n if n >= 50 => TaskPriority::Urgent,
        n if n >= 10 => TaskPriority::High,
        n if n >= 1 => TaskPriority::Normal,
        _ => TaskPriority::Low,
    }
}

/// Remote titles absent locally, plus titles that normalize to nothing
pub fn diff_titles(remote: &[RemoteTitle], local: &[String]) -> (Vec<MissingTitle>, Vec<String>) {
    let local: HashSet<String> = local.iter().map(|t| normalize_title(t)).collect();
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    let mut invalid = Vec::new();

    for remote_title in remote {
        let key = normalize_title(&remote_title.title);
        if key.is_empty() {
            invalid.push(remote_title.title.clone());
            continue;
        }
        if local.contains(&key) || !seen.insert(key) {
            continue;
        }
        missing.push(MissingTitle {
            title: remote_title.title.clone(),
            url: remote_title.url.clone(),
        });
    }

    (missing, invalid)
}

pub struct ChangeDetector {
    cache: Arc<ChangeCache>,
}

impl ChangeDetector {
    pub fn new(cache: Arc<ChangeCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ChangeCache> {
        &self.cache
    }

    /// Compute fresh signatures for `target` and compare with the cache.
    ///
    /// A catalogue that cannot be fetched counts as an empty listing.
    pub async fn probe(&self, target: &WatchTarget, source: &dyn CatalogSource) -> Result<ProbeResult> {
        let remote = match source.fetch_titles(&target.url).await {
            Ok(titles) => titles,
            Err(e) => {
                warn!(model = %target.model_name, url = %target.url, error = %e, "Catalogue fetch failed, treating as empty");
                Vec::new()
            }
        };

        let roots = target.archive_roots.clone();
        let facts = tokio::task::spawn_blocking(move || ArchiveFacts::collect(&roots))
            .await
            .context("Archive walk did not complete")?;

        let remote_names: Vec<&str> = remote.iter().map(|t| t.title.as_str()).collect();
        let local_signature = local_signature_from_facts(&facts, &facts.titles);
        let remote_sig = remote_signature(&remote_names);
        let remote_sig_full = remote_signature_full(&remote_names, remote.len());
        let (missing, invalid_titles) = diff_titles(&remote, &facts.titles);

        let cache_key = target.cache_key();
        let previous = self
            .cache
            .get(&cache_key)
            .await
            .with_context(|| format!("Failed to read change cache for {}", target.model_name))?;

        let (local_changed, remote_changed) = match &previous {
            Some(entry) => (
                entry.local_signature != local_signature,
                entry.remote_signature != remote_sig,
            ),
            None => (true, true),
        };

        let result = ProbeResult {
            target: target.clone(),
            cache_key,
            local_signature,
            remote_signature: remote_sig,
            remote_signature_full: remote_sig_full,
            online_count: remote.len(),
            local_count: facts.file_count,
            missing,
            invalid_titles,
            local_changed,
            remote_changed,
            previous,
        };

        debug!(
            model = %target.model_name,
            module = %target.module,
            online = result.online_count,
            local = result.local_count,
            missing = result.missing.len(),
            local_changed,
            remote_changed,
            "Probed watch target"
        );
        Ok(result)
    }

    /// Store the probed state in the cache
    pub async fn commit(&self, probe: &ProbeResult) -> Result<CacheEntry> {
        let entry = self
            .cache
            .upsert(probe.to_upsert())
            .await
            .with_context(|| format!("Failed to update change cache for {}", probe.target.model_name))?;

        info!(
            model = %entry.model_name,
            module = %entry.module,
            missing = entry.missing_titles.len(),
            "Committed change cache entry"
        );
        Ok(entry)
    }

    /// Probe `target` again and store the result.
    ///
    /// Called after a successful re-check, so the cache holds the signatures
    /// of the archive as the re-check left it.
    pub async fn refresh(&self, target: &WatchTarget, source: &dyn CatalogSource) -> Result<CacheEntry> {
        let probe = self.probe(target, source).await?;
        self.commit(&probe).await
    }
}
