//! Archivist daemon
//!
//! Probes every watchlist target on an interval, schedules a re-check for
//! targets whose signatures changed and records the new state once the
//! re-check succeeds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use archivist::config::{Config, WatchEntry, catalog_from_watchlist, load_watchlist};
use archivist::db::ChangeCache;
use archivist::jobs::{TaskScheduler, schedule_recheck, start_scheduler};
use archivist::services::{
    CatalogSource, ChangeDetector, ExecutionHistory, check_url_available, init_tracing,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    init_tracing()?;

    info!("Starting Archivist");
    info!(
        cache = %config.cache_db_path.display(),
        watchlist = %config.watchlist_path.display(),
        probe_interval_secs = config.probe_interval.as_secs(),
        "Configuration loaded"
    );

    let cache = Arc::new(ChangeCache::open(&config.cache_db_path).await?);
    let detector = Arc::new(ChangeDetector::new(cache.clone()));
    let history = Arc::new(ExecutionHistory::new());
    let scheduler = start_scheduler(&config, history);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent(concat!("archivist/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let mut ticker = tokio::time::interval(config.probe_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = probe_watchlist(&config, &detector, &scheduler, &client).await {
                    error!(error = %e, "Probe round failed");
                }
            }
        }
    }

    scheduler.stop(SHUTDOWN_TIMEOUT).await;
    let stats = scheduler.stats();
    info!(
        pending = stats.pending,
        running = stats.running,
        completed = stats.completed,
        failed = stats.failed,
        "Scheduler shut down"
    );
    cache.close().await;

    Ok(())
}

/// Probe every target once and schedule re-checks where something changed
async fn probe_watchlist(
    config: &Config,
    detector: &Arc<ChangeDetector>,
    scheduler: &TaskScheduler,
    client: &reqwest::Client,
) -> Result<()> {
    let entries = load_watchlist(&config.watchlist_path)?;
    let catalog: Arc<dyn CatalogSource> = Arc::new(catalog_from_watchlist(&entries));
    let mut scheduled = 0;

    for entry in &entries {
        match probe_entry(entry, detector, scheduler, client, &catalog).await {
            Ok(true) => scheduled += 1,
            Ok(false) => {}
            Err(e) => warn!(model = %entry.target.model_name, error = %e, "Probe failed"),
        }
    }

    info!(targets = entries.len(), scheduled, "Probe round finished");
    Ok(())
}

/// Returns true when a re-check was scheduled
async fn probe_entry(
    entry: &WatchEntry,
    detector: &Arc<ChangeDetector>,
    scheduler: &TaskScheduler,
    client: &reqwest::Client,
    catalog: &Arc<dyn CatalogSource>,
) -> Result<bool> {
    let target = &entry.target;

    if !check_url_available(client, &target.url).await {
        warn!(model = %target.model_name, url = %target.url, "Catalogue unreachable, skipping");
        return Ok(false);
    }

    let probe = detector.probe(target, catalog.as_ref()).await?;
    if !probe.needs_recheck() {
        detector.commit(&probe).await?;
        debug!(model = %target.model_name, "No changes");
        return Ok(false);
    }

    Ok(schedule_recheck(scheduler, detector, catalog.clone(), &probe).is_some())
}
