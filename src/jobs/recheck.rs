//! Re-check requests for changed watch targets

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error};

use super::scheduler::TaskScheduler;
use super::task::{ScheduledTask, TaskOutcome, TaskPriority, TaskRequest};
use crate::services::detector::{
    CatalogSource, ChangeDetector, ProbeResult, WatchTarget, suggested_priority,
};

/// Delay for high-priority re-checks, which skip adaptive timing
pub const EXPEDITED_DELAY: Duration = Duration::from_secs(1);

/// Cache key a re-check task was scheduled for
pub fn task_cache_key(task: &ScheduledTask) -> Option<&str> {
    task.data.get("cache_key").and_then(|v| v.as_str())
}

/// True when a pending or running task already covers `cache_key`
pub fn is_recheck_active(scheduler: &TaskScheduler, cache_key: &str) -> bool {
    scheduler
        .pending()
        .iter()
        .chain(scheduler.running().iter())
        .any(|t| task_cache_key(t) == Some(cache_key))
}

/// Schedule a re-check for a changed target.
///
/// Returns `None` when the same target already has a queued or running
/// re-check. A successful re-check refreshes the cache from `catalog`.
pub fn schedule_recheck(
    scheduler: &TaskScheduler,
    detector: &Arc<ChangeDetector>,
    catalog: Arc<dyn CatalogSource>,
    probe: &ProbeResult,
) -> Option<String> {
    if is_recheck_active(scheduler, &probe.cache_key) {
        debug!(model = %probe.target.model_name, cache_key = %probe.cache_key, "Re-check already queued");
        return None;
    }

    let priority = suggested_priority(probe);
    let delay = if priority >= TaskPriority::High {
        EXPEDITED_DELAY
    } else {
        Duration::ZERO
    };

    let target = &probe.target;
    let request = TaskRequest::new(target.model_name.clone())
        .with_priority(priority)
        .with_delay(delay)
        .with_data(json!({
            "cache_key": probe.cache_key,
            "module": target.module,
            "url": target.url,
            "missing": probe.missing_titles(),
        }))
        .with_callback(refresh_on_success(detector.clone(), catalog, target.clone()));

    Some(scheduler.schedule(request))
}

/// Callback that re-probes and stores the target once the re-check succeeds.
///
/// Failed re-checks leave the cache untouched so the next round detects the
/// change again.
fn refresh_on_success(
    detector: Arc<ChangeDetector>,
    catalog: Arc<dyn CatalogSource>,
    target: WatchTarget,
) -> impl Fn(&ScheduledTask, &TaskOutcome) -> anyhow::Result<()> + Send + Sync + 'static {
    move |task, outcome| {
        if !outcome.is_success() {
            return Ok(());
        }

        let detector = detector.clone();
        let catalog = catalog.clone();
        let target = target.clone();
        let task_id = task.task_id.clone();
        tokio::spawn(async move {
            if let Err(e) = detector.refresh(&target, catalog.as_ref()).await {
                error!(task_id = %task_id, error = %e, "Failed to record re-check result");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use crate::db::ChangeCache;
    use crate::jobs::runner::FnRunner;
    use crate::jobs::scheduler::SchedulerConfig;
    use crate::services::detector::{RemoteTitle, StaticCatalog};
    use crate::services::{ExecutionHistory, LoadMonitor, LoadThresholds, SystemLoadSample};

    fn idle_scheduler<F, Fut>(f: F) -> TaskScheduler
    where
        F: Fn(ScheduledTask) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let monitor = LoadMonitor::fixed(
            SystemLoadSample {
                cpu_percent: 5.0,
                memory_percent: 5.0,
                disk_io_bytes: 0,
                network_io_bytes: 0,
            },
            LoadThresholds::default(),
        );
        TaskScheduler::new(
            SchedulerConfig {
                max_concurrent_tasks: 2,
                check_interval: Duration::from_millis(10),
                adaptive_scheduling: false,
                load_aware: false,
                task_timeout: None,
            },
            Arc::new(FnRunner::new(f)),
            Arc::new(ExecutionHistory::new()),
            Arc::new(monitor),
        )
    }

    fn target(model: &str, module: &str, url: &str, archive: &Path) -> WatchTarget {
        WatchTarget {
            model_name: model.into(),
            module: module.into(),
            url: url.into(),
            archive_roots: vec![archive.to_path_buf()],
        }
    }

    fn page(names: &[&str]) -> Vec<RemoteTitle> {
        names
            .iter()
            .map(|t| RemoteTitle {
                title: t.to_string(),
                url: format!("https://example.com/{}", t),
            })
            .collect()
    }

    async fn wait_for_entry(cache: &ChangeCache, key: &str) -> Option<crate::db::CacheEntry> {
        for _ in 0..200 {
            if let Some(entry) = cache.get(key).await.unwrap() {
                return Some(entry);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_targets_of_one_model_are_scheduled_separately() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ChangeCache::open(dir.path().join("cache.db")).await.unwrap());
        let detector = Arc::new(ChangeDetector::new(cache));
        let scheduler = idle_scheduler(|_task| async { Ok("done".to_string()) });

        let clips = target("Jane", "clips", "https://example.com/jane/clips", dir.path());
        let photos = target("Jane", "photos", "https://example.com/jane/photos", dir.path());
        let catalog: Arc<dyn CatalogSource> = Arc::new(
            StaticCatalog::new()
                .with_page(&clips.url, page(&["A"]))
                .with_page(&photos.url, page(&["B"])),
        );

        let first = detector.probe(&clips, catalog.as_ref()).await.unwrap();
        let second = detector.probe(&photos, catalog.as_ref()).await.unwrap();
        assert_ne!(first.cache_key, second.cache_key);

        assert!(schedule_recheck(&scheduler, &detector, catalog.clone(), &first).is_some());
        assert!(schedule_recheck(&scheduler, &detector, catalog.clone(), &second).is_some());
        assert_eq!(scheduler.pending().len(), 2);

        // Same target under different spelling is a duplicate
        let respelled = target(" JANE ", "CLIPS", "https://example.com/jane/clips/", dir.path());
        let again = detector.probe(&respelled, catalog.as_ref()).await.unwrap();
        assert_eq!(again.cache_key, first.cache_key);
        assert!(schedule_recheck(&scheduler, &detector, catalog.clone(), &again).is_none());
        assert_eq!(scheduler.pending().len(), 2);
        assert!(is_recheck_active(&scheduler, &first.cache_key));
    }

    #[tokio::test]
    async fn test_successful_recheck_stores_post_sync_state() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir(&archive).unwrap();
        fs::write(archive.join("First.mp4"), b"1").unwrap();

        let cache = Arc::new(ChangeCache::open(dir.path().join("cache.db")).await.unwrap());
        let detector = Arc::new(ChangeDetector::new(cache.clone()));
        let sync_dir = archive.clone();
        let scheduler = idle_scheduler(move |_task| {
            let sync_dir = sync_dir.clone();
            async move {
                fs::write(sync_dir.join("Second.mp4"), b"2")
                    .map(|_| "synced".to_string())
                    .map_err(anyhow::Error::from)
            }
        });

        let jane = target("Jane", "clips", "https://example.com/jane", &archive);
        let catalog: Arc<dyn CatalogSource> =
            Arc::new(StaticCatalog::new().with_page(&jane.url, page(&["First", "Second"])));

        let probe = detector.probe(&jane, catalog.as_ref()).await.unwrap();
        assert!(probe.needs_recheck());
        schedule_recheck(&scheduler, &detector, catalog.clone(), &probe).unwrap();
        assert_eq!(scheduler.run_due(), 1);

        let stored = wait_for_entry(&cache, &probe.cache_key).await.unwrap();
        assert_eq!(stored.local_count, 2);
        assert!(stored.missing_titles.is_empty());

        let next = detector.probe(&jane, catalog.as_ref()).await.unwrap();
        assert!(!next.needs_recheck());
    }

    #[tokio::test]
    async fn test_failed_recheck_leaves_cache_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ChangeCache::open(dir.path().join("cache.db")).await.unwrap());
        let detector = Arc::new(ChangeDetector::new(cache.clone()));
        let scheduler = idle_scheduler(|_task| async { Err(anyhow::anyhow!("sync failed")) });

        let kim = target("kim", "clips", "https://example.com/kim", dir.path());
        let catalog: Arc<dyn CatalogSource> =
            Arc::new(StaticCatalog::new().with_page(&kim.url, page(&["A"])));

        let probe = detector.probe(&kim, catalog.as_ref()).await.unwrap();
        let id = schedule_recheck(&scheduler, &detector, catalog, &probe).unwrap();
        scheduler.run_due();

        for _ in 0..200 {
            if scheduler.task(&id).is_some_and(|t| t.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get(&probe.cache_key).await.unwrap().is_none());
    }
}
