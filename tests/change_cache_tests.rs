//! Integration tests for the change cache store
//!
//! - Idempotent upserts
//! - Recovery from a corrupted store, both at open and while running
//! - Stores written before the newer columns existed

use std::path::Path;
use std::time::Duration;

use pretty_assertions::assert_eq;

use archivist::db::{CACHE_VERSION, CacheEntry, ChangeCache, MissingTitle, UpsertCacheEntry, build_cache_key};

fn entry(model: &str) -> UpsertCacheEntry {
    UpsertCacheEntry {
        model_name: model.to_string(),
        module: "clips".to_string(),
        url: "https://example.com/jane".to_string(),
        remote_signature: "r1".to_string(),
        remote_signature_full: Some("rf1".to_string()),
        local_signature: "l1".to_string(),
        online_count: 2,
        local_count: 1,
        missing_titles: vec!["Second".to_string()],
        missing_with_urls: vec![MissingTitle {
            title: "Second".to_string(),
            url: "https://example.com/jane/2".to_string(),
        }],
        invalid_titles: vec!["???".to_string()],
        local_changed: true,
        remote_changed: false,
    }
}

fn corrupt_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.contains(".corrupt-"))
        .collect()
}

// ============================================================================
// Upsert semantics
// ============================================================================

#[tokio::test]
async fn test_identical_upsert_only_touches_checked_at() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ChangeCache::open(dir.path().join("cache.db")).await.unwrap();

    let first = cache.upsert(entry("Jane")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = cache.upsert(entry("Jane")).await.unwrap();

    assert!(second.checked_at > first.checked_at);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(
        CacheEntry {
            checked_at: first.checked_at,
            ..second.clone()
        },
        first
    );
    assert_eq!(cache.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_upsert_updates_by_normalized_key() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ChangeCache::open(dir.path().join("cache.db")).await.unwrap();

    cache.upsert(entry("Jane")).await.unwrap();
    let updated = cache
        .upsert(UpsertCacheEntry {
            model_name: " JANE ".to_string(),
            module: "CLIPS".to_string(),
            url: "HTTPS://EXAMPLE.COM/JANE/".to_string(),
            remote_signature: "r2".to_string(),
            ..entry("Jane")
        })
        .await
        .unwrap();

    assert_eq!(cache.count().await.unwrap(), 1);
    assert_eq!(updated.remote_signature, "r2");
    assert_eq!(
        updated.cache_key,
        build_cache_key("jane", "clips", "https://example.com/jane")
    );
}

// ============================================================================
// Corruption recovery
// ============================================================================

#[tokio::test]
async fn test_corrupt_store_at_open_is_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    std::fs::write(&path, vec![0xAB_u8; 4096]).unwrap();

    let cache = ChangeCache::open(&path).await.unwrap();
    assert!(cache.get(&entry("Jane").cache_key()).await.unwrap().is_none());
    assert_eq!(cache.count().await.unwrap(), 0);
    assert_eq!(corrupt_files(dir.path()).len(), 1);

    cache.upsert(entry("Jane")).await.unwrap();
    assert_eq!(cache.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_store_corrupted_while_open_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let cache = ChangeCache::open(&path).await.unwrap();
    let key = entry("Jane").cache_key();
    cache.upsert(entry("Jane")).await.unwrap();
    assert!(cache.get(&key).await.unwrap().is_some());

    std::fs::write(&path, vec![0xAB_u8; 4096]).unwrap();

    assert!(cache.get(&key).await.unwrap().is_none());
    assert_eq!(corrupt_files(dir.path()).len(), 1);

    let stored = cache.upsert(entry("Jane")).await.unwrap();
    assert_eq!(stored.cache_key, key);
    assert!(cache.get(&key).await.unwrap().is_some());
}

// ============================================================================
// Schema evolution
// ============================================================================

#[tokio::test]
async fn test_old_store_is_upgraded_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let key = build_cache_key("kim", "clips", "https://example.com/kim");

    {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = sqlx::SqlitePool::connect_with(options).await.unwrap();
        sqlx::query(
            r#"CREATE TABLE change_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cache_key TEXT NOT NULL UNIQUE,
                model_name TEXT NOT NULL,
                module TEXT NOT NULL,
                url TEXT NOT NULL,
                remote_signature TEXT NOT NULL DEFAULT '',
                local_signature TEXT NOT NULL DEFAULT '',
                online_count INTEGER NOT NULL DEFAULT 0,
                local_count INTEGER NOT NULL DEFAULT 0,
                missing_titles_json TEXT NOT NULL DEFAULT '[]',
                local_changed INTEGER NOT NULL DEFAULT 0,
                remote_changed INTEGER NOT NULL DEFAULT 0,
                checked_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO change_cache (cache_key, model_name, module, url, remote_signature, \
             local_signature, online_count, local_count, missing_titles_json, local_changed, \
             remote_changed, checked_at, created_at) \
             VALUES (?, 'kim', 'clips', 'https://example.com/kim', 'r', 'l', 4, 4, '[\"A\"]', 0, 1, \
             '2024-01-15 10:30:45', '2024-01-15 10:30:45')",
        )
        .bind(key.as_str())
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    let cache = ChangeCache::open(&path).await.unwrap();
    let old = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(old.model_name, "kim");
    assert_eq!(old.missing_titles, vec!["A".to_string()]);
    assert!(old.remote_signature_full.is_none());
    assert!(old.missing_with_urls.is_empty());
    assert!(old.cache_version.is_none());
    assert!(old.remote_changed);
    assert!(corrupt_files(dir.path()).is_empty());

    let rewritten = cache
        .upsert(UpsertCacheEntry {
            model_name: "kim".to_string(),
            module: "clips".to_string(),
            url: "https://example.com/kim".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rewritten.cache_version.as_deref(), Some(CACHE_VERSION));
    assert_eq!(rewritten.created_at, old.created_at);
}
