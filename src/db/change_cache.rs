//! Change cache: last known signatures per (model, module, url)
//!
//! One row per cache key. Any storage-level error moves the SQLite file aside
//! with a timestamp suffix and recreates an empty schema.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::schema_sync::sync_change_cache_schema;
use crate::db::sqlite_helpers::{
    bool_to_int, datetime_to_str, int_to_bool, json_to_vec, json_to_vec_opt, str_to_datetime,
    vec_to_json,
};
use crate::services::signature::sha1_hex;

/// Version tag written to every row
pub const CACHE_VERSION: &str = "2";

const ENTRY_COLUMNS: &str = "cache_key, model_name, module, url, remote_signature, \
    remote_signature_full, local_signature, online_count, local_count, missing_titles_json, \
    missing_with_urls_json, invalid_titles_json, local_changed, remote_changed, checked_at, \
    created_at, cache_version";

/// Errors surfaced by the change cache.
///
/// Storage errors are normally absorbed by a rebuild; these only escape when
/// the rebuild itself fails.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("cache directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to move corrupted cache {} aside: {source}", .path.display())]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache store {} could not be rebuilt: {source}", .path.display())]
    RebuildFailed {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}

/// A title present remotely but absent locally, with its catalogue URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingTitle {
    pub title: String,
    pub url: String,
}

/// A cache row
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub cache_key: String,
    pub model_name: String,
    pub module: String,
    pub url: String,
    pub remote_signature: String,
    pub remote_signature_full: Option<String>,
    pub local_signature: String,
    pub online_count: i64,
    pub local_count: i64,
    pub missing_titles: Vec<String>,
    pub missing_with_urls: Vec<MissingTitle>,
    pub invalid_titles: Vec<String>,
    pub local_changed: bool,
    pub remote_changed: bool,
    pub checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub cache_version: Option<String>,
}

impl sqlx::FromRow<'_, SqliteRow> for CacheEntry {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let missing_json: String = row.try_get("missing_titles_json")?;
        let missing_urls_json: Option<String> = row.try_get("missing_with_urls_json")?;
        let invalid_json: Option<String> = row.try_get("invalid_titles_json")?;
        let local_changed: i32 = row.try_get("local_changed")?;
        let remote_changed: i32 = row.try_get("remote_changed")?;
        let checked_str: String = row.try_get("checked_at")?;
        let created_str: String = row.try_get("created_at")?;

        Ok(Self {
            cache_key: row.try_get("cache_key")?,
            model_name: row.try_get("model_name")?,
            module: row.try_get("module")?,
            url: row.try_get("url")?,
            remote_signature: row.try_get("remote_signature")?,
            remote_signature_full: row.try_get("remote_signature_full")?,
            local_signature: row.try_get("local_signature")?,
            online_count: row.try_get("online_count")?,
            local_count: row.try_get("local_count")?,
            missing_titles: json_to_vec(&missing_json),
            missing_with_urls: json_to_vec_opt(missing_urls_json.as_deref()),
            invalid_titles: json_to_vec_opt(invalid_json.as_deref()),
            local_changed: int_to_bool(local_changed),
            remote_changed: int_to_bool(remote_changed),
            checked_at: str_to_datetime(&checked_str).map_err(|e| sqlx::Error::Decode(e.into()))?,
            created_at: str_to_datetime(&created_str).map_err(|e| sqlx::Error::Decode(e.into()))?,
            cache_version: row.try_get("cache_version")?,
        })
    }
}

/// Input for inserting or updating a cache entry. The key and timestamps are derived.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertCacheEntry {
    pub model_name: String,
    pub module: String,
    pub url: String,
    pub remote_signature: String,
    pub remote_signature_full: Option<String>,
    pub local_signature: String,
    pub online_count: i64,
    pub local_count: i64,
    pub missing_titles: Vec<String>,
    pub missing_with_urls: Vec<MissingTitle>,
    pub invalid_titles: Vec<String>,
    pub local_changed: bool,
    pub remote_changed: bool,
}

impl UpsertCacheEntry {
    pub fn cache_key(&self) -> String {
        build_cache_key(&self.model_name, &self.module, &self.url)
    }
}

/// Canonical cache key for a (model, module, url) triple.
///
/// The model is lower-cased, the module upper-cased and the URL lower-cased
/// without a trailing slash; all parts are trimmed.
pub fn build_cache_key(model_name: &str, module: &str, url: &str) -> String {
    let normalized = format!(
        "{}|{}|{}",
        normalize_model_name(model_name),
        module.trim().to_uppercase(),
        url.trim().trim_end_matches('/').to_lowercase()
    );
    sha1_hex(&normalized)
}

/// Comparison form of a model name
pub fn normalize_model_name(model_name: &str) -> String {
    model_name.trim().to_lowercase()
}

/// Pool plus a rebuild counter so concurrent failures trigger one rebuild
#[derive(Clone)]
struct Store {
    pool: SqlitePool,
    epoch: u64,
}

enum Attempt<T> {
    Done(T),
    Rebuilt,
}

/// Persistent change-detection cache backed by SQLite
pub struct ChangeCache {
    path: PathBuf,
    store: RwLock<Store>,
    rebuild_lock: Mutex<()>,
}

impl ChangeCache {
    /// Open (or create) the cache at `path`, rebuilding it if it cannot be read
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = match connect_and_sync(&path).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Change cache unreadable at startup, rebuilding");
                let moved = quarantine(&path).map_err(|source| CacheError::Quarantine {
                    path: path.clone(),
                    source,
                })?;
                let pool = connect_and_sync(&path)
                    .await
                    .map_err(|source| CacheError::RebuildFailed {
                        path: path.clone(),
                        source,
                    })?;
                warn!(path = %path.display(), moved_to = ?moved, "Change cache rebuilt empty");
                pool
            }
        };

        info!(path = %path.display(), "Change cache opened");

        Ok(Self {
            path,
            store: RwLock::new(Store { pool, epoch: 0 }),
            rebuild_lock: Mutex::new(()),
        })
    }

    /// Path of the backing SQLite file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch an entry by cache key. Missing keys are `Ok(None)`.
    pub async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self
            .attempt(move |pool| async move { fetch_entry(&pool, cache_key).await })
            .await?
        {
            Attempt::Done(entry) => Ok(entry),
            Attempt::Rebuilt => Ok(None),
        }
    }

    /// Insert or update the entry for the input's cache key.
    ///
    /// `created_at` is set on first insert only; `checked_at` is always refreshed.
    pub async fn upsert(&self, entry: UpsertCacheEntry) -> Result<CacheEntry, CacheError> {
        let key = entry.cache_key();
        let now = Utc::now();
        let key_ref = key.as_str();
        let entry_ref = &entry;
        let write = move |pool: SqlitePool| async move {
            write_entry(&pool, key_ref, entry_ref, now).await
        };

        match self.attempt(write).await? {
            Attempt::Done(record) => Ok(record),
            Attempt::Rebuilt => {
                debug!(cache_key = %key, "Retrying upsert on rebuilt change cache");
                let store = self.store.read().clone();
                Ok(write(store.pool).await?)
            }
        }
    }

    /// Delete entries for one model, or every entry when `model_name` is `None`
    pub async fn clear(&self, model_name: Option<&str>) -> Result<u64, CacheError> {
        let wanted = model_name.map(normalize_model_name);
        let wanted_ref = wanted.as_deref();

        let removed = match self
            .attempt(move |pool| async move { delete_entries(&pool, wanted_ref).await })
            .await?
        {
            Attempt::Done(n) => n,
            Attempt::Rebuilt => 0,
        };

        info!(model = ?model_name, removed, "Cleared change cache entries");
        Ok(removed)
    }

    /// All entries whose model name matches (case- and whitespace-insensitive)
    pub async fn entries_for_model(&self, model_name: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let wanted = normalize_model_name(model_name);
        let wanted_ref = wanted.as_str();

        match self
            .attempt(move |pool| async move {
                let entries = sqlx::query_as::<_, CacheEntry>(&format!(
                    "SELECT {} FROM change_cache ORDER BY checked_at DESC",
                    ENTRY_COLUMNS
                ))
                .fetch_all(&pool)
                .await?;
                Ok::<_, sqlx::Error>(entries
                    .into_iter()
                    .filter(|e| normalize_model_name(&e.model_name) == wanted_ref)
                    .collect())
            })
            .await?
        {
            Attempt::Done(entries) => Ok(entries),
            Attempt::Rebuilt => Ok(Vec::new()),
        }
    }

    /// Number of cached entries
    pub async fn count(&self) -> Result<i64, CacheError> {
        match self
            .attempt(|pool| async move {
                let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_cache")
                    .fetch_one(&pool)
                    .await?;
                Ok::<_, sqlx::Error>(n)
            })
            .await?
        {
            Attempt::Done(n) => Ok(n),
            Attempt::Rebuilt => Ok(0),
        }
    }

    /// Close the pool at shutdown. The cache must not be used afterwards.
    pub async fn close(&self) {
        let store = self.store.read().clone();
        store.pool.close().await;
    }

    /// Run one storage operation, rebuilding the store if it fails
    async fn attempt<T, F, Fut>(&self, op: F) -> Result<Attempt<T>, CacheError>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let store = self.store.read().clone();
        match op(store.pool).await {
            Ok(value) => Ok(Attempt::Done(value)),
            Err(e) => {
                self.rebuild(store.epoch, &e).await?;
                Ok(Attempt::Rebuilt)
            }
        }
    }

    /// Move the store aside and recreate it, unless another caller already did
    async fn rebuild(&self, observed_epoch: u64, cause: &sqlx::Error) -> Result<(), CacheError> {
        let _guard = self.rebuild_lock.lock().await;

        let current = self.store.read().clone();
        if current.epoch != observed_epoch {
            debug!(path = %self.path.display(), "Change cache already rebuilt by another caller");
            return Ok(());
        }

        warn!(
            path = %self.path.display(),
            error = %cause,
            "Change cache storage error, treating store as corrupted"
        );

        current.pool.close().await;
        let moved = quarantine(&self.path).map_err(|source| CacheError::Quarantine {
            path: self.path.clone(),
            source,
        })?;
        let pool = connect_and_sync(&self.path)
            .await
            .map_err(|source| CacheError::RebuildFailed {
                path: self.path.clone(),
                source,
            })?;

        *self.store.write() = Store {
            pool,
            epoch: observed_epoch + 1,
        };

        warn!(
            path = %self.path.display(),
            moved_to = ?moved,
            "Change cache rebuilt empty, cached history discarded"
        );
        Ok(())
    }
}

/// Connect to the SQLite file and bring its schema up to date
async fn connect_and_sync(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    match sync_change_cache_schema(&pool).await {
        Ok(result) if result.errors.is_empty() => {
            if result.table_created {
                info!(path = %path.display(), "Created change cache schema");
            }
            if !result.columns_added.is_empty() {
                info!(columns = ?result.columns_added, "Added change cache columns");
            }
            Ok(pool)
        }
        Ok(result) => {
            pool.close().await;
            Err(sqlx::Error::Protocol(result.errors.join("; ")))
        }
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}

/// Rename the store aside as `<file>.corrupt-<timestamp>` and drop SQLite sidecar files
fn quarantine(path: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut moved = None;

    if path.exists() {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut target = with_suffix(path, &format!(".corrupt-{}", stamp));
        let mut attempt = 1;
        while target.exists() {
            target = with_suffix(path, &format!(".corrupt-{}-{}", stamp, attempt));
            attempt += 1;
        }
        std::fs::rename(path, &target)?;
        moved = Some(target);
    }

    for suffix in ["-wal", "-shm", "-journal"] {
        let sidecar = with_suffix(path, suffix);
        if sidecar.exists()
            && let Err(e) = std::fs::remove_file(&sidecar)
        {
            warn!(path = %sidecar.display(), error = %e, "Failed to remove SQLite sidecar file");
        }
    }

    Ok(moved)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn fetch_entry(pool: &SqlitePool, cache_key: &str) -> Result<Option<CacheEntry>, sqlx::Error> {
    sqlx::query_as::<_, CacheEntry>(&format!(
        "SELECT {} FROM change_cache WHERE cache_key = ?1",
        ENTRY_COLUMNS
    ))
    .bind(cache_key)
    .fetch_optional(pool)
    .await
}

async fn write_entry(
    pool: &SqlitePool,
    cache_key: &str,
    entry: &UpsertCacheEntry,
    now: DateTime<Utc>,
) -> Result<CacheEntry, sqlx::Error> {
    let now_str = datetime_to_str(now);

    sqlx::query_as::<_, CacheEntry>(&format!(
        r#"
        INSERT INTO change_cache (
            cache_key, model_name, module, url, remote_signature, remote_signature_full,
            local_signature, online_count, local_count, missing_titles_json,
            missing_with_urls_json, invalid_titles_json, local_changed, remote_changed,
            checked_at, created_at, cache_version
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, ?16)
        ON CONFLICT (cache_key)
        DO UPDATE SET
            model_name = excluded.model_name,
            module = excluded.module,
            url = excluded.url,
            remote_signature = excluded.remote_signature,
            remote_signature_full = excluded.remote_signature_full,
            local_signature = excluded.local_signature,
            online_count = excluded.online_count,
            local_count = excluded.local_count,
            missing_titles_json = excluded.missing_titles_json,
            missing_with_urls_json = excluded.missing_with_urls_json,
            invalid_titles_json = excluded.invalid_titles_json,
            local_changed = excluded.local_changed,
            remote_changed = excluded.remote_changed,
            checked_at = excluded.checked_at,
            cache_version = excluded.cache_version
        RETURNING {}
        "#,
        ENTRY_COLUMNS
    ))
    .bind(cache_key)
    .bind(entry.model_name.trim())
    .bind(entry.module.trim())
    .bind(entry.url.trim())
    .bind(&entry.remote_signature)
    .bind(&entry.remote_signature_full)
    .bind(&entry.local_signature)
    .bind(entry.online_count)
    .bind(entry.local_count)
    .bind(vec_to_json(&entry.missing_titles))
    .bind(vec_to_json(&entry.missing_with_urls))
    .bind(vec_to_json(&entry.invalid_titles))
    .bind(bool_to_int(entry.local_changed))
    .bind(bool_to_int(entry.remote_changed))
    .bind(&now_str)
    .bind(CACHE_VERSION)
    .fetch_one(pool)
    .await
}

async fn delete_entries(pool: &SqlitePool, model_name: Option<&str>) -> Result<u64, sqlx::Error> {
    let Some(wanted) = model_name else {
        let result = sqlx::query("DELETE FROM change_cache").execute(pool).await?;
        return Ok(result.rows_affected());
    };

    // Same case folding as build_cache_key
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT cache_key, model_name FROM change_cache")
            .fetch_all(pool)
            .await?;

    let mut tx = pool.begin().await?;
    let mut removed = 0;
    for (cache_key, stored_model) in rows {
        if normalize_model_name(&stored_model) == wanted {
            removed += sqlx::query("DELETE FROM change_cache WHERE cache_key = ?1")
                .bind(&cache_key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
    }
    tx.commit().await?;

    Ok(removed)
}
