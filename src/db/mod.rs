//! Change cache storage

pub mod change_cache;
pub mod schema_sync;
pub mod sqlite_helpers;

pub use change_cache::{
    CACHE_VERSION, CacheEntry, CacheError, ChangeCache, MissingTitle, UpsertCacheEntry,
    build_cache_key,
};
pub use schema_sync::{SchemaSyncResult, sync_change_cache_schema};
