//! Schema synchronization for the change cache store
//!
//! - Creates the `change_cache` table and its indexes when missing
//! - Adds newer columns to stores written by older versions
//! - Does NOT handle column renames or type changes (additive only)

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Name of the change cache table
pub const CHANGE_CACHE_TABLE: &str = "change_cache";

/// A column that may be missing from stores created by older versions
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

/// Columns introduced after the first schema. Checked on every start-up.
pub const NEWER_COLUMNS: &[ColumnDef] = &[
    ColumnDef {
        name: "remote_signature_full",
        sql_type: "TEXT",
        nullable: true,
        default: None,
    },
    ColumnDef {
        name: "missing_with_urls_json",
        sql_type: "TEXT",
        nullable: true,
        default: None,
    },
    ColumnDef {
        name: "invalid_titles_json",
        sql_type: "TEXT",
        nullable: true,
        default: None,
    },
    ColumnDef {
        name: "cache_version",
        sql_type: "TEXT",
        nullable: true,
        default: None,
    },
];

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS change_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cache_key TEXT NOT NULL UNIQUE,
        model_name TEXT NOT NULL,
        module TEXT NOT NULL,
        url TEXT NOT NULL,
        remote_signature TEXT NOT NULL DEFAULT '',
        remote_signature_full TEXT,
        local_signature TEXT NOT NULL DEFAULT '',
        online_count INTEGER NOT NULL DEFAULT 0,
        local_count INTEGER NOT NULL DEFAULT 0,
        missing_titles_json TEXT NOT NULL DEFAULT '[]',
        missing_with_urls_json TEXT,
        invalid_titles_json TEXT,
        local_changed INTEGER NOT NULL DEFAULT 0,
        remote_changed INTEGER NOT NULL DEFAULT 0,
        checked_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        cache_version TEXT
    )
"#;

const CREATE_INDEXES_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_change_cache_key ON change_cache(cache_key)",
    "CREATE INDEX IF NOT EXISTS idx_change_cache_model ON change_cache(model_name)",
];

/// Result of a schema sync operation
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub table_created: bool,
    pub columns_added: Vec<String>,
    pub errors: Vec<String>,
}

/// Check if a table exists in the database
async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

/// Get existing columns for a table
pub async fn get_table_columns(
    pool: &SqlitePool,
    table_name: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(i32, String, String, i32, Option<String>, i32)> =
        sqlx::query_as(&format!("PRAGMA table_info({})", table_name))
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(_, name, _, _, _, _)| name).collect())
}

/// Generate ALTER TABLE ADD COLUMN SQL
fn generate_add_column_sql(table_name: &str, col: &ColumnDef) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table_name, col.name, col.sql_type
    );

    // SQLite cannot add NOT NULL columns without a default
    if let Some(default) = col.default {
        sql.push_str(&format!(" DEFAULT {}", default));
    } else if !col.nullable {
        let default_val = match col.sql_type {
            "INTEGER" => "0",
            "REAL" => "0.0",
            _ => "''",
        };
        sql.push_str(&format!(" NOT NULL DEFAULT {}", default_val));
    }

    sql
}

/// Ensure the change cache table, its indexes and all newer columns exist.
///
/// Errors reading the schema are returned so the caller can treat the store
/// as corrupted; a failed `ALTER TABLE` is collected in `errors`.
pub async fn sync_change_cache_schema(pool: &SqlitePool) -> Result<SchemaSyncResult, sqlx::Error> {
    let mut result = SchemaSyncResult::default();

    if !table_exists(pool, CHANGE_CACHE_TABLE).await? {
        debug!("Creating table {}", CHANGE_CACHE_TABLE);
        sqlx::query(CREATE_TABLE_SQL.trim()).execute(pool).await?;
        result.table_created = true;
    } else {
        let existing_columns = get_table_columns(pool, CHANGE_CACHE_TABLE).await?;

        for col_def in NEWER_COLUMNS {
            if existing_columns.iter().any(|c| c == col_def.name) {
                continue;
            }

            let alter_sql = generate_add_column_sql(CHANGE_CACHE_TABLE, col_def);
            debug!("Adding column to {}: {}", CHANGE_CACHE_TABLE, alter_sql);

            match sqlx::query(&alter_sql).execute(pool).await {
                Ok(_) => {
                    info!("Added column {}.{}", CHANGE_CACHE_TABLE, col_def.name);
                    result.columns_added.push(col_def.name.to_string());
                }
                Err(e) => {
                    let msg = format!(
                        "Failed to add column {}.{}: {}",
                        CHANGE_CACHE_TABLE, col_def.name, e
                    );
                    warn!("{}", msg);
                    result.errors.push(msg);
                }
            }
        }
    }

    for stmt in CREATE_INDEXES_SQL {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(result)
}
