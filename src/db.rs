use crate::types::{ChatflowError, Result};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ChatflowError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(ChatflowError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ChatflowError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    // Drafts left behind by a crash mid-stream are unreachable garbage.
    if let Err(e) = cleanup_stale_drafts(&pool).await {
        tracing::warn!("Stale draft cleanup failed: {}", e);
    }

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
    ];

    for pragma in pragmas {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(ChatflowError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Remove draft assistant messages (and their tool records) older than a day.
/// A draft that old can only be the residue of a process that died before its
/// stream finalized or cleaned up.
pub async fn cleanup_stale_drafts(pool: &DbPool) -> std::result::Result<(), sqlx::Error> {
    let deleted_tools = sqlx::query(
        "DELETE FROM tool_call_records WHERE message_id IN \
         (SELECT id FROM messages WHERE content = ? AND created_at < datetime('now', '-1 day'))",
    )
    .bind(crate::messages::DRAFT_PLACEHOLDER)
    .execute(pool)
    .await?;

    let deleted_drafts =
        sqlx::query("DELETE FROM messages WHERE content = ? AND created_at < datetime('now', '-1 day')")
            .bind(crate::messages::DRAFT_PLACEHOLDER)
            .execute(pool)
            .await?;

    if deleted_drafts.rows_affected() > 0 {
        tracing::info!(
            "Cleanup complete: removed {} stale drafts and {} orphaned tool records.",
            deleted_drafts.rows_affected(),
            deleted_tools.rows_affected()
        );
    }

    Ok(())
}
