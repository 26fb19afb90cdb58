//! Tool-call ledger: every tool invocation made on behalf of an assistant
//! message gets a row with a 1-based, per-message call sequence. Rows are
//! created IN_PROGRESS and settled exactly once as SUCCESS or FAILED.

use crate::db::DbPool;
use crate::types::{Result, SearchResult};

pub const TOOL_WEB_SEARCH: &str = "webSearch";

pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolCallRecord {
    pub id: i64,
    pub message_id: i64,
    pub tool_name: String,
    pub call_sequence: i64,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
}

/// Assign the next sequence number for the message and insert an IN_PROGRESS
/// row. The read-max-then-insert pair is not atomic; SQLite's single writer
/// serializes it in practice for this deployment shape.
pub async fn start_tool_call(
    pool: &DbPool,
    message_id: i64,
    tool_name: &str,
    tool_input: &str,
) -> Result<i64> {
    let (next_sequence,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(call_sequence), 0) + 1 FROM tool_call_records WHERE message_id = ?",
    )
    .bind(message_id)
    .fetch_one(pool)
    .await?;

    let result = sqlx::query(
        "INSERT INTO tool_call_records (message_id, tool_name, call_sequence, tool_input, status) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(message_id)
    .bind(tool_name)
    .bind(next_sequence)
    .bind(tool_input)
    .bind(STATUS_IN_PROGRESS)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    tracing::debug!(
        "tool call recorded: id={}, message={}, tool={}, seq={}",
        id,
        message_id,
        tool_name,
        next_sequence
    );
    Ok(id)
}

pub async fn complete_tool_call(pool: &DbPool, id: i64, tool_output: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tool_call_records SET tool_output = ?, status = ?, updated_at = datetime('now') \
         WHERE id = ?",
    )
    .bind(tool_output)
    .bind(STATUS_SUCCESS)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_tool_call(pool: &DbPool, id: i64, error_message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tool_call_records SET status = ?, error_message = ?, updated_at = datetime('now') \
         WHERE id = ?",
    )
    .bind(STATUS_FAILED)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a completed web search in one motion: serialize the query and
/// results, open the `webSearch` tool call, and settle it immediately.
pub async fn save_search_results(
    pool: &DbPool,
    message_id: i64,
    query: &str,
    results: &[SearchResult],
) -> Result<i64> {
    let results_json = serde_json::to_string(results)?;
    let query_json = serde_json::to_string(query)?;

    let id = start_tool_call(pool, message_id, TOOL_WEB_SEARCH, &query_json).await?;
    complete_tool_call(pool, id, &results_json).await?;
    Ok(id)
}

pub async fn get_message_tool_calls(pool: &DbPool, message_id: i64) -> Result<Vec<ToolCallRecord>> {
    let rows = sqlx::query_as::<_, ToolCallRecord>(
        "SELECT id, message_id, tool_name, call_sequence, tool_input, tool_output, status, error_message \
         FROM tool_call_records WHERE message_id = ? ORDER BY call_sequence",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn tool_call_count(pool: &DbPool, message_id: i64) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tool_call_records WHERE message_id = ?")
            .bind(message_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn delete_by_message_id(pool: &DbPool, message_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM tool_call_records WHERE message_id = ?")
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bulk delete for a set of messages. Tries one batched statement first and
/// degrades to per-id deletes, swallowing individual failures.
pub async fn delete_by_message_ids(pool: &DbPool, message_ids: &[i64]) {
    if message_ids.is_empty() {
        return;
    }

    let placeholders = vec!["?"; message_ids.len()].join(", ");
    let sql = format!(
        "DELETE FROM tool_call_records WHERE message_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for id in message_ids {
        query = query.bind(id);
    }

    match query.execute(pool).await {
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                "batched tool record delete failed, falling back to per-id deletes: {}",
                e
            );
            for id in message_ids {
                if let Err(e) = delete_by_message_id(pool, *id).await {
                    tracing::warn!("tool record delete failed for message {}: {}", id, e);
                }
            }
        }
    }
}
