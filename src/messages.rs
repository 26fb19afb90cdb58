//! Conversation and message persistence. An assistant message starts life as
//! a draft row so tool calls emitted mid-stream have a real message id to
//! attach to; the draft is later finalized with the accumulated text or
//! deleted if the stream failed before anything was persisted.

use crate::db::DbPool;
use crate::types::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const DRAFT_PLACEHOLDER: &str = "[draft]";
pub const DEFAULT_TITLE: &str = "新对话";

const TITLE_MAX_CHARS: usize = 20;

lazy_static! {
    static ref THINK_BLOCK: Regex =
        Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").unwrap();
    static ref THINK_TAG: Regex = Regex::new(r"(?is)</?think(?:ing)?>").unwrap();
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConversationRow {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String,
    pub content: String,
    pub thinking: Option<String>,
    pub search_results: Option<String>,
    pub created_at: String,
}

/// One turn in the outbound provider request body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// Make sure the conversation row exists; the first user turn creates it with
/// a placeholder title that the title heuristic replaces later.
pub async fn ensure_conversation(pool: &DbPool, conversation_id: i64, user_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO conversations (id, user_id, title) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(DEFAULT_TITLE)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_conversation(pool: &DbPool, id: i64) -> Result<Option<ConversationRow>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn update_conversation_title(pool: &DbPool, id: i64, title: &str) -> Result<()> {
    sqlx::query("UPDATE conversations SET title = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(title)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace a still-placeholder title with a truncation of the first user
/// message. Fired asynchronously from the stream path; never blocks it.
pub async fn generate_title_if_needed(pool: &DbPool, conversation_id: i64, first_message: &str) {
    let conversation = match get_conversation(pool, conversation_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("title lookup failed for conversation {}: {}", conversation_id, e);
            return;
        }
    };
    if conversation.title != DEFAULT_TITLE && !conversation.title.trim().is_empty() {
        return;
    }
    let title = truncate_title(first_message);
    if title.is_empty() {
        return;
    }
    if let Err(e) = update_conversation_title(pool, conversation_id, &title).await {
        tracing::warn!("title update failed for conversation {}: {}", conversation_id, e);
    }
}

pub fn truncate_title(message: &str) -> String {
    let trimmed = message.trim().replace('\n', " ");
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

pub async fn save_user_message(pool: &DbPool, conversation_id: i64, content: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO messages (conversation_id, role, content) VALUES (?, ?, ?)")
        .bind(conversation_id)
        .bind(ROLE_USER)
        .bind(content)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Create the assistant draft before any provider byte arrives.
pub async fn create_draft_message(pool: &DbPool, conversation_id: i64) -> Result<i64> {
    let result = sqlx::query("INSERT INTO messages (conversation_id, role, content) VALUES (?, ?, ?)")
        .bind(conversation_id)
        .bind(ROLE_ASSISTANT)
        .bind(DRAFT_PLACEHOLDER)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Overwrite the draft placeholder with the final text, and the separated
/// thinking when the model produced any.
pub async fn update_message_content(
    pool: &DbPool,
    id: i64,
    content: &str,
    thinking: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE messages SET content = ?, thinking = ? WHERE id = ?")
        .bind(content)
        .bind(thinking)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_message_search_results(pool: &DbPool, id: i64, results_json: &str) -> Result<()> {
    sqlx::query("UPDATE messages SET search_results = ? WHERE id = ?")
        .bind(results_json)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_message(pool: &DbPool, id: i64) -> Result<Option<MessageRow>> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT id, conversation_id, role, content, thinking, search_results, created_at \
         FROM messages WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete_message(pool: &DbPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Last `limit` finished turns of a conversation, oldest first, for the
/// outbound request body. Drafts are skipped: the current turn's placeholder
/// must never echo back into its own prompt.
pub async fn recent_history(pool: &DbPool, conversation_id: i64, limit: i64) -> Result<Vec<WireMessage>> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, conversation_id, role, content, thinking, search_results, created_at \
         FROM messages WHERE conversation_id = ? AND content != ? \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(conversation_id)
    .bind(DRAFT_PLACEHOLDER)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .rev()
        .map(|row| WireMessage {
            role: row.role,
            content: row.content,
        })
        .collect())
}

/// Split inline `<think>`/`<thinking>` blocks out of the final text. Done
/// once over the aggregate rather than during streaming; partial tags inside
/// a single chunk are not worth the state machine.
pub fn extract_thinking_parts(content: &str) -> (Option<String>, String) {
    if content.trim().is_empty() {
        return (None, content.trim().to_string());
    }

    let mut thinking = String::new();
    let mut cleaned = String::new();
    let mut last_end = 0;

    for m in THINK_BLOCK.find_iter(content) {
        cleaned.push_str(&content[last_end..m.start()]);
        let inner_owned = THINK_TAG.replace_all(m.as_str(), "");
        let inner = inner_owned.trim();
        if !inner.is_empty() {
            if !thinking.is_empty() {
                thinking.push_str("\n\n");
            }
            thinking.push_str(inner);
        }
        last_end = m.end();
    }
    cleaned.push_str(&content[last_end..]);

    let thinking = if thinking.is_empty() {
        None
    } else {
        Some(thinking)
    };
    (thinking, cleaned.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_thinking_single_block() {
        let (thinking, content) =
            extract_thinking_parts("<think>step one</think>The answer is 4.");
        assert_eq!(thinking.as_deref(), Some("step one"));
        assert_eq!(content, "The answer is 4.");
    }

    #[test]
    fn test_extract_thinking_multiple_blocks_joined() {
        let (thinking, content) =
            extract_thinking_parts("<thinking>a</thinking>mid<think>b</think>tail");
        assert_eq!(thinking.as_deref(), Some("a\n\nb"));
        assert_eq!(content, "midtail");
    }

    #[test]
    fn test_extract_thinking_no_tags() {
        let (thinking, content) = extract_thinking_parts("plain answer");
        assert!(thinking.is_none());
        assert_eq!(content, "plain answer");
    }

    #[test]
    fn test_extract_thinking_empty_block_dropped() {
        let (thinking, content) = extract_thinking_parts("<think>  </think>answer");
        assert!(thinking.is_none());
        assert_eq!(content, "answer");
    }

    #[test]
    fn test_truncate_title_char_boundaries() {
        assert_eq!(truncate_title("  短标题  "), "短标题");
        let long = "一".repeat(40);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }
}
