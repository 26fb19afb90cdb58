//! Web search tool composition. The search HTTP client itself lives behind
//! [`SearchBackend`]; this module owns everything around it: the
//! per-message call cap, side-channel progress events, the ledger rows, and
//! the serialized results blob on the assistant message. A failed search
//! never fails the chat stream.

use crate::config::SearchConfig;
use crate::db::DbPool;
use crate::ledger;
use crate::messages;
use crate::publisher::EventPublisher;
use crate::types::{Result, SearchResult};
use futures_util::future::BoxFuture;

pub const STATUS_SEARCHING: &str = "searching";
pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_LIMIT_REACHED: &str = "limit_reached";

/// The out-of-scope search provider: one query in, scored results out.
pub trait SearchBackend: Send + Sync {
    fn search<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Vec<SearchResult>>>;
}

/// Run one web search on behalf of a draft assistant message. Returns the
/// results that made it into the ledger; empty on cap, failure, or no hits.
pub async fn run_web_search(
    pool: &DbPool,
    publisher: &EventPublisher,
    backend: &dyn SearchBackend,
    config: &SearchConfig,
    conversation_id: i64,
    message_id: i64,
    query: &str,
) -> Vec<SearchResult> {
    match ledger::tool_call_count(pool, message_id).await {
        Ok(count) if count >= config.max_tool_calls => {
            tracing::warn!(
                "search call cap ({}) reached for message {}, skipping",
                config.max_tool_calls,
                message_id
            );
            publisher
                .publish_search_status(conversation_id, STATUS_LIMIT_REACHED)
                .await;
            return Vec::new();
        }
        Ok(_) => {}
        Err(e) => {
            // Counting failed; let the search itself decide the outcome.
            tracing::warn!("tool call count failed for message {}: {}", message_id, e);
        }
    }

    publisher
        .publish_search_status(conversation_id, STATUS_SEARCHING)
        .await;
    tracing::info!(
        "web search start cid={} mid={} query='{}'",
        conversation_id,
        message_id,
        query
    );

    match backend.search(query).await {
        Ok(mut results) => {
            results.truncate(config.max_results);

            if let Err(e) = ledger::save_search_results(pool, message_id, query, &results).await {
                tracing::warn!("recording search results failed for message {}: {}", message_id, e);
            }
            match serde_json::to_string(&results) {
                Ok(blob) => {
                    if let Err(e) = messages::set_message_search_results(pool, message_id, &blob).await
                    {
                        tracing::warn!("storing search blob failed for message {}: {}", message_id, e);
                    }
                }
                Err(e) => tracing::warn!("serializing search results failed: {}", e),
            }

            publisher
                .publish_search_results(conversation_id, results.clone())
                .await;
            publisher
                .publish_search_status(conversation_id, STATUS_COMPLETE)
                .await;
            tracing::info!(
                "web search done cid={} mid={} results={}",
                conversation_id,
                message_id,
                results.len()
            );
            results
        }
        Err(e) => {
            tracing::warn!("web search failed for message {}: {}", message_id, e.inner);
            record_failed_search(pool, message_id, query, &e.inner.to_string()).await;
            publisher
                .publish_search_status(conversation_id, STATUS_FAILED)
                .await;
            Vec::new()
        }
    }
}

async fn record_failed_search(pool: &DbPool, message_id: i64, query: &str, error: &str) {
    let query_json = match serde_json::to_string(query) {
        Ok(q) => q,
        Err(_) => query.to_string(),
    };
    match ledger::start_tool_call(pool, message_id, ledger::TOOL_WEB_SEARCH, &query_json).await {
        Ok(id) => {
            if let Err(e) = ledger::fail_tool_call(pool, id, error).await {
                tracing::warn!("marking search call {} failed errored: {}", id, e);
            }
        }
        Err(e) => tracing::warn!("recording failed search errored: {}", e),
    }
}

/// Render results as a context preamble for the outbound prompt.
pub fn results_to_context(results: &[SearchResult]) -> String {
    let mut context = String::from(
        "以下是与用户问题相关的最新搜索结果，回答时可参考并在合适处引用来源链接：\n",
    );
    for (i, r) in results.iter().enumerate() {
        context.push_str(&format!("[{}] {}\n{}\n", i + 1, r.title, r.content));
        if let Some(url) = &r.url {
            context.push_str(&format!("来源: {}\n", url));
        }
    }
    context
}

/// Convenience used by tests and demos: a backend serving canned results.
pub struct FixedSearchBackend {
    pub results: Vec<SearchResult>,
}

impl SearchBackend for FixedSearchBackend {
    fn search<'a>(&'a self, _query: &'a str) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
        let results = self.results.clone();
        Box::pin(async move { Ok(results) })
    }
}
