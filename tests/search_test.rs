use chatflow::config::SearchConfig;
use chatflow::db::{init_db, DbPool};
use chatflow::ledger;
use chatflow::messages;
use chatflow::publisher::EventPublisher;
use chatflow::search::{self, FixedSearchBackend, SearchBackend};
use chatflow::types::{ChatEvent, ChatflowError, Result, SearchResult};
use futures_util::future::BoxFuture;
use tempfile::{tempdir, TempDir};

struct FailingBackend;

impl SearchBackend for FailingBackend {
    fn search<'a>(&'a self, _query: &'a str) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
        Box::pin(async { Err(ChatflowError::internal("search backend down").into()) })
    }
}

fn result(title: &str) -> SearchResult {
    SearchResult {
        title: title.to_string(),
        content: format!("content for {}", title),
        url: Some(format!("https://example.com/{}", title)),
        score: Some(0.5),
    }
}

async fn setup() -> (TempDir, DbPool, i64) {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("search_test.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    messages::ensure_conversation(&pool, 1, 10)
        .await
        .expect("conversation");
    let message_id = messages::create_draft_message(&pool, 1)
        .await
        .expect("draft");
    (dir, pool, message_id)
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_successful_search_records_ledger_blob_and_events() {
    let (_dir, pool, message_id) = setup().await;
    let publisher = EventPublisher::new(16);
    let mut side_rx = publisher.register(1);
    let backend = FixedSearchBackend {
        results: vec![result("alpha"), result("beta")],
    };
    let config = SearchConfig::default();

    let results =
        search::run_web_search(&pool, &publisher, &backend, &config, 1, message_id, "rust news")
            .await;
    assert_eq!(results.len(), 2);

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tool_name, ledger::TOOL_WEB_SEARCH);
    assert_eq!(records[0].status, ledger::STATUS_SUCCESS);

    let message = messages::get_message(&pool, message_id)
        .await
        .expect("fetch")
        .expect("exists");
    let blob = message.search_results.expect("blob stored");
    assert!(blob.contains("alpha"));

    let events = drain(&mut side_rx);
    assert_eq!(events[0], ChatEvent::search(search::STATUS_SEARCHING));
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::SearchResults { .. })));
    assert_eq!(
        events.last(),
        Some(&ChatEvent::search(search::STATUS_COMPLETE))
    );
}

#[tokio::test]
async fn test_results_truncated_to_configured_max() {
    let (_dir, pool, message_id) = setup().await;
    let publisher = EventPublisher::new(16);
    let _side_rx = publisher.register(1);
    let backend = FixedSearchBackend {
        results: vec![result("a"), result("b"), result("c")],
    };
    let config = SearchConfig {
        max_tool_calls: 3,
        max_results: 1,
    };

    let results =
        search::run_web_search(&pool, &publisher, &backend, &config, 1, message_id, "q").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].title, "a");
}

#[tokio::test]
async fn test_failed_search_is_non_fatal_and_recorded() {
    let (_dir, pool, message_id) = setup().await;
    let publisher = EventPublisher::new(16);
    let mut side_rx = publisher.register(1);
    let config = SearchConfig::default();

    let results =
        search::run_web_search(&pool, &publisher, &FailingBackend, &config, 1, message_id, "q")
            .await;
    assert!(results.is_empty());

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ledger::STATUS_FAILED);
    assert!(records[0]
        .error_message
        .as_deref()
        .unwrap_or("")
        .contains("search backend down"));

    let events = drain(&mut side_rx);
    assert_eq!(
        events.last(),
        Some(&ChatEvent::search(search::STATUS_FAILED))
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, ChatEvent::Error { .. })));
}

#[tokio::test]
async fn test_call_cap_skips_search() {
    let (_dir, pool, message_id) = setup().await;
    let publisher = EventPublisher::new(16);
    let mut side_rx = publisher.register(1);
    let config = SearchConfig {
        max_tool_calls: 1,
        max_results: 5,
    };

    ledger::start_tool_call(&pool, message_id, ledger::TOOL_WEB_SEARCH, "{}")
        .await
        .expect("seed call");

    let backend = FixedSearchBackend {
        results: vec![result("ignored")],
    };
    let results =
        search::run_web_search(&pool, &publisher, &backend, &config, 1, message_id, "q").await;
    assert!(results.is_empty());

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("records");
    assert_eq!(records.len(), 1, "cap must prevent a second ledger row");

    let events = drain(&mut side_rx);
    assert_eq!(
        events,
        vec![ChatEvent::search(search::STATUS_LIMIT_REACHED)]
    );
}
