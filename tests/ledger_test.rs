use chatflow::db::{init_db, DbPool};
use chatflow::ledger;
use chatflow::messages;
use chatflow::types::SearchResult;
use tempfile::{tempdir, TempDir};

async fn setup() -> (TempDir, DbPool, i64) {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("ledger_test.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    if let Err(e) = messages::ensure_conversation(&pool, 1, 10).await {
        panic!("Failed to create conversation: {:?}", e);
    }
    let message_id = match messages::create_draft_message(&pool, 1).await {
        Ok(id) => id,
        Err(e) => panic!("Failed to create draft: {:?}", e),
    };
    (dir, pool, message_id)
}

#[tokio::test]
async fn test_sequences_are_monotonic_per_message() {
    let (_dir, pool, message_id) = setup().await;

    let first = ledger::start_tool_call(&pool, message_id, "webSearch", "{\"q\":1}")
        .await
        .expect("first call");
    let second = ledger::start_tool_call(&pool, message_id, "webSearch", "{\"q\":2}")
        .await
        .expect("second call");
    assert_ne!(first, second);

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("fetch records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].call_sequence, 1);
    assert_eq!(records[1].call_sequence, 2);
    assert!(records
        .iter()
        .all(|r| r.status == ledger::STATUS_IN_PROGRESS));

    // A different message starts its own sequence at 1.
    let other_message = messages::create_draft_message(&pool, 1)
        .await
        .expect("second draft");
    ledger::start_tool_call(&pool, other_message, "webSearch", "{}")
        .await
        .expect("other call");
    let other_records = ledger::get_message_tool_calls(&pool, other_message)
        .await
        .expect("fetch other");
    assert_eq!(other_records[0].call_sequence, 1);
}

#[tokio::test]
async fn test_complete_sets_success_and_keeps_identity() {
    let (_dir, pool, message_id) = setup().await;

    let id = ledger::start_tool_call(&pool, message_id, "webSearch", "\"rust\"")
        .await
        .expect("start");
    ledger::complete_tool_call(&pool, id, "[{\"title\":\"r\"}]")
        .await
        .expect("complete");

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("fetch");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, id);
    assert_eq!(record.message_id, message_id);
    assert_eq!(record.call_sequence, 1);
    assert_eq!(record.status, ledger::STATUS_SUCCESS);
    assert_eq!(record.tool_output.as_deref(), Some("[{\"title\":\"r\"}]"));
    assert!(record.error_message.is_none());
}

#[tokio::test]
async fn test_fail_records_error_text() {
    let (_dir, pool, message_id) = setup().await;

    let id = ledger::start_tool_call(&pool, message_id, "webSearch", "\"rust\"")
        .await
        .expect("start");
    ledger::fail_tool_call(&pool, id, "backend unreachable")
        .await
        .expect("fail");

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("fetch");
    assert_eq!(records[0].status, ledger::STATUS_FAILED);
    assert_eq!(
        records[0].error_message.as_deref(),
        Some("backend unreachable")
    );
    assert!(records[0].tool_output.is_none());
}

#[tokio::test]
async fn test_save_search_results_is_start_plus_complete() {
    let (_dir, pool, message_id) = setup().await;

    let results = vec![SearchResult {
        title: "Tokio".into(),
        content: "Async runtime".into(),
        url: Some("https://tokio.rs".into()),
        score: Some(0.99),
    }];
    let id = ledger::save_search_results(&pool, message_id, "rust async", &results)
        .await
        .expect("save");

    let records = ledger::get_message_tool_calls(&pool, message_id)
        .await
        .expect("fetch");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.id, id);
    assert_eq!(record.tool_name, ledger::TOOL_WEB_SEARCH);
    assert_eq!(record.status, ledger::STATUS_SUCCESS);
    assert_eq!(record.tool_input.as_deref(), Some("\"rust async\""));
    let output = record.tool_output.as_deref().expect("output stored");
    assert!(output.contains("Tokio"));
    assert!(output.contains("https://tokio.rs"));
}

#[tokio::test]
async fn test_bulk_delete_by_message_ids() {
    let (_dir, pool, first_message) = setup().await;
    let second_message = messages::create_draft_message(&pool, 1)
        .await
        .expect("second draft");
    let third_message = messages::create_draft_message(&pool, 1)
        .await
        .expect("third draft");

    for mid in [first_message, second_message, third_message] {
        ledger::start_tool_call(&pool, mid, "webSearch", "{}")
            .await
            .expect("start");
    }

    ledger::delete_by_message_ids(&pool, &[first_message, second_message]).await;

    assert!(ledger::get_message_tool_calls(&pool, first_message)
        .await
        .expect("fetch")
        .is_empty());
    assert!(ledger::get_message_tool_calls(&pool, second_message)
        .await
        .expect("fetch")
        .is_empty());
    assert_eq!(
        ledger::get_message_tool_calls(&pool, third_message)
            .await
            .expect("fetch")
            .len(),
        1
    );

    // Empty input is a no-op, not an error.
    ledger::delete_by_message_ids(&pool, &[]).await;
}
