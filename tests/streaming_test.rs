use chatflow::adapters::Dialect;
use chatflow::config::{AppConfig, ModelConfig, ProviderConfig};
use chatflow::db::DbPool;
use chatflow::main_helper::AppState;
use chatflow::messages;
use chatflow::publisher::EventPublisher;
use chatflow::registry::ProviderRegistry;
use chatflow::streaming::{stream_chat_with_source, StreamChatRequest, UpstreamSource};
use chatflow::types::{ChatEvent, SearchResult};
use futures_util::{stream, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio_stream::wrappers::ReceiverStream;

fn test_config(timeout_secs: u64) -> AppConfig {
    let mut providers = HashMap::new();
    providers.insert(
        "mock".to_string(),
        ProviderConfig {
            enabled: true,
            base_url: "http://127.0.0.1:1".to_string(),
            api_key_env: "MOCK_UNSET_KEY".to_string(),
            dialect: Dialect::Standard,
            read_timeout_ms: 1_000,
            models: vec![ModelConfig {
                name: "mock-model".to_string(),
                display_name: None,
                enabled: true,
                temperature: None,
                max_tokens: None,
                supports_thinking: false,
                api_run_id: None,
                tpuid_prefix: None,
            }],
        },
    );
    let mut config = AppConfig {
        default_provider: "mock".to_string(),
        defaults: Default::default(),
        providers,
        streaming: Default::default(),
        search: Default::default(),
    };
    config.streaming.response_timeout_secs = timeout_secs;
    config
}

async fn test_state(timeout_secs: u64) -> (TempDir, Arc<AppState>) {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let db = match chatflow::db::init_db(dir.path().join("streaming_test.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    let config = Arc::new(test_config(timeout_secs));
    let state = Arc::new(AppState {
        client: reqwest::Client::new(),
        db,
        config: config.clone(),
        registry: Arc::new(ProviderRegistry::from_config(&config)),
        publisher: Arc::new(EventPublisher::new(config.streaming.channel_capacity)),
        search: None,
    });
    (dir, state)
}

fn request(conversation_id: i64) -> StreamChatRequest {
    StreamChatRequest {
        conversation_id,
        user_id: Some(1),
        message: "hello there".to_string(),
        provider: None,
        model: None,
        search_enabled: false,
        deep_thinking: false,
    }
}

fn injected(events: Vec<ChatEvent>) -> UpstreamSource {
    UpstreamSource::Injected(stream::iter(events).boxed())
}

async fn collect(events: impl Stream<Item = ChatEvent>) -> Vec<ChatEvent> {
    match tokio::time::timeout(Duration::from_secs(10), events.collect::<Vec<_>>()).await {
        Ok(events) => events,
        Err(_) => panic!("stream did not terminate"),
    }
}

fn assert_single_terminal_last(events: &[ChatEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected one terminal event in {:?}", events);
    assert!(
        events.last().map(|e| e.is_terminal()).unwrap_or(false),
        "terminal event must be last in {:?}",
        events
    );
}

async fn role_count(pool: &DbPool, role: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE role = ?")
        .bind(role)
        .fetch_one(pool)
        .await
        .expect("count query");
    count
}

#[tokio::test]
async fn test_success_flow_persists_and_ends_cleanly() {
    let (_dir, state) = test_state(5).await;
    let source = injected(vec![ChatEvent::chunk("Hello "), ChatEvent::chunk("world")]);

    let events = collect(stream_chat_with_source(state.clone(), request(1), source)).await;

    assert!(matches!(events.first(), Some(ChatEvent::Start { .. })));
    assert_single_terminal_last(&events);

    let chunks: Vec<&ChatEvent> = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::Chunk { .. }))
        .collect();
    assert_eq!(
        chunks,
        vec![&ChatEvent::chunk("Hello "), &ChatEvent::chunk("world")]
    );

    let message_id = match events.last() {
        Some(ChatEvent::End { message_id }) => message_id.expect("message id in End"),
        other => panic!("expected End, got {:?}", other),
    };

    let message = messages::get_message(&state.db, message_id)
        .await
        .expect("fetch message")
        .expect("message exists");
    assert_eq!(message.role, "assistant");
    assert_eq!(message.content, "Hello world");
    assert!(message.thinking.is_none());

    assert_eq!(role_count(&state.db, "user").await, 1);
    assert_eq!(role_count(&state.db, "assistant").await, 1);
}

#[tokio::test]
async fn test_full_text_replay_replaces_instead_of_doubling() {
    let (_dir, state) = test_state(5).await;
    // Bespoke upstreams re-send the complete text as their final chunk.
    let source = injected(vec![ChatEvent::chunk("Hi"), ChatEvent::chunk("Hi there")]);

    let events = collect(stream_chat_with_source(state.clone(), request(1), source)).await;
    let message_id = match events.last() {
        Some(ChatEvent::End { message_id }) => message_id.expect("message id"),
        other => panic!("expected End, got {:?}", other),
    };

    let message = messages::get_message(&state.db, message_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(message.content, "Hi there");
}

#[tokio::test]
async fn test_thinking_tags_split_out_at_finalize() {
    let (_dir, state) = test_state(5).await;
    let source = injected(vec![
        ChatEvent::chunk("<think>check the docs</think>"),
        ChatEvent::chunk("The answer is 42."),
    ]);

    let events = collect(stream_chat_with_source(state.clone(), request(1), source)).await;
    assert_single_terminal_last(&events);

    let thinking_pos = events
        .iter()
        .position(|e| matches!(e, ChatEvent::Thinking { .. }))
        .expect("late thinking event emitted");
    assert!(thinking_pos < events.len() - 1, "thinking precedes terminal");

    let message_id = match events.last() {
        Some(ChatEvent::End { message_id }) => message_id.expect("message id"),
        other => panic!("expected End, got {:?}", other),
    };
    let message = messages::get_message(&state.db, message_id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(message.content, "The answer is 42.");
    assert_eq!(message.thinking.as_deref(), Some("check the docs"));
}

#[tokio::test]
async fn test_upstream_error_with_no_content_cleans_draft() {
    let (_dir, state) = test_state(5).await;
    let source = injected(vec![ChatEvent::error("boom")]);

    let events = collect(stream_chat_with_source(state.clone(), request(1), source)).await;

    assert_single_terminal_last(&events);
    match events.last() {
        Some(ChatEvent::Error { message }) => {
            assert_eq!(message, "系统内部错误，请稍后重试");
        }
        other => panic!("expected Error, got {:?}", other),
    }

    // The draft is gone; the user's message survives.
    assert_eq!(role_count(&state.db, "assistant").await, 0);
    assert_eq!(role_count(&state.db, "user").await, 1);
}

#[tokio::test]
async fn test_failure_after_chunks_still_cleans_unpersisted_draft() {
    let (_dir, state) = test_state(5).await;
    let source = injected(vec![
        ChatEvent::chunk("partial answer"),
        ChatEvent::error("connection interrupted mid-stream"),
    ]);

    let events = collect(stream_chat_with_source(state.clone(), request(1), source)).await;

    assert_single_terminal_last(&events);
    assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
    assert_eq!(role_count(&state.db, "assistant").await, 0);
}

#[tokio::test]
async fn test_request_timeout_emits_timeout_error_and_cleans_up() {
    let (_dir, state) = test_state(1).await;
    let source = UpstreamSource::Injected(stream::pending().boxed());

    let events = collect(stream_chat_with_source(state.clone(), request(1), source)).await;

    assert_single_terminal_last(&events);
    match events.last() {
        Some(ChatEvent::Error { message }) => assert_eq!(message, "请求超时，请稍后重试"),
        other => panic!("expected timeout Error, got {:?}", other),
    }
    assert_eq!(role_count(&state.db, "assistant").await, 0);
}

#[tokio::test]
async fn test_side_channel_events_merge_before_terminal() {
    let (_dir, state) = test_state(5).await;
    let (up_tx, up_rx) = tokio::sync::mpsc::channel(8);
    let source = UpstreamSource::Injected(ReceiverStream::new(up_rx).boxed());

    let mut events = Box::pin(stream_chat_with_source(state.clone(), request(5), source));
    assert!(matches!(events.next().await, Some(ChatEvent::Start { .. })));

    // The side channel is open for the whole request lifetime; collaborators
    // publish by conversation id alone.
    assert!(state.publisher.publish(5, ChatEvent::search("searching")).await);
    state
        .publisher
        .publish_search_results(
            5,
            vec![SearchResult {
                title: "t".into(),
                content: "c".into(),
                url: None,
                score: None,
            }],
        )
        .await;

    up_tx
        .send(ChatEvent::chunk("answer"))
        .await
        .expect("upstream open");
    drop(up_tx);

    let rest = collect(events).await;
    assert_single_terminal_last(&rest);
    assert!(rest.iter().any(|e| matches!(e, ChatEvent::Search { .. })));
    assert!(rest
        .iter()
        .any(|e| matches!(e, ChatEvent::SearchResults { .. })));
    assert!(rest.contains(&ChatEvent::chunk("answer")));
    assert!(matches!(rest.last(), Some(ChatEvent::End { .. })));
}

#[tokio::test]
async fn test_client_disconnect_cancels_and_cleans_up() {
    let (_dir, state) = test_state(30).await;
    let (up_tx, up_rx) = tokio::sync::mpsc::channel(8);
    let source = UpstreamSource::Injected(ReceiverStream::new(up_rx).boxed());

    let mut events = Box::pin(stream_chat_with_source(state.clone(), request(9), source));
    assert!(matches!(events.next().await, Some(ChatEvent::Start { .. })));

    up_tx
        .send(ChatEvent::chunk("first"))
        .await
        .expect("upstream open");

    // Client walks away mid-stream.
    drop(events);

    // Keep producing until the reader cancels the upstream subscription.
    for _ in 0..100 {
        if up_tx.send(ChatEvent::chunk("more")).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if role_count(&state.db, "assistant").await == 0 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("draft was not cleaned up after client disconnect");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_second_stream_silently_replaces_side_channel() {
    let (_dir, state) = test_state(5).await;

    let (tx_a, rx_a) = tokio::sync::mpsc::channel(8);
    let mut stream_a = Box::pin(stream_chat_with_source(
        state.clone(),
        request(3),
        UpstreamSource::Injected(ReceiverStream::new(rx_a).boxed()),
    ));
    assert!(matches!(stream_a.next().await, Some(ChatEvent::Start { .. })));

    let (tx_b, rx_b) = tokio::sync::mpsc::channel(8);
    let mut stream_b = Box::pin(stream_chat_with_source(
        state.clone(),
        request(3),
        UpstreamSource::Injected(ReceiverStream::new(rx_b).boxed()),
    ));
    assert!(matches!(stream_b.next().await, Some(ChatEvent::Start { .. })));

    // The registry entry now belongs to the second stream.
    assert!(state.publisher.publish(3, ChatEvent::search("for-b")).await);

    tx_b.send(ChatEvent::chunk("b")).await.expect("b open");
    drop(tx_b);
    let rest_b = collect(stream_b).await;
    assert!(rest_b.contains(&ChatEvent::search("for-b")));
    assert_single_terminal_last(&rest_b);

    // B's teardown removed the entry; late publishes go nowhere.
    assert!(!state.publisher.publish(3, ChatEvent::search("late")).await);

    tx_a.send(ChatEvent::chunk("a")).await.expect("a open");
    drop(tx_a);
    let rest_a = collect(stream_a).await;
    assert!(!rest_a.iter().any(|e| matches!(e, ChatEvent::Search { .. })));
    assert_single_terminal_last(&rest_a);
    assert!(matches!(rest_a.last(), Some(ChatEvent::End { .. })));
}
