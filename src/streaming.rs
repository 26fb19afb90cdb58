//! The per-request stream orchestrator. One request moves through
//! draft → stream → finalize, with a failure branch that tears down whatever
//! was half-built. The client sees: one synthetic `start`, side-channel
//! search events merged as they arrive, the provider's normalized token
//! events, and exactly one terminal `end` or `error` — always last.

use crate::adapters;
use crate::classifier;
use crate::db::DbPool;
use crate::ledger;
use crate::messages::{self, WireMessage};
use crate::resolver;
use crate::retry::RetryPolicy;
use crate::search;
use crate::types::{ChatEvent, ChatflowError, ModelSelection, RequestId, Result};
use crate::AppState;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StreamChatRequest {
    pub conversation_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub message: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub search_enabled: bool,
    #[serde(default)]
    pub deep_thinking: bool,
}

/// In-memory state for one request. `persisted` flips when the finalize
/// write lands; the failure branch consults it to decide whether the draft
/// is garbage.
struct StreamSession {
    draft_message_id: Option<i64>,
    content: String,
    thinking: String,
    persisted: bool,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            draft_message_id: None,
            content: String::new(),
            thinking: String::new(),
            persisted: false,
        }
    }
}

/// Where the normalized event sequence comes from. Tests inject a fixed
/// sequence; production opens the resolved provider.
pub enum UpstreamSource {
    Provider,
    Injected(BoxStream<'static, ChatEvent>),
}

pub fn stream_chat(
    state: Arc<AppState>,
    request: StreamChatRequest,
) -> impl Stream<Item = ChatEvent> {
    stream_chat_with_source(state, request, UpstreamSource::Provider)
}

pub fn stream_chat_with_source(
    state: Arc<AppState>,
    request: StreamChatRequest,
    source: UpstreamSource,
) -> impl Stream<Item = ChatEvent> {
    let capacity = state.config.streaming.channel_capacity;
    let conversation_id = request.conversation_id;

    let (out_tx, out_rx) = mpsc::channel(capacity);

    // Register (or silently replace) the conversation's side channel and
    // start merging it before anything else can run.
    let side_rx = state.publisher.register(conversation_id);
    let forwarder = tokio::spawn(forward_side_events(side_rx, out_tx.clone()));

    tokio::spawn(drive(state, request, source, out_tx, forwarder));

    ReceiverStream::new(out_rx)
}

async fn forward_side_events(
    mut side_rx: mpsc::Receiver<ChatEvent>,
    out_tx: mpsc::Sender<ChatEvent>,
) {
    while let Some(event) = side_rx.recv().await {
        if out_tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn drive(
    state: Arc<AppState>,
    request: StreamChatRequest,
    source: UpstreamSource,
    out_tx: mpsc::Sender<ChatEvent>,
    forwarder: tokio::task::JoinHandle<()>,
) {
    let conversation_id = request.conversation_id;
    let request_id = RequestId::new();
    let started = std::time::Instant::now();

    tracing::info!(
        "chat start cid={} req={} len={} search={} think={} user={:?} model={:?}->{:?}",
        conversation_id,
        request_id.short(),
        request.message.len(),
        request.search_enabled,
        request.deep_thinking,
        request.user_id,
        request.provider,
        request.model
    );

    let _ = out_tx.send(ChatEvent::start("processing")).await;

    let mut session = StreamSession::new();
    let mut metric = crate::logging::StreamMetric::new();
    let timeout = Duration::from_secs(state.config.streaming.response_timeout_secs);

    let outcome = match tokio::time::timeout(
        timeout,
        run_pipeline(&state, &request, source, &mut session, &out_tx, &mut metric),
    )
    .await
    {
        Ok(result) => result,
        Err(elapsed) => Err(ChatflowError::Timeout(elapsed).into()),
    };

    // Close and drain the side channel first so the terminal event below is
    // the last thing the client ever sees on this stream.
    state.publisher.remove(conversation_id);
    let _ = forwarder.await;

    match outcome {
        Ok(message_id) => {
            let _ = out_tx.send(ChatEvent::end(Some(message_id))).await;
            tracing::info!(
                "chat done cid={} req={} in {:?}",
                conversation_id,
                request_id.short(),
                started.elapsed()
            );
        }
        Err(err) => {
            if !session.persisted {
                cleanup_failed_draft(&state.db, session.draft_message_id).await;
            }
            let classification = classifier::classify(Some(&err.inner));
            tracing::error!(
                "chat failed cid={} req={} kind={:?} retryable={} err={}",
                conversation_id,
                request_id.short(),
                classification.kind,
                classification.retryable,
                err.inner
            );
            let _ = out_tx
                .send(ChatEvent::error(classification.user_message))
                .await;
        }
    }

    metric.log_summary(&request_id);
}

async fn run_pipeline(
    state: &Arc<AppState>,
    request: &StreamChatRequest,
    source: UpstreamSource,
    session: &mut StreamSession,
    out_tx: &mpsc::Sender<ChatEvent>,
    metric: &mut crate::logging::StreamMetric,
) -> Result<i64> {
    let pool = &state.db;
    let conversation_id = request.conversation_id;

    // Resolution runs before anything persists: a configuration failure here
    // leaves nothing to clean up.
    let selection = resolver::resolve(
        &state.registry,
        pool,
        request.user_id,
        request.provider.as_deref(),
        request.model.as_deref(),
    )
    .await?;
    tracing::info!(
        "model selected cid={} provider={} model={}",
        conversation_id,
        selection.provider,
        selection.model
    );

    messages::ensure_conversation(pool, conversation_id, request.user_id.unwrap_or(0)).await?;

    // Title generation never blocks the stream.
    {
        let pool = pool.clone();
        let first_message = request.message.clone();
        tokio::spawn(async move {
            messages::generate_title_if_needed(&pool, conversation_id, &first_message).await;
        });
    }

    messages::save_user_message(pool, conversation_id, &request.message).await?;

    // The draft exists before any provider byte so mid-stream tool calls can
    // reference a real message id.
    let draft_id = messages::create_draft_message(pool, conversation_id).await?;
    session.draft_message_id = Some(draft_id);

    let mut search_context = None;
    if request.search_enabled {
        match state.search.as_ref() {
            Some(backend) => {
                let results = search::run_web_search(
                    pool,
                    &state.publisher,
                    backend.as_ref(),
                    &state.config.search,
                    conversation_id,
                    draft_id,
                    &request.message,
                )
                .await;
                if !results.is_empty() {
                    search_context = Some(search::results_to_context(&results));
                }
            }
            None => tracing::warn!("search requested but no backend configured; skipping"),
        }
    }

    let wire_messages = build_wire_messages(
        pool,
        conversation_id,
        search_context,
        state.config.streaming.history_limit,
    )
    .await?;

    let events = match source {
        UpstreamSource::Injected(stream) => stream,
        UpstreamSource::Provider => open_upstream(state, &selection, request, wire_messages).await?,
    };

    consume(
        events,
        session,
        out_tx,
        metric,
        state.config.streaming.channel_capacity,
    )
    .await?;

    finalize(pool, session, out_tx, draft_id).await
}

async fn build_wire_messages(
    pool: &DbPool,
    conversation_id: i64,
    search_context: Option<String>,
    history_limit: i64,
) -> Result<Vec<WireMessage>> {
    let mut wire = Vec::new();
    if let Some(context) = search_context {
        wire.push(WireMessage {
            role: "system".to_string(),
            content: context,
        });
    }
    wire.extend(messages::recent_history(pool, conversation_id, history_limit).await?);
    Ok(wire)
}

async fn open_upstream(
    state: &Arc<AppState>,
    selection: &ModelSelection,
    request: &StreamChatRequest,
    wire_messages: Vec<WireMessage>,
) -> Result<BoxStream<'static, ChatEvent>> {
    let handle = state.registry.get(&selection.provider).ok_or_else(|| {
        ChatflowError::Config(format!("unknown provider '{}'", selection.provider))
    })?;
    let options = handle.chat_options(&selection.model, request.deep_thinking, &state.config.defaults);

    let policy = RetryPolicy::new(
        state.config.streaming.open_retry_attempts,
        state.config.streaming.open_retry_base_delay_ms,
    );
    let lines = policy
        .execute_with_retry(|| {
            handle.open_stream(&state.client, &selection.model, &wire_messages, &options)
        })
        .await?;

    Ok(adapters::normalize(
        handle.dialect,
        lines,
        state.config.streaming.max_stream_lines,
    )
    .boxed())
}

/// Hot fan-out: one reader pulls the normalized sequence and pushes every
/// event into two bounded channels — the client pass-through and the
/// persistence accumulator. Both are attached before the first poll, so each
/// sees every event exactly once, in arrival order, off a single upstream
/// call.
async fn consume(
    events: BoxStream<'static, ChatEvent>,
    session: &mut StreamSession,
    out_tx: &mpsc::Sender<ChatEvent>,
    metric: &mut crate::logging::StreamMetric,
    capacity: usize,
) -> Result<()> {
    let (display_tx, display_rx) = mpsc::channel::<ChatEvent>(capacity);
    let (accum_tx, mut accum_rx) = mpsc::channel::<ChatEvent>(capacity);

    let reader = tokio::spawn(async move {
        let mut events = events;
        while let Some(event) = events.next().await {
            let display_alive = display_tx.send(event.clone()).await.is_ok();
            let _ = accum_tx.send(event).await;
            if !display_alive {
                // Client gone: cancel the upstream subscription instead of
                // streaming into the void.
                break;
            }
        }
    });

    let pass_through = {
        let mut display_rx = display_rx;
        let out_tx = out_tx.clone();
        async move {
            while let Some(event) = display_rx.recv().await {
                match &event {
                    ChatEvent::Chunk { .. } | ChatEvent::Thinking { .. } => {
                        if out_tx.send(event.clone()).await.is_err() {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            true
        }
    };

    let accumulate = async {
        let mut upstream_error: Option<String> = None;
        while let Some(event) = accum_rx.recv().await {
            metric.record(&event);
            match event {
                ChatEvent::Chunk { content } => {
                    // Bespoke upstreams may replay the complete text as a
                    // final chunk; a chunk that extends the whole buffer
                    // replaces it instead of doubling it.
                    if !session.content.is_empty() && content.starts_with(&session.content) {
                        session.content = content;
                    } else {
                        session.content.push_str(&content);
                    }
                }
                ChatEvent::Thinking { content } => session.thinking.push_str(&content),
                ChatEvent::Error { message } => upstream_error = Some(message),
                _ => {}
            }
        }
        upstream_error
    };

    let (client_connected, upstream_error) = tokio::join!(pass_through, accumulate);
    let _ = reader.await;

    if let Some(message) = upstream_error {
        return Err(ChatflowError::Upstream(
            axum::http::StatusCode::BAD_GATEWAY,
            message,
        )
        .into());
    }
    if !client_connected {
        return Err(ChatflowError::internal("client disconnected before stream completed").into());
    }
    Ok(())
}

async fn finalize(
    pool: &DbPool,
    session: &mut StreamSession,
    out_tx: &mpsc::Sender<ChatEvent>,
    draft_id: i64,
) -> Result<i64> {
    let (tag_thinking, content) = messages::extract_thinking_parts(&session.content);

    let mut thinking = session.thinking.trim().to_string();
    if let Some(tag) = &tag_thinking {
        if !thinking.is_empty() {
            thinking.push_str("\n\n");
        }
        thinking.push_str(tag);
    }
    let thinking_opt = if thinking.is_empty() {
        None
    } else {
        Some(thinking.as_str())
    };

    messages::update_message_content(pool, draft_id, &content, thinking_opt).await?;
    session.persisted = true;

    // Tag-extracted thinking was never streamed; surface it once, before the
    // terminal event.
    if let Some(tag) = tag_thinking {
        let _ = out_tx.send(ChatEvent::thinking(tag)).await;
    }

    Ok(draft_id)
}

/// Best-effort removal of a draft that never got content: ledger rows first,
/// then the message row. Each failure is logged and swallowed.
async fn cleanup_failed_draft(pool: &DbPool, draft_message_id: Option<i64>) {
    let draft_id = match draft_message_id {
        Some(id) => id,
        None => return,
    };

    if let Err(e) = ledger::delete_by_message_id(pool, draft_id).await {
        tracing::warn!("tool record cleanup failed for message {}: {}", draft_id, e);
    }
    match messages::delete_message(pool, draft_id).await {
        Ok(()) => tracing::info!("cleaned up draft message {} after failed stream", draft_id),
        Err(e) => tracing::warn!("draft cleanup failed for message {}: {}", draft_id, e),
    }
}
