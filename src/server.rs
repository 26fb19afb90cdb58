//! Thin HTTP edge: one SSE stream route plus the provider/model catalog.
//! Everything interesting happens in `streaming`; this file only adapts
//! [`ChatEvent`]s onto the wire.

use crate::streaming::{self, StreamChatRequest};
use crate::types::ModelInfo;
use crate::AppState;
use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat/stream", post(stream_chat_handler))
        .route("/api/models", get(models_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn stream_chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StreamChatRequest>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let events = streaming::stream_chat(state, request);
    let stream = events.map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| {
            r#"{"type":"error","data":{"message":"serialization failure"}}"#.to_string()
        });
        Ok(SseEvent::default().data(payload))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(serde::Serialize)]
struct ProviderCatalogEntry {
    name: String,
    available: bool,
    models: Vec<ModelInfo>,
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderCatalogEntry>> {
    let mut entries: Vec<ProviderCatalogEntry> = state
        .registry
        .all()
        .map(|handle| ProviderCatalogEntry {
            name: handle.name.clone(),
            available: handle.is_available(),
            models: handle.available_models(),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Json(entries)
}
