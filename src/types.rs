use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Identifier for one client-facing stream request, used in logs only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- CLIENT-FACING EVENT MODEL ---

/// One entry from the web search collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Every event a client can observe on one chat stream. Serialized over SSE
/// as `{"type": ..., "data": ...}`; `chunk`/`thinking` payloads stay wrapped
/// in an object so embedded newlines survive transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    Start { message: String },
    Chunk { content: String },
    Thinking { content: String },
    Search { status: String },
    SearchResults { results: Vec<SearchResult> },
    ToolCall { tool_name: String, status: String },
    End { message_id: Option<i64> },
    Error { message: String },
}

impl ChatEvent {
    pub fn start(message: impl Into<String>) -> Self {
        Self::Start {
            message: message.into(),
        }
    }

    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::Thinking {
            content: content.into(),
        }
    }

    pub fn search(status: impl Into<String>) -> Self {
        Self::Search {
            status: status.into(),
        }
    }

    pub fn search_results(results: Vec<SearchResult>) -> Self {
        Self::SearchResults { results }
    }

    /// Tool progress published by collaborators on the side channel. The
    /// core's own flows record tool calls in the ledger instead of emitting
    /// these.
    pub fn tool_call(tool_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self::ToolCall {
            tool_name: tool_name.into(),
            status: status.into(),
        }
    }

    pub fn end(message_id: Option<i64>) -> Self {
        Self::End { message_id }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Terminal events close a stream; everything else is in-band.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// --- MODEL CATALOG ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub supports_thinking: bool,
}

/// Resolved (provider, model) pair for one request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum ChatflowError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl ChatflowError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into(), SpanTrace::capture())
    }
}

/// A `ChatflowError` plus the span trace at the point it crossed a fallible
/// boundary, so the log shows where the failure entered the pipeline.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatflowError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatflowError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            ChatflowError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            ChatflowError::Config(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "CONFIG_ERROR",
            ),
            ChatflowError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            ChatflowError::Timeout(e) => (
                axum::http::StatusCode::GATEWAY_TIMEOUT,
                e.to_string(),
                "TIMEOUT_ERROR",
            ),
            ChatflowError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            ChatflowError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            ChatflowError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            ChatflowError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
