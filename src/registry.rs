//! Provider registry: the configured upstream providers, their model
//! catalogs, and the dialect-specific request plumbing that opens one
//! streaming call and hands back a framed line stream.

use crate::adapters::Dialect;
use crate::config::{AppConfig, ModelConfig, ModelDefaults};
use crate::messages::WireMessage;
use crate::types::{ChatflowError, ModelInfo, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use uuid::Uuid;

const MAX_LINE_BYTES: usize = 1024 * 1024;

pub type LineStream =
    Pin<Box<dyn Stream<Item = std::result::Result<String, LinesCodecError>> + Send>>;

/// Per-call tuning resolved from config defaults and the model entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub enable_thinking: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub name: String,
    pub dialect: Dialect,
    pub base_url: String,
    pub api_key_env: String,
    pub enabled: bool,
    pub read_timeout_ms: u64,
    models: Vec<ModelConfig>,
}

impl ProviderHandle {
    /// Models currently offered by this provider. Disabled entries are
    /// invisible to resolution.
    pub fn available_models(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .filter(|m| m.enabled)
            .map(|m| ModelInfo {
                name: m.name.clone(),
                display_name: m.display_name.clone(),
                supports_thinking: m.supports_thinking,
            })
            .collect()
    }

    /// A provider is live when it is enabled and its key env var resolves.
    pub fn is_available(&self) -> bool {
        self.enabled && self.api_key().is_some()
    }

    fn api_key(&self) -> Option<String> {
        match std::env::var(&self.api_key_env) {
            Ok(v) if !v.trim().is_empty() => Some(v),
            _ => None,
        }
    }

    fn model_config(&self, model: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == model)
    }

    pub fn chat_options(
        &self,
        model: &str,
        deep_thinking: bool,
        defaults: &ModelDefaults,
    ) -> ChatOptions {
        let entry = self.model_config(model);
        let temperature = entry
            .and_then(|m| m.temperature)
            .unwrap_or(defaults.temperature);
        let max_tokens = entry
            .and_then(|m| m.max_tokens)
            .unwrap_or(defaults.max_tokens);
        let supports_thinking = entry.map(|m| m.supports_thinking).unwrap_or(false);
        ChatOptions {
            temperature,
            max_tokens,
            enable_thinking: deep_thinking && supports_thinking,
        }
    }

    fn request_url(&self, model: &str) -> String {
        match self.dialect {
            Dialect::Greatwall => {
                let api_run_id = self
                    .model_config(model)
                    .and_then(|m| m.api_run_id.as_deref())
                    .unwrap_or("default");
                format!(
                    "{}/v1/ai_serve/run/{}/stream_call",
                    self.base_url.trim_end_matches('/'),
                    api_run_id
                )
            }
            Dialect::Standard | Dialect::Modelscope => format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ),
        }
    }

    fn request_body(
        &self,
        model: &str,
        messages: &[WireMessage],
        options: &ChatOptions,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        match self.dialect {
            Dialect::Greatwall => {
                body["tpuid"] = serde_json::Value::String(self.generate_tpuid(model));
                if options.enable_thinking {
                    body["enable_thinking"] = serde_json::Value::Bool(true);
                }
            }
            Dialect::Standard | Dialect::Modelscope => {
                if options.enable_thinking {
                    body["enable_thinking"] = serde_json::Value::Bool(true);
                }
            }
        }
        body
    }

    /// GreatWall tags every call with a caller-generated trace id derived
    /// from the model's configured prefix.
    fn generate_tpuid(&self, model: &str) -> String {
        let prefix = self
            .model_config(model)
            .and_then(|m| m.tpuid_prefix.as_deref())
            .unwrap_or("DefaultPrefix");
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(16).collect();
        format!("{}_{}", prefix, suffix)
    }

    /// Open one streaming call. A missing key or a non-2xx status fails here,
    /// before any line is read; body framing errors surface later through the
    /// line stream itself.
    pub async fn open_stream(
        &self,
        client: &reqwest::Client,
        model: &str,
        messages: &[WireMessage],
        options: &ChatOptions,
    ) -> Result<LineStream> {
        let api_key = match self.api_key() {
            Some(k) => k,
            None => {
                return Err(ChatflowError::Config(format!(
                    "api key for provider '{}' is not configured ({})",
                    self.name, self.api_key_env
                ))
                .into())
            }
        };

        let url = self.request_url(model);
        let body = self.request_body(model, messages, options);
        tracing::info!(
            "opening upstream stream provider={} model={} url={}",
            self.name,
            model,
            url
        );

        // The read timeout bounds connect plus response headers; the body is
        // a long-lived stream and is bounded by the orchestrator's own
        // per-request timeout instead.
        let send = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("User-Agent", "chatflow/0.1")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();
        let response = tokio::time::timeout(
            std::time::Duration::from_millis(self.read_timeout_ms),
            send,
        )
        .await
        .map_err(ChatflowError::Timeout)?
        .map_err(ChatflowError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.text().await {
                Ok(t) => truncate_body(&t),
                Err(_) => "unreadable error body".to_string(),
            };
            let status = axum::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
            return Err(ChatflowError::Upstream(
                status,
                format!("provider '{}' rejected the call: {}", self.name, detail),
            )
            .into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r: std::result::Result<Bytes, reqwest::Error>| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );
        Ok(Box::pin(lines))
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    let end = trimmed
        .char_indices()
        .nth(300)
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].to_string()
}

pub struct ProviderRegistry {
    providers: HashMap<String, ProviderHandle>,
    default_name: String,
}

impl ProviderRegistry {
    pub fn from_config(config: &AppConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(name, p)| {
                let handle = ProviderHandle {
                    name: name.clone(),
                    dialect: p.dialect,
                    base_url: p.base_url.clone(),
                    api_key_env: p.api_key_env.clone(),
                    enabled: p.enabled,
                    read_timeout_ms: p.read_timeout_ms,
                    models: p.models.clone(),
                };
                (name.to_lowercase(), handle)
            })
            .collect();
        Self {
            providers,
            default_name: config.default_provider.to_lowercase(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProviderHandle> {
        self.providers.get(&name.trim().to_lowercase())
    }

    pub fn get_default(&self) -> Option<&ProviderHandle> {
        self.providers.get(&self.default_name)
    }

    pub fn all(&self) -> impl Iterator<Item = &ProviderHandle> {
        self.providers.values()
    }
}
