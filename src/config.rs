use crate::adapters::Dialect;
use crate::types::{ChatflowError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Process configuration, loaded once at startup from a JSON file. API keys
/// are never stored in the file; each provider names the env var holding its
/// key and we resolve it at call time (dotenvy populates the environment).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub default_provider: String,
    #[serde(default)]
    pub defaults: ModelDefaults,
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    pub api_key_env: String,
    pub dialect: Dialect,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_thinking: bool,
    /// GreatWall routes each model through a named serving run.
    #[serde(default)]
    pub api_run_id: Option<String>,
    #[serde(default)]
    pub tpuid_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDefaults {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_stream_lines")]
    pub max_stream_lines: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
    #[serde(default = "default_open_retry_attempts")]
    pub open_retry_attempts: u32,
    #[serde(default = "default_open_retry_base_delay_ms")]
    pub open_retry_base_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            max_stream_lines: default_max_stream_lines(),
            history_limit: default_history_limit(),
            open_retry_attempts: default_open_retry_attempts(),
            open_retry_base_delay_ms: default_open_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: i64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            max_results: default_max_results(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_response_timeout_secs() -> u64 {
    120
}
fn default_channel_capacity() -> usize {
    256
}
fn default_max_stream_lines() -> usize {
    100_000
}
fn default_history_limit() -> i64 {
    20
}
fn default_open_retry_attempts() -> u32 {
    3
}
fn default_open_retry_base_delay_ms() -> u64 {
    200
}
fn default_max_tool_calls() -> i64 {
    3
}
fn default_max_results() -> usize {
    5
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(ChatflowError::Io)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        if !config.providers.contains_key(&config.default_provider) {
            return Err(ChatflowError::Config(format!(
                "default provider '{}' is not configured",
                config.default_provider
            ))
            .into());
        }
        Ok(config)
    }

    /// Resolve the API key for a provider from the environment. Empty values
    /// count as absent so a blank line in .env does not mark a provider live.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        let cfg = self.providers.get(provider)?;
        match std::env::var(&cfg.api_key_env) {
            Ok(v) if !v.trim().is_empty() => Some(v),
            _ => None,
        }
    }
}
