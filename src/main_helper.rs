use crate::config::AppConfig;
use crate::db::DbPool;
use crate::publisher::EventPublisher;
use crate::registry::ProviderRegistry;
use crate::search::SearchBackend;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "chatflow.db")]
    pub database: String,
    #[arg(long, default_value = "chatflow.json")]
    pub config: String,
    #[arg(long)]
    pub log_file: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub db: DbPool,
    pub config: Arc<AppConfig>,
    pub registry: Arc<ProviderRegistry>,
    pub publisher: Arc<EventPublisher>,
    pub search: Option<Arc<dyn SearchBackend>>,
}
