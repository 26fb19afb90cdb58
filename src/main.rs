use chatflow::config::AppConfig;
use chatflow::main_helper::{AppState, Args};
use chatflow::publisher::EventPublisher;
use chatflow::registry::ProviderRegistry;
use chatflow::types::ChatflowError;
use chatflow::{db, logging, server};
use clap::Parser;
use colored::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> chatflow::types::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _log_guard = logging::init(args.log_file.as_deref())?;
    logging::setup_panic_hook();

    let config = Arc::new(AppConfig::load(&args.config)?);
    let db = db::init_db(&args.database).await?;
    let registry = Arc::new(ProviderRegistry::from_config(&config));

    for handle in registry.all() {
        let status = if handle.is_available() {
            "available".green()
        } else {
            "unavailable (no api key)".red()
        };
        println!("provider {:<12} [{:?}] {}", handle.name, handle.dialect, status);
    }
    tracing::warn!("no search backend configured; search-enabled requests will skip search");

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs))
        .build()
        .map_err(ChatflowError::Network)?;

    let publisher = Arc::new(EventPublisher::new(config.streaming.channel_capacity));
    let state = Arc::new(AppState {
        client,
        db,
        config: config.clone(),
        registry,
        publisher,
        search: None,
    });

    let app = server::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("chatflow listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(ChatflowError::Io)?;
    axum::serve(listener, app).await.map_err(ChatflowError::Io)?;
    Ok(())
}
