pub mod adapters;
pub mod classifier;
pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod main_helper;
pub mod messages;
pub mod publisher;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod search;
pub mod server;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
