pub mod config;
pub mod db;
pub mod error;
pub mod ident;
pub mod models;
pub mod pagination;
pub mod query;
pub mod registry;
pub mod server;
pub mod sql;
pub mod sqlite;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the insights service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
