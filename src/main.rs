mod api;
mod cache;
mod command;
mod config;
mod error;
mod metrics;
mod models;
mod sandbox;
mod session;
mod stream;

use std::{net::SocketAddr, sync::Arc};

use crate::{
    cache::DependencyCache, config::EngineConfig, metrics::MetricsRegistry,
    sandbox::ProvisionerFactory, session::SessionManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let metrics = Arc::new(MetricsRegistry::new());
    let cache = Arc::new(DependencyCache::new(config.cache_root.clone()));
    let provisioner = ProvisionerFactory::from_config(&config);
    tracing::info!(backend = provisioner.backend(), "sandbox backend selected");

    let manager = SessionManager::new(provisioner, cache, metrics.clone(), config.clone());
    let app = api::routes(manager, metrics);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, "code execution engine ready");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
