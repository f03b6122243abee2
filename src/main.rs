use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = docgate::config::Cli::parse();
    run_server(cli.config).await
}

async fn run_server(config: docgate::config::Config) -> Result<()> {
    config.validate()?;

    let tenants = docgate::tenant::TenantResolver::new(&config.account_mapper)?;

    let http = reqwest::Client::builder()
        .user_agent(format!("docgate/{}", docgate::version::VERSION))
        .timeout(config.shard_timeout())
        .build()?;

    let usage = docgate::usage::spawn_usage_reporter(
        docgate::usage::UsageReporterConfig {
            managers: config.managers.clone(),
            secret: config.secret.clone(),
            flush_interval: config.usage_flush_interval(),
        },
        http.clone(),
    );

    let resolver = docgate::schema::ManagerCollectionResolver::new(
        config.managers.clone(),
        config.secret.clone(),
        http.clone(),
    );
    let engine = docgate::gather::ScatterGather::new(
        config.servers.clone(),
        http,
        Arc::new(resolver),
        usage.clone(),
    );

    if config.managers.is_empty() {
        warn!("no managers configured: collection lookups will fail and usage is discarded");
    }

    let shards = engine.shard_count();
    let app = docgate::http::build_router(Arc::new(engine), Arc::new(tenants))
        .layer(TraceLayer::new_for_http());

    info!(bind = %config.bind, shards, managers = config.managers.len(), "starting docgate");
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    match usage.stop().await {
        Ok(outcome) => info!(entries = outcome.report.len(), "final usage report flushed"),
        Err(err) => warn!(%err, "final usage report failed"),
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
