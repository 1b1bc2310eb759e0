mod batch;
mod cli;
mod config;
mod crd;
mod error;
mod events;
mod handler;
mod k8s;
mod model;
mod node;
mod pod;
mod registry;
mod routes;
#[cfg(test)]
mod testing;
mod unstructured;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use cli::CliArgs;
use config::ServerConfig;
use k8s::KubeGateway;
use routes::{AppState, router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let config = ServerConfig::resolve(&args)?;
    if let Some(source) = &config.source {
        info!(path = %source, "loaded settings file");
    }

    let gateway = KubeGateway::connect(&config).await?;
    info!(
        cluster = gateway.cluster(),
        context = gateway.context(),
        default_namespace = gateway.default_namespace(),
        "connected to cluster"
    );

    let state = AppState::new(gateway.client(), &config);
    info!(
        resources = state.registry().resources().count(),
        "registered built-in resource handlers"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "kite listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
