//! alertdesk -- management backend for ElastAlert rules.
//!
//! This crate provides the rule-test pipeline (staging, engine subprocess,
//! live output and host telemetry), rule silencing, and the HTTP/WebSocket
//! API that exposes them.

pub mod api;
pub mod config;
pub mod ruletest;
pub mod silence;

use anyhow::{Context, Result};

use crate::config::AppConfig;

/// Start the alertdesk server and run until Ctrl-C.
pub async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!(data_dir = %config.server.data_dir.display(), "initializing rule tester");
    let tester = ruletest::RuleTester::from_config(&config).await;
    let state = api::state::AppState::new(tester, silence::SilenceRegistry::new());

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "alertdesk listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("alertdesk stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
