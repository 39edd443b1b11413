use std::sync::Arc;

use anyhow::Context;
use signalhub_infra::{AppConfig, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal outside development.
    let _ = dotenvy::dotenv();
    signalhub_observability::init();

    let config = AppConfig::load().context("failed to load configuration")?;
    config.require_sources().context("no sources to ingest")?;
    let bind = config.api.bind.clone();

    let services = Arc::new(build_services(config).await?);

    let lanes = {
        let services = services.clone();
        tokio::task::spawn_blocking(move || services.spawn_lanes())
            .await
            .context("lane startup panicked")??
    };
    tracing::info!(lanes = ?lanes.names(), "background lanes running");

    let app = signalhub_api::app::build_app(services);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tokio::task::spawn_blocking(move || lanes.shutdown())
        .await
        .context("lane shutdown panicked")?;
    Ok(())
}

async fn build_services(config: AppConfig) -> anyhow::Result<Services> {
    match config.store.database_url.clone() {
        #[cfg(feature = "postgres")]
        Some(url) => Ok(Services::postgres(config, &url).await?),
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("DATABASE_URL is set but this build has no postgres support"),
        None => {
            tracing::warn!("no database configured; using the in-memory store");
            Ok(Services::in_memory(config))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
