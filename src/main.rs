use anyhow::Context;
use knowledge_substrate::{
    api::{build_router, AppState},
    archive::Archive,
    clock::SystemClock,
    config::Config,
    telemetry::init_tracing,
    truth::StaticReliability,
    Substrate,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::load().context("loading configuration")?,
    };
    init_tracing(&config.logging)?;

    let archive_path = config.server.archive_path.clone();
    let substrate = match archive_path.as_deref() {
        Some(path) if Path::new(path).exists() => {
            info!("Restoring archive from {}", path);
            let archive = Archive::read_from(path)?;
            Substrate::from_archive(
                config.clone(),
                Arc::new(SystemClock),
                Arc::new(StaticReliability::new()),
                archive,
            )?
        }
        _ => Substrate::new(config.clone())?,
    };
    let substrate = Arc::new(substrate);

    let state = AppState::new(substrate.clone());
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Knowledge substrate listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if let Some(path) = archive_path {
        substrate.archive().write_to(&path)?;
    }
    info!("Shut down");
    Ok(())
}
