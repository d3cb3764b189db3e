use anyhow::Context;
use medic_core::ResponderConfig;
use medic_server::{app_state, reasoning_service, webhook};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("MEDIC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("lambda-medic.toml"));
    let config = ResponderConfig::load(Some(&config_path))
        .with_context(|| format!("loading {}", config_path.display()))?;
    let bind = std::env::var("MEDIC_BIND").unwrap_or_else(|_| "0.0.0.0:8080".into());

    let reasoning = reasoning_service(&config);
    let state = app_state(config, reasoning).context("opening incident database")?;

    // Incidents left open by a previous run.
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.process_open().await {
            Ok(reports) => tracing::info!(count = reports.len(), "recovered open incidents"),
            Err(err) => tracing::error!(error = %err, "could not list open incidents"),
        }
    });

    let app = webhook::webhook_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;

    tracing::info!(%bind, "lambda-medic listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
