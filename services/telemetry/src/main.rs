use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_service::{
    start_api_server, AppState, Config, Ingestor, JwtVerifier, MemoryStatusStore, PgStatusStore,
    StatusStore, UploadStore,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Fleet Telemetry Service"
    );

    init_metrics(config.service.metrics_port)?;

    let statuses: Arc<dyn StatusStore> = match &config.database {
        Some(database) => {
            let store = PgStatusStore::new(database)
                .await
                .context("Failed to initialize status store")?;

            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Arc::new(store)
        }
        None => {
            warn!("No database configured, statuses are kept in memory only");
            Arc::new(MemoryStatusStore::new())
        }
    };

    let uploads = Arc::new(UploadStore::new(&config.storage));
    uploads
        .init()
        .await
        .context("Failed to initialize uploads root")?;

    let state = AppState {
        ingestor: Arc::new(Ingestor::new(uploads.clone(), statuses.clone())),
        statuses,
        uploads,
        jwt: Arc::new(JwtVerifier::new(&config.auth.jwt_secret)),
    };

    info!("Telemetry service started successfully");

    if let Err(e) = start_api_server(state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("Telemetry service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down telemetry service");
}
