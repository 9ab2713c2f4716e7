mod api;
mod app_state;
mod config;
mod router;
mod vault;

use app_state::AppState;
use config::{Config, LogFormat};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown signal received via Ctrl+C"),
        _ = terminate => info!("Shutdown signal received via SIGTERM"),
    }
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

/// Logs what reconciliation found and purges orphans when configured to.
async fn reconcile_storage(state: &AppState, purge: bool) {
    let report = match state.vault.reconcile().await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Storage reconciliation failed");
            return;
        }
    };

    if report.is_clean() {
        info!("Storage reconciliation found no drift");
        return;
    }

    for key in &report.orphaned_blobs {
        warn!(blob = %key, "Blob has no metadata record");
    }
    for name in &report.missing_blobs {
        warn!(stored_name = %name, "Record has no blob");
    }

    if purge {
        match state.vault.purge_orphans(&report).await {
            Ok(removed) => info!(removed, "Purged orphaned blobs"),
            Err(e) => warn!(error = %e, "Failed to purge orphaned blobs"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    init_logging(config.log_format);

    let state = match AppState::open(&config.storage).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, data_dir = %config.storage.data_dir.display(), "Failed to open vault");
            return Err(e.into());
        }
    };

    reconcile_storage(&state, config.storage.purge_orphans).await;

    let router = router::get_router(state.clone());

    let addr = config.bind_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind");
            return Err(e.into());
        }
    };

    info!(addr = %addr, max_file_size = state.vault.max_file_size(), "Listening");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    state.vault.shutdown()?;

    Ok(())
}
