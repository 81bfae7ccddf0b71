//! recurring-service binary.

use recurring_service::config::RecurringConfig;
use recurring_service::services::init_metrics;
use recurring_service::startup::Application;

use service_core::observability::init_tracing;
use std::fmt::Display;
use tokio::signal;

fn startup_error(stage: &str, e: impl Display) -> std::io::Error {
    std::io::Error::other(format!("{} error: {}", stage, e))
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, signal = "SIGINT", "Signal handler unavailable");
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
                tracing::error!(error = %e, signal = "SIGTERM", "Signal handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
    tracing::info!("Stopping scheduler and HTTP server");
}

fn log_settings(config: &RecurringConfig) {
    tracing::info!(
        service_name = %config.service_name,
        version = %config.service_version,
        environment = %config.common.environment,
        http_port = config.common.port,
        otlp_endpoint = ?config.otlp_endpoint,
        db_pool = %format!("{}..{}", config.database.min_connections, config.database.max_connections),
        generation_enabled = config.generation.enabled,
        generation_interval_secs = config.generation.interval_secs,
        generation_concurrency = config.generation.concurrency,
        "recurring-service starting"
    );
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = RecurringConfig::from_env().map_err(|e| {
        eprintln!("recurring-service: invalid configuration: {}", e);
        startup_error("Configuration", e)
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics();
    log_settings(&config);

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Application could not be built");
        startup_error("Application build", e)
    })?;

    app.run_until_stopped(shutdown_signal()).await.inspect_err(|e| {
        tracing::error!(error = %e, "Server exited with an error");
    })?;

    tracing::info!("recurring-service stopped");
    Ok(())
}
