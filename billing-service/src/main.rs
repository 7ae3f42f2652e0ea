//! Billing Service entry point.

use billing_service::config::BillingConfig;
use billing_service::startup::Application;
use service_core::observability::init_tracing;
use tokio::signal;

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
}

fn log_configuration(config: &BillingConfig) {
    tracing::info!(
        service_name = %config.service_name,
        version = %config.service_version,
        http_port = config.common.port,
        store = if config.database.is_some() { "postgres" } else { "memory" },
        db_max_connections = ?config.database.as_ref().map(|d| d.max_connections),
        currency = %config.pricing.currency,
        extra_hour_price_minor_units = config.pricing.extra_hour_price_minor_units,
        dedup_window_seconds = config.notifications.dedup_window_seconds,
        usage_policy = ?config.policies.usage,
        rollover_policy = ?config.policies.rollover,
        otlp_endpoint = ?config.otlp_endpoint,
        "Configuration loaded"
    );
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = BillingConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    log_configuration(&config);

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    app.run_until(shutdown_signal()).await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}
