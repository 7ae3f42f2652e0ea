//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::handlers::{client, health, manager};
use crate::services::{
    init_metrics, BillingServices, BillingSettings, BillingStore, Clock, Database, MemoryStore,
    MockPaymentGateway, PaymentGateway, StripeGateway, SystemClock,
};
use axum::{middleware, routing::get, Router};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: BillingServices,
    pub clock: Arc<dyn Clock>,
}

/// Full HTTP surface: probes, metrics and the client and manager APIs.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .nest("/api/client", client::routes())
        .nest("/api/manager", manager::routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn BillingStore> = match &config.database {
            Some(db_config) => {
                let db = Database::new(
                    db_config.url.expose_secret(),
                    db_config.max_connections,
                    db_config.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("No database configured, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let stripe = StripeGateway::new(config.stripe.clone());
        let gateway: Arc<dyn PaymentGateway> = if stripe.is_configured() {
            Arc::new(stripe)
        } else {
            tracing::warn!("STRIPE_SECRET_KEY not set, charges go to the mock gateway");
            Arc::new(MockPaymentGateway::new())
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let services = BillingServices::new(
            store,
            gateway,
            clock.clone(),
            BillingSettings::from(&config),
        );
        let state = AppState { services, clock };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn services(&self) -> &BillingServices {
        &self.state.services
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state);

        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
