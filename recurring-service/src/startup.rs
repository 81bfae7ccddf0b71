//! Application startup and lifecycle management.

use crate::config::{GenerationConfig, RecurringConfig};
use crate::generation::{GenerationScheduler, RecurringEngine};
use crate::services::{get_metrics, init_metrics, Database, PlanAdmissionGate};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    db: Arc<Database>,
}

/// Liveness endpoint for Docker/K8s probes.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "recurring-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Operational HTTP surface: health, readiness and metrics.
pub fn router(db: Arc<Database>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(HealthState { db })
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    db: Arc<Database>,
    engine: RecurringEngine,
    generation: GenerationConfig,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: RecurringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: RecurringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: RecurringConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let gate = Arc::new(PlanAdmissionGate::new(db.pool().clone()));
        let engine = RecurringEngine::new(db.clone(), gate)
            .with_concurrency(config.generation.concurrency);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Recurring service listener bound");

        Ok(Self {
            port,
            listener,
            db,
            engine,
            generation: config.generation,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Engine used by the periodic trigger, for on-demand runs.
    pub fn engine(&self) -> &RecurringEngine {
        &self.engine
    }

    /// Serve HTTP and drive the generation scheduler until `shutdown` resolves.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduler = if self.generation.enabled {
            let scheduler = GenerationScheduler::new(
                self.engine.clone(),
                self.generation.interval(),
                self.generation.run_on_startup,
            );
            let token = scheduler.shutdown_token();
            Some((token, scheduler.spawn()))
        } else {
            tracing::info!("Recurring generation disabled by configuration");
            None
        };

        tracing::info!(
            service = "recurring-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router(self.db.clone()))
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some((token, handle)) = scheduler {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Generation scheduler task failed");
            }
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
