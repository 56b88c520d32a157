//! Liveness and readiness endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::store::Database;

/// A yes/no probe behind one of the endpoints.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> bool;
}

/// Always reports the same answer.
pub struct StaticCheck(pub bool);

#[async_trait]
impl HealthCheck for StaticCheck {
    async fn check(&self) -> bool {
        self.0
    }
}

/// Ready when the store answers a trivial query.
pub struct DatabaseCheck(pub Arc<dyn Database>);

#[async_trait]
impl HealthCheck for DatabaseCheck {
    async fn check(&self) -> bool {
        self.0.health_check().await
    }
}

/// Shared router state.
#[derive(Clone)]
pub struct HealthState {
    pub liveness: Arc<dyn HealthCheck>,
    pub readiness: Arc<dyn HealthCheck>,
}

impl HealthState {
    /// Live while the process runs; ready while the store responds.
    pub fn for_database(db: Arc<dyn Database>) -> Self {
        Self {
            liveness: Arc::new(StaticCheck(true)),
            readiness: Arc::new(DatabaseCheck(db)),
        }
    }
}

/// Build the health router.
pub fn health_routes(state: HealthState, log_requests: bool) -> Router {
    let router = Router::new()
        .route("/health", get(liveness))
        .route("/healthz", get(liveness))
        .route("/health/liveness", get(liveness))
        .route("/ready", get(readiness))
        .route("/readyz", get(readiness))
        .route("/health/readiness", get(readiness))
        .fallback(not_found)
        .with_state(state);

    if log_requests {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

async fn liveness(State(state): State<HealthState>) -> impl IntoResponse {
    if state.liveness.check().await {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "failed" })),
        )
    }
}

async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if state.readiness.check().await {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        warn!("Readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" })))
}

// ── Server ──────────────────────────────────────────────────────────────

/// Handle to a running health server.
pub struct HealthServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthServer {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Health server task ended abnormally");
        }
    }
}

/// Bind `addr` and serve `router` on a background task.
///
/// Binding happens before returning, so a port conflict surfaces here
/// rather than inside the task.
pub async fn spawn_health_server(addr: &str, router: Router) -> std::io::Result<HealthServer> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown, rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Health server stopped with error");
        }
    });

    info!(addr = %local_addr, "Health server started");
    Ok(HealthServer {
        local_addr,
        shutdown,
        handle,
    })
}
