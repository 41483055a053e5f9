//! Health and metrics HTTP surface.

use crate::service::SyncServer;
use crate::shutdown::ShutdownSignal;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

struct AppState {
    server: Arc<SyncServer>,
    start_time: Instant,
}

impl AppState {
    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// `/health` and `/metrics` for `server`.
pub fn router(server: Arc<SyncServer>) -> Router {
    let state = Arc::new(AppState {
        server,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Serve `router` on `port` until `shutdown` triggers.
pub async fn serve(router: Router, port: u16, shutdown: ShutdownSignal) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
}

/// 200 while a broker session is live, 503 otherwise.
async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if state.server.listening() {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "broker": "connected" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "broker": "disconnected" })),
        )
    }
}

/// Uptime, broker state and dispatch counters.
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.uptime_seconds();

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "broker": state.server.state(),
        "queues": state.server.bindings().len(),
        "messages": state.server.metrics(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectOptions, MemoryBroker};
    use crate::connection::{ConnectionManager, ReconnectPolicy};
    use crate::consumer::Dispatcher;
    use crate::subscription::SubscriptionRegistry;
    use crate::topology::Topology;

    fn state() -> State<Arc<AppState>> {
        let manager = ConnectionManager::new(
            Arc::new(MemoryBroker::new()),
            "memory://",
            ConnectOptions::default(),
            ReconnectPolicy::default(),
        );
        let server = SyncServer::new(
            manager,
            Arc::new(Dispatcher::default()),
            Topology::default(),
            &SubscriptionRegistry::new(),
            "test",
        );
        State(Arc::new(AppState {
            server: Arc::new(server),
            start_time: Instant::now(),
        }))
    }

    #[tokio::test]
    async fn test_health_reports_disconnected() {
        let (status, Json(body)) = health_check(state()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["broker"], "disconnected");
    }

    #[tokio::test]
    async fn test_metrics_body() {
        let Json(body) = get_metrics(state()).await;
        assert_eq!(body["broker"], "disconnected");
        assert_eq!(body["messages"]["received"], 0);
        assert_eq!(body["uptime"], "0s");
    }
}
