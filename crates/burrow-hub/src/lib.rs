//! Burrow hub: reverse-tunnel broker
//!
//! Agents dial the control endpoint and hold a multiplexed WebSocket
//! session open; external clients address the proxy endpoint with an agent
//! identity and routing metadata, and the hub relays each exchange over a
//! stream acquired from the session registry.

mod handlers;

use axum::routing::{any, get};
use axum::Router;
use burrow_control::SessionRegistry;
use burrow_transport_websocket::WebSocketConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state injected into every handler
pub struct AppState {
    pub registry: SessionRegistry<WebSocketConnection>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            registry: SessionRegistry::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Hub server configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind the hub's HTTP listener
    pub bind_addr: SocketAddr,
}

/// Build the hub router: control endpoint for agents, proxy endpoint for
/// external clients.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/hubs/{id}", get(handlers::accept_control))
        .route("/api/v1/proxy/{id}/{*path}", any(handlers::dispatch_proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until SIGINT/SIGTERM; in-flight requests are drained
/// before the listener stops.
pub async fn serve(config: &HubConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Hub listening on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining in-flight requests");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn proxy_without_session_returns_400_json() {
        let app = build_router(Arc::new(AppState::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/proxy/myid/hello")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let msg = body["msg"].as_str().unwrap();
        assert!(msg.contains("myid"), "unexpected error body: {}", msg);
    }

    #[tokio::test]
    async fn control_without_upgrade_returns_400_json() {
        let app = build_router(Arc::new(AppState::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/hubs/myid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["msg"].as_str().unwrap().contains("WebSocket"));
    }

    #[tokio::test]
    async fn unrelated_path_is_not_routed() {
        let app = build_router(Arc::new(AppState::new()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v2/other")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
