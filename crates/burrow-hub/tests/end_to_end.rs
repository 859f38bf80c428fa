//! End-to-end tunnel tests: a real hub, a real agent dialing in over
//! WebSocket, and a local HTTP target, all on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::RawQuery;
use axum::routing::get;
use axum::Router;
use burrow_agent::{Agent, AgentConfig, AgentHandle};
use burrow_hub::{build_router, AppState};
use burrow_transport_websocket::TlsVerify;
use tokio::net::TcpListener;

/// Serves a toy local target and returns its address.
async fn start_target() -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(|| async { "hello from target" }))
        .route(
            "/query",
            get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Serves a hub and returns its address.
async fn start_hub() -> SocketAddr {
    let state = Arc::new(AppState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    addr
}

async fn start_agent(hub: SocketAddr, identity: &str) -> AgentHandle {
    Agent::spawn(AgentConfig {
        connect_url: format!("ws://{}/api/v1/hubs/{}", hub, identity),
        tls_verify: TlsVerify::Strict,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn request_round_trips_through_the_tunnel() {
    let target = start_target().await;
    let hub = start_hub().await;
    let _agent = start_agent(hub, "myid").await;

    let url = format!(
        "http://{}/api/v1/proxy/myid/hello?x-proxy-host={}",
        hub, target
    );
    let response = reqwest::get(&url).await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello from target");
}

#[tokio::test]
async fn query_string_reaches_the_target() {
    let target = start_target().await;
    let hub = start_hub().await;
    let _agent = start_agent(hub, "queries").await;

    let url = format!(
        "http://{}/api/v1/proxy/queries/query?q=tunnel&x-proxy-host={}",
        hub, target
    );
    let response = reqwest::get(&url).await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("q=tunnel"), "query was lost: {}", body);
}

#[tokio::test]
async fn unknown_identity_is_rejected_without_an_agent() {
    let hub = start_hub().await;

    let url = format!(
        "http://{}/api/v1/proxy/absent/hello?x-proxy-host=127.0.0.1:1",
        hub
    );
    let response = reqwest::get(&url).await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["msg"].as_str().unwrap().contains("absent"));
}

#[tokio::test]
async fn unreachable_target_surfaces_as_bad_gateway() {
    let hub = start_hub().await;
    let _agent = start_agent(hub, "deadend").await;

    // Port 1 is closed, so the agent's forward fails
    let url = format!(
        "http://{}/api/v1/proxy/deadend/hello?x-proxy-host=127.0.0.1:1",
        hub
    );
    let response = reqwest::get(&url).await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn dead_agent_is_evicted_and_replacement_takes_over() {
    let target = start_target().await;
    let hub = start_hub().await;
    let agent = start_agent(hub, "flaky").await;

    let url = format!(
        "http://{}/api/v1/proxy/flaky/hello?x-proxy-host={}",
        hub, target
    );
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // Kill the agent and let the hub notice the control connection drop
    agent.abort();
    drop(agent);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::BAD_REQUEST,
        "dead session should be evicted, not retried forever"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["msg"].as_str().unwrap().contains("flaky"));

    // A replacement agent restores service under the same identity
    let _replacement = start_agent(hub, "flaky").await;
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello from target");
}

#[tokio::test]
async fn sessions_are_load_balanced_but_interchangeable() {
    let target = start_target().await;
    let hub = start_hub().await;
    let _first = start_agent(hub, "pool").await;
    let _second = start_agent(hub, "pool").await;

    let url = format!(
        "http://{}/api/v1/proxy/pool/hello?x-proxy-host={}",
        hub, target
    );
    for _ in 0..10 {
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "hello from target");
    }
}
