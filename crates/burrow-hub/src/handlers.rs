//! Hub endpoints: control-connection acceptance and request dispatch

use axum::{
    body::Body,
    extract::ws::rejection::WebSocketUpgradeRejection,
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::{HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use burrow_control::RegistryError;
use burrow_transport_websocket::{Role, WebSocketConnection};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::AppState;

pub(crate) const PROXY_HOST_HEADER: &str = "x-proxy-host";
pub(crate) const PROXY_PATH_HEADER: &str = "x-proxy-path";

/// Why a proxied request could not be dispatched. All of these are local to
/// the one request and surface as a 400 with a JSON `{"msg"}` body.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    NoSession(#[from] RegistryError),

    #[error("invalid routing metadata: {0}")]
    BadMetadata(String),

    #[error("failed to speak HTTP over tunnel stream: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to relay request over tunnel: {0}")]
    Relay(#[source] hyper::Error),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        error_response(StatusCode::BAD_REQUEST, self.to_string())
    }
}

pub(crate) fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "msg": msg.into() }))).into_response()
}

/// Control endpoint: upgrade to WebSocket, wrap the socket as a server-role
/// multiplexed session, and register it under the claimed identity.
///
/// Returns as soon as the session is registered; the connection itself is
/// serviced by its own pump tasks and stays available for stream opens for
/// as long as the agent holds it open.
pub(crate) async fn accept_control(
    Path(identity): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to upgrade to WebSocket: {}", rejection),
            );
        }
    };

    info!(identity = %identity, "Accepting control connection");

    ws.on_upgrade(move |socket| async move {
        let session = WebSocketConnection::from_axum(socket, Role::Server);
        state.registry.register(&identity, Arc::new(session));
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProxyParams {
    /// Target host override, mirrored into the `X-Proxy-Host` header
    #[serde(rename = "x-proxy-host")]
    x_proxy_host: Option<String>,
}

/// Proxy endpoint: relay one HTTP exchange to the agent identified by the
/// first path segment, over a stream acquired from the session registry.
pub(crate) async fn dispatch_proxy(
    Path((identity, path)): Path<(String, String)>,
    Query(params): Query<ProxyParams>,
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Response {
    match relay(state, &identity, &path, params, req).await {
        Ok(response) => response,
        Err(e) => {
            debug!(identity = %identity, error = %e, "Dispatch failed");
            e.into_response()
        }
    }
}

async fn relay(
    state: Arc<AppState>,
    identity: &str,
    path: &str,
    params: ProxyParams,
    mut req: Request,
) -> Result<Response, DispatchError> {
    // Routing metadata for the agent's forwarding director. The sub-path
    // keeps its leading slash; the host may come in via the query string.
    let proxy_path = format!("/{}", path);
    if let Some(host) = params.x_proxy_host {
        let value = HeaderValue::from_str(&host)
            .map_err(|e| DispatchError::BadMetadata(e.to_string()))?;
        req.headers_mut().insert(PROXY_HOST_HEADER, value);
    }
    let value = HeaderValue::from_str(&proxy_path)
        .map_err(|e| DispatchError::BadMetadata(e.to_string()))?;
    req.headers_mut().insert(PROXY_PATH_HEADER, value);

    // The reverse-proxy "dial" step: a live stream from the registry
    // instead of a TCP connection.
    let stream = state.registry.acquire(identity).await?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io)
        .await
        .map_err(DispatchError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("tunnel connection ended: {}", e);
        }
    });

    // Origin-form URI for the HTTP/1.1 client connection; the director
    // rewrites the path from the metadata header anyway.
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", proxy_path, query),
        None => proxy_path,
    };
    *req.uri_mut() = path_and_query
        .parse::<Uri>()
        .map_err(|e| DispatchError::BadMetadata(e.to_string()))?;

    let response = sender
        .send_request(req)
        .await
        .map_err(DispatchError::Relay)?;

    Ok(response.map(Body::new).into_response())
}
