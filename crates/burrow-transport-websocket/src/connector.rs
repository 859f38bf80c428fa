//! Agent-side dialer for the hub's control endpoint

use burrow_transport::{TransportError, TransportResult};
use std::sync::Arc;
use tokio_tungstenite::Connector;
use tracing::info;
use url::Url;

use crate::config::ConnectorConfig;
use crate::connection::{Role, WebSocketConnection};

/// Dial the hub's control endpoint and wrap the socket as a client-role
/// multiplexed connection.
///
/// `connect_url` carries host, port, and identity path segment, e.g.
/// `ws://hub.example.com:8081/api/v1/hubs/myid`. `wss://` enables TLS with
/// the verification policy from `config`.
pub async fn connect(
    connect_url: &str,
    config: &ConnectorConfig,
) -> TransportResult<WebSocketConnection> {
    let url = Url::parse(connect_url).map_err(|e| {
        TransportError::ConfigurationError(format!("invalid connect URL '{}': {}", connect_url, e))
    })?;

    let connector = match url.scheme() {
        "ws" => None,
        "wss" => Some(Connector::Rustls(Arc::new(config.build_client_config()?))),
        other => {
            return Err(TransportError::ConfigurationError(format!(
                "unsupported scheme '{}' (expected ws or wss)",
                other
            )))
        }
    };

    let (socket, _response) =
        tokio_tungstenite::connect_async_tls_with_config(connect_url, None, false, connector)
            .await
            .map_err(|e| {
                TransportError::HandshakeFailed(format!(
                    "failed to dial hub {:?}: {}",
                    connect_url, e
                ))
            })?;

    info!("connected to hub at {}", connect_url);

    Ok(WebSocketConnection::from_tungstenite(socket, Role::Client))
}
