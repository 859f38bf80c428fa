//! Agent side of the tunnel: dials the hub, accepts multiplexed streams,
//! and serves each one as an HTTP/1.1 connection that forwards to the
//! local target named by the hub's metadata headers.

pub mod forwarder;

use std::sync::Arc;

use burrow_transport::{TransportError, TunnelConnection};
use burrow_transport_websocket::{connect, ConnectorConfig, TlsVerify, WebSocketConnection};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to dial hub: {0}")]
    Dial(TransportError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Configuration for one agent session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Full control URL, e.g. `ws://hub.example.com:8081/api/v1/hubs/myid`.
    pub connect_url: String,
    pub tls_verify: TlsVerify,
}

impl AgentConfig {
    fn connector_config(&self) -> ConnectorConfig {
        match self.tls_verify {
            TlsVerify::Strict => ConnectorConfig::default(),
            TlsVerify::Skip => ConnectorConfig::default().with_insecure_skip_verify(),
        }
    }
}

pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Dials the hub and serves tunnel streams until the session ends.
    ///
    /// Returns `Ok(())` when the hub closes the session cleanly and an
    /// error when the dial or the session itself fails.
    pub async fn run(&self) -> Result<(), AgentError> {
        let connection = connect(&self.config.connect_url, &self.config.connector_config())
            .await
            .map_err(AgentError::Dial)?;
        let connection = Arc::new(connection);
        tracing::info!(
            connection_id = %connection.connection_id(),
            url = %self.config.connect_url,
            "connected to hub"
        );

        serve_streams(connection).await
    }

    /// Dials the hub and serves streams on a background task, returning
    /// once the control connection is established.
    pub async fn spawn(config: AgentConfig) -> Result<AgentHandle, AgentError> {
        let connection = connect(&config.connect_url, &config.connector_config())
            .await
            .map_err(AgentError::Dial)?;
        let connection = Arc::new(connection);
        tracing::info!(
            connection_id = %connection.connection_id(),
            url = %config.connect_url,
            "connected to hub"
        );

        let task = tokio::spawn(async move {
            if let Err(e) = serve_streams(connection).await {
                tracing::warn!(error = %e, "agent session failed");
            }
        });
        Ok(AgentHandle { task })
    }
}

/// Accepts streams on the session and serves each as an HTTP/1.1
/// connection against the local forwarder.
async fn serve_streams(connection: Arc<WebSocketConnection>) -> Result<(), AgentError> {
    let client = forwarder::build_client();
    loop {
        match connection.accept_stream().await? {
            Some(stream) => {
                let client = client.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| forwarder::forward(client.clone(), req));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(error = %e, "tunnel stream ended with error");
                    }
                });
            }
            None => {
                tracing::info!("hub closed the session");
                return Ok(());
            }
        }
    }
}

/// Handle to an agent running on a background task.
pub struct AgentHandle {
    task: tokio::task::JoinHandle<()>,
}

impl AgentHandle {
    /// Tears the agent down without waiting for the hub.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
