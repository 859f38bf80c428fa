//! Transport abstraction for tunnel sessions
//!
//! The hub and agent agree on one capability: a duplex connection that can
//! open and accept unboundedly many independent logical streams, each an
//! ordinary bidirectional byte stream. The registry and the dispatcher are
//! written against the [`TunnelConnection`] trait so the multiplexing
//! implementation (WebSocket today) can be swapped without touching either.

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A multiplexed duplex connection to a remote peer.
///
/// Implementations must support concurrent `open_stream` calls from multiple
/// tasks; individual streams are single-owner. Session-level close tears
/// down every open stream.
#[async_trait]
pub trait TunnelConnection: Send + Sync + Debug + 'static {
    /// The logical stream type carried by this connection. Streams are plain
    /// byte streams so HTTP can be spoken over them directly.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a new outbound logical stream.
    ///
    /// Fails once the underlying transport has died; callers treat that as
    /// the liveness signal for the whole connection.
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept the next stream opened by the remote peer.
    ///
    /// Returns `None` when the connection is closed and no more streams will
    /// arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection and all of its streams.
    async fn close(&self, reason: &str);

    /// Whether the connection has been closed (locally or by the peer).
    fn is_closed(&self) -> bool;

    /// Stable identifier for logging and correlation.
    fn connection_id(&self) -> String;
}
