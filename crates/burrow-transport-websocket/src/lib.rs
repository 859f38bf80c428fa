//! Stream-multiplexed WebSocket transport
//!
//! Implements the [`burrow_transport::TunnelConnection`] capability over a
//! single WebSocket: unboundedly many logical byte streams, each usable as
//! an independent HTTP/1.1 connection. The hub wraps sockets it upgraded via
//! axum ([`WebSocketConnection::from_axum`]); the agent dials out with
//! tokio-tungstenite ([`connect`]).

pub mod config;
pub mod connection;
pub mod connector;
mod stream;

pub use config::{ConnectorConfig, TlsVerify};
pub use connection::{Role, WebSocketConnection};
pub use connector::connect;
pub use stream::MuxStream;
