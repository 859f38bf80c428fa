//! Multiplexed WebSocket connection
//!
//! One `WebSocketConnection` wraps an established WebSocket (an axum
//! upgraded socket on the hub, a tokio-tungstenite client socket on the
//! agent) and pumps binary frames between the socket and per-stream
//! channels. Client-initiated stream IDs are odd, server IDs even, so both
//! sides can open streams without coordination.

use async_trait::async_trait;
use burrow_transport::{TransportError, TransportResult, TunnelConnection};
use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::stream::{
    decode_frame_header, MuxStream, StreamMap, MSG_TYPE_DATA, MSG_TYPE_FIN,
};

/// Which end of the tunnel this connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` is a valid peer-initiated stream for this role.
    fn accepts_incoming(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 0,
            Role::Server => stream_id % 2 == 1,
        }
    }
}

type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = io::Error> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Multiplexed WebSocket connection
pub struct WebSocketConnection {
    connection_id: String,
    /// Frames toward the writer task
    frame_tx: mpsc::Sender<Vec<u8>>,
    /// Stream ID -> inbound data channel, shared with the reader task
    streams: StreamMap,
    /// Streams opened by the remote peer
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
    next_stream_id: AtomicU32,
    role: Role,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WebSocketConnection {
    /// Wrap an axum-upgraded WebSocket (hub side).
    pub fn from_axum(socket: axum::extract::ws::WebSocket, role: Role) -> Self {
        use axum::extract::ws::Message;

        let (sink, source) = socket.split();
        let sink: FrameSink = Box::pin(
            sink.with(|frame: Vec<u8>| {
                future::ready(Ok::<_, axum::Error>(Message::Binary(frame.into())))
            })
            .sink_map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );
        let source: FrameSource = Box::pin(source.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::new(io::ErrorKind::Other, e))),
            })
        }));
        Self::start(sink, source, role)
    }

    /// Wrap a tokio-tungstenite WebSocket (agent side).
    pub fn from_tungstenite<S>(
        socket: tokio_tungstenite::WebSocketStream<S>,
        role: Role,
    ) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        use tokio_tungstenite::tungstenite::{Error as WsError, Message};

        let (sink, source) = socket.split();
        let sink: FrameSink = Box::pin(
            sink.with(|frame: Vec<u8>| future::ready(Ok::<_, WsError>(Message::Binary(frame))))
                .sink_map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );
        let source: FrameSource = Box::pin(source.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::new(io::ErrorKind::Other, e))),
            })
        }));
        Self::start(sink, source, role)
    }

    fn start(sink: FrameSink, source: FrameSource, role: Role) -> Self {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(256);
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let streams = StreamMap::default();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(Self::writer_task(
            sink,
            frame_rx,
            closed.clone(),
            cancel.clone(),
            connection_id.clone(),
        ));
        tokio::spawn(Self::reader_task(
            source,
            streams.clone(),
            accept_tx,
            frame_tx.clone(),
            role,
            closed.clone(),
            cancel.clone(),
            connection_id.clone(),
        ));

        Self {
            connection_id,
            frame_tx,
            streams,
            accept_rx: Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            role,
            closed,
            cancel,
        }
    }

    /// Writer task: drains outbound frames into the WebSocket.
    async fn writer_task(
        mut sink: FrameSink,
        mut rx: mpsc::Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
        cancel: CancellationToken,
        conn_id: String,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            debug!("[{}] WebSocket send error: {}", conn_id, e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        closed.store(true, Ordering::SeqCst);
        cancel.cancel();
        let _ = sink.close().await;
    }

    /// Reader task: dispatches inbound frames to their streams and surfaces
    /// peer-initiated streams on the accept channel.
    #[allow(clippy::too_many_arguments)]
    async fn reader_task(
        mut source: FrameSource,
        streams: StreamMap,
        accept_tx: mpsc::Sender<MuxStream>,
        frame_tx: mpsc::Sender<Vec<u8>>,
        role: Role,
        closed: Arc<AtomicBool>,
        cancel: CancellationToken,
        conn_id: String,
    ) {
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                item = source.next() => match item {
                    Some(Ok(data)) => data,
                    Some(Err(e)) => {
                        debug!("[{}] WebSocket read error: {}", conn_id, e);
                        break;
                    }
                    None => break,
                },
            };

            let Some((stream_id, msg_type, payload)) = decode_frame_header(&data) else {
                warn!("[{}] Invalid frame received", conn_id);
                continue;
            };
            trace!(
                "[{}] Received frame: stream={}, type={}, len={}",
                conn_id,
                stream_id,
                msg_type,
                payload.len()
            );

            let existing = streams.lock().unwrap().get(&stream_id).cloned();
            if let Some(tx) = existing {
                match msg_type {
                    MSG_TYPE_DATA if payload.is_empty() => {}
                    MSG_TYPE_DATA => {
                        if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                            trace!("[{}] Stream {} receiver dropped", conn_id, stream_id);
                        }
                    }
                    MSG_TYPE_FIN => {
                        // Empty chunk is the FIN sentinel
                        let _ = tx.send(Bytes::new()).await;
                    }
                    _ => warn!("[{}] Unknown message type: {}", conn_id, msg_type),
                }
            } else if msg_type == MSG_TYPE_DATA
                && !payload.is_empty()
                && role.accepts_incoming(stream_id)
            {
                // New peer-initiated stream
                let (tx, rx) = mpsc::channel(256);
                if tx.send(Bytes::copy_from_slice(payload)).await.is_ok() {
                    streams.lock().unwrap().insert(stream_id, tx);
                    let stream = MuxStream::new(
                        stream_id,
                        rx,
                        PollSender::new(frame_tx.clone()),
                        streams.clone(),
                    );
                    if accept_tx.send(stream).await.is_err() {
                        warn!(
                            "[{}] Accept channel closed, dropping stream {}",
                            conn_id, stream_id
                        );
                        streams.lock().unwrap().remove(&stream_id);
                    }
                }
            } else {
                // Frame for a stream already dropped on our side
                trace!("[{}] Stray frame for stream {}", conn_id, stream_id);
            }
        }

        debug!("[{}] WebSocket reader task ended", conn_id);
        closed.store(true, Ordering::SeqCst);
        cancel.cancel();

        // Signal EOF to every open stream
        let senders: Vec<_> = {
            let mut map = streams.lock().unwrap();
            let senders = map.values().cloned().collect();
            map.clear();
            senders
        };
        for tx in senders {
            let _ = tx.send(Bytes::new()).await;
        }
    }
}

#[async_trait]
impl TunnelConnection for WebSocketConnection {
    type Stream = MuxStream;

    async fn open_stream(&self) -> TransportResult<MuxStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        // Increment by 2 to keep the odd/even split
        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(256);
        self.streams.lock().unwrap().insert(stream_id, tx);

        debug!("[{}] Opened stream {}", self.connection_id, stream_id);

        Ok(MuxStream::new(
            stream_id,
            rx,
            PollSender::new(self.frame_tx.clone()),
            self.streams.clone(),
        ))
    }

    async fn accept_stream(&self) -> TransportResult<Option<MuxStream>> {
        let mut accept_rx = self.accept_rx.lock().await;
        match accept_rx.recv().await {
            Some(stream) => {
                debug!(
                    "[{}] Accepted stream {}",
                    self.connection_id,
                    stream.stream_id()
                );
                Ok(Some(stream))
            }
            None => Ok(None),
        }
    }

    async fn close(&self, reason: &str) {
        debug!("[{}] Closing connection: {}", self.connection_id, reason);
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        // The pump tasks hold channel clones, so without this they would
        // outlive the last handle to the connection.
        self.cancel.cancel();
    }
}
