//! Logical streams multiplexed over one WebSocket
//!
//! WebSocket has no native stream multiplexing, so frames carry a small
//! header in front of each binary message:
//!
//! - 4 bytes: stream ID (big-endian u32)
//! - 1 byte: message type (0=data, 1=fin)
//! - Rest: payload

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

/// Message type constants for stream multiplexing
pub(crate) const MSG_TYPE_DATA: u8 = 0;
pub(crate) const MSG_TYPE_FIN: u8 = 1;

/// Per-connection map from stream ID to that stream's inbound data channel.
/// Shared between the connection's reader task and every live stream, so a
/// dropped stream can deregister itself.
pub(crate) type StreamMap = Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>;

/// Encode a multiplexed frame
pub(crate) fn encode_frame(stream_id: u32, msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.push(msg_type);
    frame.extend_from_slice(payload);
    frame
}

/// Decode a multiplexed frame header
pub(crate) fn decode_frame_header(data: &[u8]) -> Option<(u32, u8, &[u8])> {
    if data.len() < 5 {
        return None;
    }
    let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let msg_type = data[4];
    let payload = &data[5..];
    Some((stream_id, msg_type, payload))
}

/// A virtual bidirectional byte stream over a multiplexed WebSocket
/// connection.
///
/// Reads and writes go through the connection's pump tasks; an empty chunk
/// on the inbound channel is the FIN sentinel from the remote side. Dropping
/// the stream deregisters it and half-closes the remote end.
#[derive(Debug)]
pub struct MuxStream {
    stream_id: u32,
    /// Inbound data for this stream, fed by the connection's reader task
    rx: mpsc::Receiver<Bytes>,
    /// Outbound frames toward the connection's writer task
    frames: PollSender<Vec<u8>>,
    /// Data received but not yet consumed by the caller
    read_buf: BytesMut,
    read_closed: bool,
    write_closed: bool,
    streams: StreamMap,
}

impl MuxStream {
    pub(crate) fn new(
        stream_id: u32,
        rx: mpsc::Receiver<Bytes>,
        frames: PollSender<Vec<u8>>,
        streams: StreamMap,
    ) -> Self {
        Self {
            stream_id,
            rx,
            frames,
            read_buf: BytesMut::with_capacity(8192),
            read_closed: false,
            write_closed: false,
            streams,
        }
    }

    /// Stream ID, unique within the parent connection
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(data) if data.is_empty() => {
                    // FIN from the remote side
                    trace!(stream_id = this.stream_id, "stream read side closed");
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Some(data) => {
                    this.read_buf.extend_from_slice(&data);
                }
                None => {
                    // Connection torn down
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if ready!(this.frames.poll_reserve(cx)).is_err() {
            this.write_closed = true;
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let frame = encode_frame(this.stream_id, MSG_TYPE_DATA, buf);
        if this.frames.send_item(frame).is_err() {
            this.write_closed = true;
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task on poll_write; nothing to do.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.frames.poll_reserve(cx)).is_ok() {
            let _ = this
                .frames
                .send_item(encode_frame(this.stream_id, MSG_TYPE_FIN, &[]));
        }
        this.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if let Ok(mut map) = self.streams.lock() {
            map.remove(&self.stream_id);
        }
        if !self.write_closed {
            // Best effort: let the peer release its half promptly. If the
            // frame channel is full the peer's half stays open until
            // session teardown.
            if let Some(tx) = self.frames.get_ref() {
                if tx
                    .try_send(encode_frame(self.stream_id, MSG_TYPE_FIN, &[]))
                    .is_err()
                {
                    trace!(
                        stream_id = self.stream_id,
                        "dropped stream could not send FIN"
                    );
                }
            }
        }
    }
}
