//! Framed transport seam for the subscription protocol
//!
//! The protocol handler speaks frames, not sockets. `FrameStream`/`FrameSink`
//! are the read-one-frame / write-one-frame / close surface it needs; the
//! production implementation wraps an axum WebSocket, tests substitute
//! channel-backed fakes. The sink serializes concurrent writers internally —
//! the handshake ack and a publish delivery may race on the same connection.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::protocol::Frame;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Read or write failed at the socket level, or the peer went away
    #[error("transport error: {0}")]
    Io(String),

    /// The peer sent bytes that do not decode to a frame
    #[error("malformed frame: {0}")]
    Decode(String),
}

/// Write half of a connection. Shared by the read loop (acks, error frames)
/// and every delivery callback bound to the connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Read half of a connection. `None` means the transport is closed.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

pub struct WsFrameSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

pub struct WsFrameStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            return match self.stream.next().await {
                None => None,
                Some(Err(e)) => Some(Err(TransportError::Io(e.to_string()))),
                Some(Ok(Message::Close(_))) => None,
                Some(Ok(Message::Text(text))) => Some(
                    serde_json::from_str(&text)
                        .map_err(|e| TransportError::Decode(e.to_string())),
                ),
                // Control and binary frames are not part of the protocol
                Some(Ok(_)) => continue,
            };
        }
    }
}

/// Split an upgraded WebSocket into the protocol handler's transport halves
pub fn split_socket(socket: WebSocket) -> (WsFrameStream, Arc<WsFrameSink>) {
    let (sink, stream) = socket.split();
    (
        WsFrameStream { stream },
        Arc::new(WsFrameSink {
            sink: Mutex::new(sink),
        }),
    )
}
