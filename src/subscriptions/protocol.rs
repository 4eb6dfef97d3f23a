//! Per-connection subscription protocol handler
//!
//! Speaks the text-framed `graphql-ws` protocol (the subscriptions-transport
//! variant): the server acks the connection, then drives a read loop that
//! turns `start`/`stop`/`connection_terminate` frames into lifecycle hook
//! calls. Frames are processed strictly in the order received. A frame that
//! does not decode ends the connection exactly like a transport error;
//! recognized-but-unhandled frame types are logged and ignored.

use std::sync::Arc;

use async_graphql::{Response, Variables};
use serde::{Deserialize, Serialize};

use super::hooks::ConnectionEvents;
use super::registry::{ConnectionId, DeliveryCallback, Subscription};
use super::transport::{FrameSink, FrameStream, TransportError};

/// WebSocket subprotocol offered during the upgrade
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// The recognized frame vocabulary. `connection_error`, `complete` and `ka`
/// are reserved: understood on the wire, never emitted by this handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    ConnectionInit,
    ConnectionAck,
    ConnectionError,
    ConnectionTerminate,
    Start,
    Stop,
    Data,
    Error,
    Complete,
    Ka,
    #[serde(other)]
    Unknown,
}

/// One discrete protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Frame {
    pub fn connection_ack() -> Self {
        Frame {
            frame_type: FrameType::ConnectionAck,
            id: None,
            payload: None,
        }
    }

    pub fn data(operation_id: &str, payload: serde_json::Value) -> Self {
        Frame {
            frame_type: FrameType::Data,
            id: Some(operation_id.to_string()),
            payload: Some(payload),
        }
    }

    pub fn error(operation_id: &str, message: &str) -> Self {
        Frame {
            frame_type: FrameType::Error,
            id: Some(operation_id.to_string()),
            payload: Some(serde_json::json!({ "message": message })),
        }
    }
}

/// Payload of a `start` frame
#[derive(Debug, Clone, Deserialize)]
pub struct StartPayload {
    pub query: String,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Acknowledged,
    Closed,
}

/// Drive one connection from upgrade to close.
///
/// The read loop suspends only while waiting for the next frame; every other
/// step runs to completion before the next frame is considered.
pub async fn handle_connection(
    connection: ConnectionId,
    mut frames: impl FrameStream,
    sink: Arc<dyn FrameSink>,
    hooks: Arc<dyn ConnectionEvents>,
) {
    let mut state = ConnectionState::Connected;
    tracing::debug!(%connection, ?state, "connection established");

    if sink.write_frame(Frame::connection_ack()).await.is_err() {
        tracing::warn!(%connection, "failed to acknowledge connection");
        hooks.on_close(connection).await;
        sink.close().await;
        return;
    }
    state = ConnectionState::Acknowledged;
    tracing::debug!(%connection, ?state, "handshake acknowledged");

    loop {
        match frames.next_frame().await {
            None => {
                tracing::debug!(%connection, "connection closed by peer");
                break;
            }
            Some(Err(TransportError::Decode(error))) => {
                // Protocol corruption is treated like a disconnect
                tracing::warn!(%connection, %error, "dropping connection after malformed frame");
                break;
            }
            Some(Err(TransportError::Io(error))) => {
                tracing::warn!(%connection, %error, "read failed");
                break;
            }
            Some(Ok(frame)) => match frame.frame_type {
                FrameType::ConnectionInit => {
                    // Already acked on upgrade; re-ack so the handshake is
                    // idempotent for standard clients
                    let _ = sink.write_frame(Frame::connection_ack()).await;
                }
                FrameType::Start => handle_start(connection, frame, &sink, &hooks).await,
                FrameType::Stop => match frame.id {
                    Some(operation_id) => hooks.on_stop(connection, &operation_id).await,
                    None => tracing::warn!(%connection, "stop frame without an operation id"),
                },
                FrameType::ConnectionTerminate => {
                    tracing::debug!(%connection, "client requested termination");
                    break;
                }
                other => {
                    tracing::debug!(%connection, frame_type = ?other, "ignoring unhandled frame");
                }
            },
        }
    }

    hooks.on_close(connection).await;
    sink.close().await;
    state = ConnectionState::Closed;
    tracing::debug!(%connection, ?state, "connection closed");
}

async fn handle_start(
    connection: ConnectionId,
    frame: Frame,
    sink: &Arc<dyn FrameSink>,
    hooks: &Arc<dyn ConnectionEvents>,
) {
    let Some(operation_id) = frame.id else {
        tracing::warn!(%connection, "start frame without an operation id");
        return;
    };

    let payload = match frame.payload.map(serde_json::from_value::<StartPayload>) {
        Some(Ok(payload)) => payload,
        Some(Err(_)) | None => {
            let _ = sink
                .write_frame(Frame::error(
                    &operation_id,
                    "start frame is missing a valid payload",
                ))
                .await;
            return;
        }
    };

    let variables = payload
        .variables
        .map(Variables::from_json)
        .unwrap_or_default();
    let callback = delivery_callback(sink.clone(), operation_id.clone());
    let subscription = Subscription {
        connection,
        operation_id: operation_id.clone(),
        query: payload.query,
        variables,
        operation_name: payload.operation_name,
        callback,
    };

    if let Err(error) = hooks.on_start(subscription).await {
        tracing::warn!(%connection, operation = %operation_id, %error, "subscription rejected");
        let _ = sink
            .write_frame(Frame::error(&operation_id, &error.to_string()))
            .await;
    }
}

/// Bind a delivery path for one operation: each engine result is serialized
/// into a `data` frame tagged with the operation id and written to the
/// connection. A write failure bubbles up to the registry, which treats it as
/// the connection being gone.
fn delivery_callback(sink: Arc<dyn FrameSink>, operation_id: String) -> DeliveryCallback {
    Arc::new(move |response: Response| {
        let sink = sink.clone();
        let operation_id = operation_id.clone();
        Box::pin(async move {
            let payload = serde_json::to_value(&response)?;
            sink.write_frame(Frame::data(&operation_id, payload)).await?;
            Ok(())
        })
    })
}
