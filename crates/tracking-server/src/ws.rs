//! WebSocket sessions for live delivery tracking.
//!
//! A session owns one socket and one [`LiveConnection`]. It writes whatever
//! the connection's outbound queue yields (heartbeat probes as WebSocket
//! pings, events as text frames) and treats every inbound frame as a sign of
//! life. All teardown goes through [`ConnectionRegistry::disconnect`], so a
//! read error racing a heartbeat expiry still cleans up exactly once.

use crate::app::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use tracking_hub::{DisconnectReason, Frame, HeartbeatMonitor, LiveConnection, ResourceKey};

/// `GET /ws/track/:delivery_id`
pub async fn track_delivery(
    ws: WebSocketUpgrade,
    Path(delivery_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, ResourceKey::from(delivery_id), state))
}

/// Drive one viewer until it leaves, stops answering, or the server shuts down.
pub async fn run_session(mut socket: WebSocket, key: ResourceKey, state: AppState) {
    let (connection, mut outbound) = LiveConnection::new(key.clone(), state.buffer_capacity);

    if let Err(e) = state.registry.subscribe(connection.clone()) {
        warn!(key = %key, error = %e, "rejecting viewer");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(key = %key, connection_id = %connection.id(), "viewer connected");

    let heartbeat =
        HeartbeatMonitor::new(connection.clone(), state.registry.clone(), state.heartbeat).spawn();

    let (mut ws_tx, mut ws_rx) = socket.split();

    let reason = loop {
        tokio::select! {
            biased;

            // Heartbeat expiry or shutdown.
            _ = connection.closed() => break None,

            frame = outbound.recv() => {
                let message = match frame {
                    Some(Frame::Ping) => Message::Ping(Vec::new()),
                    Some(Frame::Event(payload)) => Message::Text(payload.to_string()),
                    None => break None,
                };
                let sent = tokio::select! {
                    biased;
                    _ = connection.closed() => break None,
                    sent = ws_tx.send(message) => sent,
                };
                if let Err(e) = sent {
                    debug!(connection_id = %connection.id(), error = %e, "write failed");
                    break Some(DisconnectReason::WriteError);
                }
            }

            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break Some(DisconnectReason::ClientClosed),
                Some(Ok(_)) => connection.record_liveness(),
                Some(Err(e)) => {
                    debug!(connection_id = %connection.id(), error = %e, "read failed");
                    break Some(DisconnectReason::ReadError);
                }
            },
        }
    };

    if let Some(reason) = reason {
        state.registry.disconnect(&connection, reason);
    } else {
        // Closed from our side: say goodbye, best effort.
        let _ = ws_tx.send(Message::Close(None)).await;
    }

    let _ = heartbeat.await;
    log_session_end(&connection);
}

fn log_session_end(connection: &LiveConnection) {
    let stats = connection.stats();
    debug!(
        key = %connection.key(),
        connection_id = %connection.id(),
        reason = connection.disconnect_reason().map(|r| r.as_str()).unwrap_or("unknown"),
        queued = stats.queued,
        dropped = stats.dropped,
        "session finished"
    );
}
