//! WebSocket transport for the relay
//!
//! Each upgraded socket is split into a reader loop (this task) and a writer
//! task. The writer drains the connection's outbound queue, so frames reach
//! the client in the order the engine queued them. The reader decodes inbound
//! frames and hands them to the engine.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use relaychat_core::Error;
use relaychat_hub::{ConnectionHandle, OutboundReceiver, RelayEngine};
use relaychat_proto::{decode_inbound, decode_inbound_bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::AppState;

/// Upgrade any request to the chat WebSocket
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let AppState {
        engine,
        max_frame_bytes,
        connections,
    } = state;

    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| connections.track_future(handle_socket(socket, engine)))
}

async fn handle_socket(socket: WebSocket, engine: RelayEngine) {
    let (handle, outbound) = ConnectionHandle::new();
    let connection_id = handle.id().to_string();

    let shutdown = engine.shutdown_token();
    let connection_token = shutdown.child_token();

    match engine.attach(handle).await {
        Ok(snapshot_len) => {
            info!(
                connection_id = %connection_id,
                snapshot_len,
                "WebSocket connection attached"
            );
        }
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "Rejecting WebSocket connection");
            return;
        }
    }

    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        connection_token.clone(),
        shutdown,
        connection_id.clone(),
    ));

    loop {
        let next = tokio::select! {
            () = connection_token.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                engine
                    .handle_frame(&connection_id, decode_inbound(text.as_str()))
                    .await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                engine
                    .handle_frame(&connection_id, decode_inbound_bytes(&bytes))
                    .await;
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(connection_id = %connection_id, "Client closed the connection");
                break;
            }
            Some(Ok(_)) => {
                // Ping/pong are answered by the WebSocket layer
            }
            Some(Err(e)) => {
                let err = Error::Transport(e.to_string());
                warn!(connection_id = %connection_id, error = %err, "WebSocket read failed");
                break;
            }
        }
    }

    engine.detach(&connection_id).await;
    connection_token.cancel();
    if let Err(e) = writer.await {
        warn!(connection_id = %connection_id, error = %e, "WebSocket writer task failed");
    }

    info!(connection_id = %connection_id, "WebSocket connection closed");
}

/// Drain the outbound queue onto the socket until the queue ends, a write
/// fails, or the connection is cancelled.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: OutboundReceiver,
    connection_token: CancellationToken,
    shutdown: CancellationToken,
    connection_id: String,
) {
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(text_message(&frame)).await {
                    let err = Error::Transport(e.to_string());
                    warn!(connection_id = %connection_id, error = %err, "WebSocket write failed");
                    // Dropping `outbound` on return makes the registry skip us.
                    connection_token.cancel();
                    return;
                }
            }
            () = connection_token.cancelled() => {
                // Best effort: flush what was queued before cancellation.
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(text_message(&frame)).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    if shutdown.is_cancelled() {
        let close = CloseFrame {
            code: close_code::AWAY,
            reason: Utf8Bytes::from_static("server shutting down"),
        };
        if let Err(e) = sink.send(Message::Close(Some(close))).await {
            debug!(connection_id = %connection_id, error = %e, "Close frame not delivered");
        }
    } else if let Err(e) = sink.close().await {
        debug!(connection_id = %connection_id, error = %e, "Socket close failed");
    }
}

fn text_message(frame: &str) -> Message {
    Message::Text(frame.to_owned().into())
}
