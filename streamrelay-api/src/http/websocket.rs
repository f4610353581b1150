//! Viewer WebSocket handler
//!
//! Each socket is registered as a viewer with the relay. Envelopes from the
//! relay are written as JSON text frames; frames from the viewer are only
//! logged. Closing either side unregisters the viewer.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::http::AppState;

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_message_size = state.config.server.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = match state.relay.connect_viewer().await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Rejecting viewer, relay unavailable");
            return;
        }
    };
    let viewer_id = session.id;
    let mut envelopes = session.receiver;

    info!(viewer_id = %viewer_id, topic = state.relay.topic(), "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Relay -> WebSocket. Ends when the relay drops this viewer or the socket fails.
    let send_viewer_id = viewer_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = envelopes.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                warn!(viewer_id = %send_viewer_id, error = %e, "Failed to send WebSocket message");
                return;
            }
        }
        debug!(viewer_id = %send_viewer_id, "Relay closed viewer channel");
        let _ = ws_sink.close().await;
    });

    // WebSocket -> log
    let recv_viewer_id = viewer_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = ws_stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    info!(viewer_id = %recv_viewer_id, message = %text.as_str(), "Received message from viewer");
                }
                Ok(Message::Binary(bytes)) => {
                    debug!(viewer_id = %recv_viewer_id, len = bytes.len(), "Ignoring binary frame from viewer");
                }
                Ok(Message::Close(_)) => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(viewer_id = %recv_viewer_id, error = %e, "WebSocket error");
                    return;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Err(e) = state.relay.disconnect_viewer(&viewer_id).await {
        debug!(viewer_id = %viewer_id, error = %e, "Relay already stopped");
    }

    info!(viewer_id = %viewer_id, "WebSocket connection closed");
}
