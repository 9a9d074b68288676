//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::vehicle::InputCommand;
use crate::game::{MatchEvent, MatchHandle, MatchStatus};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ClientMessage, PlayerId, ServerMessage};

/// Queue depth for messages addressed to a single connection
const PEER_QUEUE: usize = 64;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let handle = state.match_handle.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, handle))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, handle: MatchHandle) {
    let player_id = Uuid::new_v4();
    info!(player_id = %player_id, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();

    // Subscribe before announcing so nothing sent after `Connected` is missed
    let (peer_tx, peer_rx) = mpsc::channel(PEER_QUEUE);
    handle.peers.insert(player_id, peer_tx);
    let broadcast_rx = handle.broadcast_tx.subscribe();

    if handle
        .events_tx
        .send(MatchEvent::Connected { player_id })
        .await
        .is_err()
    {
        error!(player_id = %player_id, "Match loop is gone, closing connection");
        handle.peers.remove(&player_id);
        return;
    }

    run_session(player_id, &handle, ws_sink, ws_stream, peer_rx, broadcast_rx).await;

    // Cleanup on disconnect
    handle.peers.remove(&player_id);
    handle.commands.remove(&player_id);
    let _ = handle
        .events_tx
        .send(MatchEvent::Disconnected { player_id })
        .await;

    info!(player_id = %player_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    player_id: PlayerId,
    handle: &MatchHandle,
    ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    peer_rx: mpsc::Receiver<ServerMessage>,
    broadcast_rx: broadcast::Receiver<ServerMessage>,
) {
    let rate_limiter = ConnectionRateLimiter::new();
    let writer_handle = tokio::spawn(write_loop(
        player_id,
        ws_sink,
        peer_rx,
        broadcast_rx,
        handle.status.clone(),
    ));

    // Reader loop: WebSocket -> match
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_message() {
                    warn!(player_id = %player_id, "Rate limited client message");
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Input {
                        throttle,
                        brake,
                        steer,
                    }) => {
                        // Latest input wins; the tick reads it directly
                        handle
                            .commands
                            .insert(player_id, InputCommand::sanitized(throttle, brake, steer));
                    }
                    Ok(msg) => {
                        if handle
                            .events_tx
                            .send(MatchEvent::Message { player_id, msg })
                            .await
                            .is_err()
                        {
                            debug!(player_id = %player_id, "Event channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Forward targeted and broadcast messages to the socket
async fn write_loop(
    player_id: PlayerId,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut peer_rx: mpsc::Receiver<ServerMessage>,
    mut broadcast_rx: broadcast::Receiver<ServerMessage>,
    status: Arc<RwLock<MatchStatus>>,
) {
    loop {
        let batch = tokio::select! {
            msg = peer_rx.recv() => match msg {
                Some(msg) => vec![msg],
                None => break,
            },
            msg = broadcast_rx.recv() => match msg {
                Ok(msg) => vec![msg],
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Skipped one-off events are gone; resend current state and scores
                    warn!(player_id = %player_id, lagged_count = n, "Client lagged, resyncing");
                    let resync = status.read().resync_messages();
                    resync.to_vec()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        for msg in &batch {
            if let Err(e) = send_msg(&mut ws_sink, msg).await {
                debug!(player_id = %player_id, error = %e, "WebSocket send failed");
                return;
            }
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}
