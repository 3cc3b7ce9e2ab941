use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::api::AppState;
use crate::sync::channel::{ClientFrame, BOARD_ROOM};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_board_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_board_socket(socket, state))
}

async fn wait_for_join(socket: &mut WebSocket) -> Option<String> {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Join { room }) => return Some(room),
                Ok(ClientFrame::Ping) => {
                    let _ = socket
                        .send(Message::Text(r#"{"type":"pong"}"#.into()))
                        .await;
                }
                Err(e) => tracing::debug!("Ignoring frame before join: {}", e),
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn handle_board_socket(mut socket: WebSocket, state: AppState) {
    let room = match tokio::time::timeout(JOIN_TIMEOUT, wait_for_join(&mut socket)).await {
        Ok(Some(room)) if room == BOARD_ROOM => room,
        Ok(Some(room)) => {
            tracing::debug!(room = room.as_str(), "Rejecting join for unknown room");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::debug!("Board socket closed: no join received");
            return;
        }
    };

    // Subscribe before acknowledging so no event published after the ack
    // is missed.
    let mut rx = state.events_tx.subscribe();
    let ack = json!({ "type": "connected", "room": room }).to_string();
    if socket.send(Message::Text(ack.into())).await.is_err() {
        return;
    }
    tracing::debug!("Board socket joined");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(msg) => {
                    if socket.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    // Dropped events cannot be replayed; closing forces the
                    // client to reconnect and refetch the board.
                    tracing::warn!(skipped = n, "Board socket lagged, closing");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ClientFrame::Ping) = serde_json::from_str::<ClientFrame>(text.as_str()) {
                        if socket
                            .send(Message::Text(r#"{"type":"pong"}"#.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("Board socket closed");
}
