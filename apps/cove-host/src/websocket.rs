use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use cove_proto::ClientFrame;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handlers::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// GET /ws/:id. Browsers cannot set headers on websocket upgrades, so
/// the token travels as a query parameter here.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let token = query.token.ok_or(StatusCode::UNAUTHORIZED)?;
    if !state.auth.verify_token(&token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if state.registry.get(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let Some(session) = state.registry.get(&session_id) else {
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    session.attach(frame_tx.clone());

    let alive = Arc::new(AtomicBool::new(true));

    // Single writer task: session frames and keepalive pings both go
    // through it so the sink is never used from two tasks.
    let ping_interval = Duration::from_secs(state.ping_interval_secs);
    let writer_alive = Arc::clone(&alive);
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "frame serialize failed");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // One missed pong since the last tick means the peer
                    // is gone even if TCP has not noticed yet.
                    if !writer_alive.swap(false, Ordering::SeqCst) {
                        debug!("websocket missed keepalive, closing");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_alive = Arc::clone(&alive);
    let reader_session = Arc::clone(&session);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Input { data }) => {
                        if let Err(e) = reader_session.write_input(data.as_bytes()) {
                            warn!(session = %reader_session.id, error = %e, "input write failed");
                            break;
                        }
                    }
                    Ok(ClientFrame::Resize { cols, rows }) => {
                        if let Err(e) = reader_session.resize(cols, rows) {
                            warn!(session = %reader_session.id, error = %e, "resize failed");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "ignoring malformed client frame");
                    }
                },
                Message::Pong(_) => {
                    reader_alive.store(true, Ordering::SeqCst);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.detach_if_current(&frame_tx);
    debug!(session = %session_id, "websocket detached");
}
