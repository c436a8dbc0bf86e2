use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cove_proto::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::SessionKey;

/// One websocket stream to one remote session.
///
/// A transport never reconnects itself. When the socket dies the open
/// flag drops and the heartbeat loop notices on its next tick; anything
/// else would race the heartbeat's view of which sessions still exist.
pub struct SessionTransport {
    open: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    task: JoinHandle<()>,
}

impl SessionTransport {
    /// Start connecting. Incoming frames are delivered to `frames`
    /// tagged with the session key; the caller translates them.
    pub fn connect(
        url: Url,
        key: SessionKey,
        frames: mpsc::UnboundedSender<(SessionKey, ServerFrame)>,
    ) -> Self {
        let open = Arc::new(AtomicBool::new(false));
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let task_open = Arc::clone(&open);
        let task = tokio::spawn(async move {
            let (mut ws, _) = match connect_async(url.as_str()).await {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(session = %key, error = %e, "transport connect failed");
                    return;
                }
            };
            task_open.store(true, Ordering::SeqCst);

            loop {
                tokio::select! {
                    frame = outgoing_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "outgoing frame serialize failed");
                                continue;
                            }
                        };
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    message = ws.next() => {
                        let Some(Ok(message)) = message else { break };
                        match message {
                            Message::Text(text) => {
                                match serde_json::from_str::<ServerFrame>(&text) {
                                    Ok(frame) => {
                                        if frames.send((key.clone(), frame)).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        debug!(session = %key, error = %e, "ignoring malformed frame");
                                    }
                                }
                            }
                            Message::Ping(payload) => {
                                if ws.send(Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
            task_open.store(false, Ordering::SeqCst);
            debug!(session = %key, "transport closed");
        });

        Self {
            open,
            outgoing,
            task,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn send_input(&self, data: String) {
        let _ = self.outgoing.send(ClientFrame::Input { data });
    }

    pub fn send_resize(&self, cols: u16, rows: u16) {
        let _ = self.outgoing.send(ClientFrame::Resize { cols, rows });
    }

    pub fn close(self) {
        self.open.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
    use axum::routing::get;
    use cove_proto::SessionStatus;
    use std::time::Duration;

    async fn stub_session(socket: WebSocket) {
        let (mut tx, mut rx) = socket.split();
        // Snapshot first, then stream, like a real host.
        tx.send(AxMessage::Text(
            serde_json::to_string(&ServerFrame::Snapshot {
                data: "old scrollback".into(),
            })
            .unwrap(),
        ))
        .await
        .unwrap();

        while let Some(Ok(message)) = rx.next().await {
            if let AxMessage::Text(text) = message {
                let frame: ClientFrame = serde_json::from_str(&text).unwrap();
                match frame {
                    ClientFrame::Input { data } => {
                        tx.send(AxMessage::Text(
                            serde_json::to_string(&ServerFrame::Output {
                                data: format!("echo:{data}"),
                            })
                            .unwrap(),
                        ))
                        .await
                        .unwrap();
                    }
                    ClientFrame::Resize { .. } => {
                        tx.send(AxMessage::Text(
                            serde_json::to_string(&ServerFrame::Status {
                                status: SessionStatus::Detached,
                            })
                            .unwrap(),
                        ))
                        .await
                        .unwrap();
                    }
                }
            }
        }
    }

    async fn start_stub() -> std::net::SocketAddr {
        let app = axum::Router::new().route(
            "/ws/:id",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(stub_session) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn snapshot_arrives_before_any_output() {
        let addr = start_stub().await;
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let key = SessionKey::new("h", "s1");
        let transport = SessionTransport::connect(
            Url::parse(&format!("ws://{addr}/ws/s1")).unwrap(),
            key.clone(),
            frames_tx,
        );

        // Input sent immediately; the stub answers it after the snapshot.
        transport.send_input("x".into());

        let (k, first) = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(k, key);
        assert!(matches!(first, ServerFrame::Snapshot { .. }));

        let (_, second) = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            ServerFrame::Output { data } => assert_eq!(data, "echo:x"),
            other => panic!("expected output, got {other:?}"),
        }
        assert!(transport.is_open());
        transport.close();
    }

    #[tokio::test]
    async fn failed_connect_leaves_transport_closed() {
        let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
        let transport = SessionTransport::connect(
            Url::parse("ws://127.0.0.1:1/ws/s1").unwrap(),
            SessionKey::new("h", "s1"),
            frames_tx,
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!transport.is_open());
        transport.close();
    }
}
