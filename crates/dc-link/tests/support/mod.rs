#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dc_core::Envelope;
use dc_link::{LinkConfig, ReconnectPolicy};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Frames the test pushes to the currently connected client.
#[derive(Debug, Clone)]
pub enum Push {
    Text(String),
    Close(u16),
    /// Drop the socket without a close frame.
    Drop,
}

#[derive(Default)]
struct BackendState {
    connections: AtomicUsize,
    client_ids: Mutex<Vec<String>>,
    received: Mutex<Vec<Envelope>>,
    raw: Mutex<Vec<String>>,
    close_codes: Mutex<Vec<Option<u16>>>,
    peer: Mutex<Option<mpsc::UnboundedSender<Push>>>,
}

/// In-process stand-in for the desktop backend's `/ws` endpoint.
pub struct FakeBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
    server: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state = Arc::new(BackendState::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            state,
            server,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().expect("lock").clone()
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.state.received.lock().expect("lock").clone()
    }

    pub fn raw_frames(&self) -> Vec<String> {
        self.state.raw.lock().expect("lock").clone()
    }

    pub fn close_codes(&self) -> Vec<Option<u16>> {
        self.state.close_codes.lock().expect("lock").clone()
    }

    pub fn count_events(&self, namespace: &str, event: &str) -> usize {
        self.received()
            .iter()
            .filter(|envelope| envelope.namespace == namespace && envelope.event == event)
            .count()
    }

    pub fn push(&self, push: Push) -> bool {
        match self.state.peer.lock().expect("lock").as_ref() {
            Some(peer) => peer.send(push).is_ok(),
            None => false,
        }
    }

    pub fn push_envelope(&self, envelope: &Envelope) -> bool {
        self.push(Push::Text(
            serde_json::to_string(envelope).expect("encode envelope"),
        ))
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<BackendState>>,
) -> impl IntoResponse {
    let client_id = params.get("id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(state, socket, client_id))
}

async fn handle_socket(state: Arc<BackendState>, socket: WebSocket, client_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Push>();
    state.client_ids.lock().expect("lock").push(client_id);
    *state.peer.lock().expect("lock") = Some(tx);
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.raw.lock().expect("lock").push(text.clone());
                    if let Ok(envelope) = serde_json::from_str::<Envelope>(&text) {
                        state.received.lock().expect("lock").push(envelope);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    state
                        .close_codes
                        .lock()
                        .expect("lock")
                        .push(frame.map(|frame| frame.code));
                    break;
                }
                Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            push = rx.recv() => match push {
                Some(Push::Text(text)) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Push::Close(code)) => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
                Some(Push::Drop) | None => break,
            },
        }
    }
}

/// Short timings so reconnect and heartbeat paths run in milliseconds.
pub fn fast_config(endpoint: impl Into<String>) -> LinkConfig {
    LinkConfig {
        endpoint: endpoint.into(),
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(80),
            max_attempts: None,
        },
        ensure_retries: 1,
        ensure_backoff_step: Duration::from_millis(10),
        ..LinkConfig::default()
    }
}

/// Address nothing listens on, so connects are refused immediately.
pub async fn unreachable_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}/ws")
}

pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + WAIT_LIMIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
