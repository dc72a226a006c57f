//! In-process relay used by the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use relay_voice::config::{AudioConfig, OpusConfig, ReconnectConfig, SessionConfig};
use relay_voice::network::{ConnectParams, TransportSession};

/// How the relay answers `auth`
#[derive(Debug, Clone, PartialEq)]
pub enum AuthMode {
    Accept,
    Reject(String),
    Ignore,
}

#[derive(Debug, Clone)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
    Drop,
}

struct RelayState {
    auth_mode: Mutex<AuthMode>,
    answer_pings: Mutex<bool>,
    close_after_auth: Mutex<bool>,
    texts: Mutex<Vec<Value>>,
    audio: Mutex<Vec<Vec<u8>>>,
    admin_tokens: Mutex<Vec<Option<String>>>,
    close_reasons: Mutex<Vec<String>>,
    connections: AtomicUsize,
    open: AtomicUsize,
    auths: AtomicUsize,
    outbound: broadcast::Sender<Outbound>,
}

pub struct TestRelay {
    pub addr: SocketAddr,
    state: Arc<RelayState>,
    server: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let (outbound, _) = broadcast::channel(256);
        let state = Arc::new(RelayState {
            auth_mode: Mutex::new(AuthMode::Accept),
            answer_pings: Mutex::new(true),
            close_after_auth: Mutex::new(false),
            texts: Mutex::new(Vec::new()),
            audio: Mutex::new(Vec::new()),
            admin_tokens: Mutex::new(Vec::new()),
            close_reasons: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            auths: AtomicUsize::new(0),
            outbound,
        });

        let app = Router::new()
            .route("/voice", get(upgrade))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn port(&self) -> u32 {
        self.addr.port() as u32
    }

    pub fn url(&self) -> String {
        format!("ws://{}/voice", self.addr)
    }

    pub fn params(&self) -> ConnectParams {
        ConnectParams {
            host: "127.0.0.1".to_string(),
            port: self.port(),
            discord_user_id: "user-1".to_string(),
            guild_id: "guild-1".to_string(),
            auth_token: "secret".to_string(),
        }
    }

    pub fn set_auth_mode(&self, mode: AuthMode) {
        *self.state.auth_mode.lock() = mode;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        *self.state.answer_pings.lock() = answer;
    }

    /// Accept the next auth, then close that connection straight away
    pub fn close_after_next_auth(&self) {
        *self.state.close_after_auth.lock() = true;
    }

    pub fn push_text(&self, value: Value) {
        let _ = self.state.outbound.send(Outbound::Text(value.to_string()));
    }

    pub fn push_raw_text(&self, text: &str) {
        let _ = self.state.outbound.send(Outbound::Text(text.to_string()));
    }

    pub fn push_binary(&self, frame: Vec<u8>) {
        let _ = self.state.outbound.send(Outbound::Binary(frame));
    }

    /// Send a close frame to every client
    pub fn close_connections(&self) {
        let _ = self.state.outbound.send(Outbound::Close);
    }

    /// Drop every client socket without a close handshake
    pub fn drop_connections(&self) {
        let _ = self.state.outbound.send(Outbound::Drop);
    }

    pub fn texts(&self) -> Vec<Value> {
        self.state.texts.lock().clone()
    }

    pub fn texts_of_type(&self, kind: &str) -> Vec<Value> {
        self.texts()
            .into_iter()
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.state.audio.lock().clone()
    }

    pub fn admin_tokens(&self) -> Vec<Option<String>> {
        self.state.admin_tokens.lock().clone()
    }

    pub fn close_reasons(&self) -> Vec<String> {
        self.state.close_reasons.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.state.auths.load(Ordering::SeqCst)
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let token = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.admin_tokens.lock().push(token);
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<RelayState>) {
    let mut outbound = state.outbound.subscribe();
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    state.open.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                    state.texts.lock().push(value.clone());
                    if let Some(reply) = reply_to(&state, &value, connection) {
                        let accepted = reply["type"] == "auth_ok";
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                        let close = accepted && std::mem::take(&mut *state.close_after_auth.lock());
                        if close {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(frame))) => state.audio.lock().push(frame),
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        state.close_reasons.lock().push(frame.reason.to_string());
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            out = outbound.recv() => match out {
                Ok(Outbound::Text(text)) => {
                    let _ = socket.send(Message::Text(text)).await;
                }
                Ok(Outbound::Binary(frame)) => {
                    let _ = socket.send(Message::Binary(frame)).await;
                }
                Ok(Outbound::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(Outbound::Drop) => break,
                Err(_) => {}
            },
        }
    }

    state.open.fetch_sub(1, Ordering::SeqCst);
}

fn reply_to(state: &RelayState, message: &Value, connection: usize) -> Option<Value> {
    let freq_id = message["freqId"].clone();
    match message["type"].as_str()? {
        "auth" => {
            state.auths.fetch_add(1, Ordering::SeqCst);
            match state.auth_mode.lock().clone() {
                AuthMode::Accept => Some(json!({
                    "type": "auth_ok",
                    "sessionToken": format!("token-{}", connection),
                })),
                AuthMode::Reject(reason) => Some(json!({ "type": "auth_error", "reason": reason })),
                AuthMode::Ignore => None,
            }
        }
        "join" => Some(json!({ "type": "join_ok", "freqId": freq_id, "listenerCount": 2 })),
        "mute" => Some(json!({ "type": "mute_ok", "freqId": freq_id, "muted": true })),
        "unmute" => Some(json!({ "type": "mute_ok", "freqId": freq_id, "muted": false })),
        "ping" if *state.answer_pings.lock() => Some(json!({ "type": "pong" })),
        _ => None,
    }
}

/// Session timings short enough for tests
pub fn test_session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 2_000,
        auth_timeout_ms: 300,
        close_timeout_ms: 300,
        ..SessionConfig::default()
    }
}

pub fn headless_audio() -> AudioConfig {
    AudioConfig {
        device_playback: false,
        ..AudioConfig::default()
    }
}

pub fn session_with(config: SessionConfig) -> TransportSession {
    TransportSession::new(config, headless_audio(), OpusConfig::voice())
}

pub fn session() -> TransportSession {
    session_with(test_session_config())
}

pub fn fast_reconnect(max_retries: u32) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay_ms: 20,
        factor: 2.0,
        max_delay_ms: 100,
        jitter_factor: 0.3,
        min_delay_ms: 10,
        max_retries,
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Receive broadcast values until one matches
pub async fn next_matching<T, F>(rx: &mut broadcast::Receiver<T>, what: &str, matches: F) -> T
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(value) if matches(&value) => return Some(value),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(value)) => value,
        _ => panic!("timed out waiting for {}", what),
    }
}

/// Parse the 8-byte header of a captured audio frame
pub fn header(frame: &[u8]) -> (i32, u32) {
    let freq_id = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let sequence = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    (freq_id, sequence)
}
