//! One-shot streaming client
//!
//! Push-only uploader for short test transmissions. Opens a socket, sends a
//! JSON hello, then forwards queued frames as binary messages in order until
//! stopped. No retries: a dropped connection just ends the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header carrying the optional admin token
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct ActiveStream {
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<Option<WsStream>>,
}

#[derive(Default)]
pub struct StreamingClient {
    stream: Mutex<Option<ActiveStream>>,
    active: Arc<AtomicBool>,
}

impl StreamingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `endpoint`, send `hello` and start forwarding frames
    pub async fn start<H: Serialize>(
        &self,
        endpoint: &str,
        hello: &H,
        auth_token: Option<&str>,
    ) -> Result<()> {
        if self.is_active() {
            return Err(TransportError::AlreadyActive.into());
        }
        // Leftovers from a stream that ended on its own
        self.stop().await;

        let mut request = endpoint
            .into_client_request()
            .map_err(TransportError::from)?;
        if let Some(token) = auth_token.map(str::trim).filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(token)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(ADMIN_TOKEN_HEADER, value);
        }

        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(TransportError::from)?;

        let hello = serde_json::to_string(hello).map_err(ProtocolError::from)?;
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.active.store(true, Ordering::Release);
        let task = tokio::spawn(send_loop(ws, rx, cancel.clone(), self.active.clone()));

        *self.stream.lock() = Some(ActiveStream { cancel, tx, task });
        tracing::info!("Streaming to {}", endpoint);
        Ok(())
    }

    /// Queue a frame. Returns false when no stream is running.
    pub fn enqueue_audio(&self, frame: Bytes) -> bool {
        if !self.is_active() {
            return false;
        }
        self.stream
            .lock()
            .as_ref()
            .is_some_and(|stream| stream.tx.send(frame).is_ok())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cancel the send loop, wait for it and close the socket
    pub async fn stop(&self) {
        let Some(stream) = self.stream.lock().take() else {
            return;
        };
        stream.cancel.cancel();
        drop(stream.tx);

        if let Ok(Some(mut ws)) = stream.task.await {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("ptt_stop"),
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, ws.close(Some(frame)))
                .await
                .is_err()
            {
                tracing::debug!("Close handshake timed out");
            }
        }
        self.active.store(false, Ordering::Release);
        tracing::info!("Streaming stopped");
    }
}

/// Returns the socket when it is still open
async fn send_loop(
    mut ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
) -> Option<WsStream> {
    let open = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break true,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws.send(Message::Binary(frame)).await {
                        tracing::debug!("Stream send failed: {}", e);
                        break false;
                    }
                }
                None => break true,
            },
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break false,
                Some(Ok(_)) => {}
            },
        }
    };

    active.store(false, Ordering::Release);
    open.then_some(ws)
}
