//! Transport session
//!
//! One WebSocket to the relay carries JSON control frames and binary voice
//! frames. Each connection attempt owns a [`Link`] whose cancellation token
//! stops the three background tasks: the inbound reader, the audio drain
//! and the heartbeat.
//!
//! The session never decides whether to retry. Unexpected drops are
//! published as [`LinkSignal::Lost`] for a supervisor to act on.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::audio::format::{to_wire_pcm, PcmFormat};
use crate::audio::mixer::{FrequencySettings, FrequencyTable, Mixer};
use crate::audio::playback::PlaybackOutput;
use crate::codec::{OpusDecoder, VoiceFramer};
use crate::config::{AudioConfig, ClientConfig, OpusConfig, RelayConfig, SessionConfig};
use crate::constants::MAX_GAIN;
use crate::error::{Result, TransportError};
use crate::network::endpoint::Endpoint;
use crate::network::events::{LinkSignal, SessionEvent};
use crate::network::queue::{AudioSendQueue, PushOutcome};
use crate::protocol::{AudioPacket, ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to (re)establish a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u32,
    pub discord_user_id: String,
    pub guild_id: String,
    pub auth_token: String,
}

impl From<&RelayConfig> for ConnectParams {
    fn from(relay: &RelayConfig) -> Self {
        Self {
            host: relay.host.clone(),
            port: relay.port,
            discord_user_id: relay.discord_user_id.clone(),
            guild_id: relay.guild_id.clone(),
            auth_token: relay.auth_token.clone(),
        }
    }
}

/// What the relay has confirmed about one joined frequency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinedFrequency {
    pub listener_count: u32,
    pub server_muted: bool,
}

/// Snapshot of session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_queued: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub encode_errors: u64,
    pub frames_received: u64,
    pub frames_muted: u64,
    pub frames_played: u64,
    pub decode_errors: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_queued: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    encode_errors: AtomicU64,
    frames_received: AtomicU64,
    frames_muted: AtomicU64,
    frames_played: AtomicU64,
    decode_errors: AtomicU64,
    malformed_frames: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            packets_queued: self.packets_queued.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_muted: self.frames_muted.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthStatus {
    Pending,
    Accepted,
    Rejected(String),
}

/// One connection attempt and the tasks bound to it
struct Link {
    id: u64,
    cancel: CancellationToken,
    sink: AsyncMutex<WsSink>,
    audio: AudioSendQueue,
    auth: watch::Sender<AuthStatus>,
    last_pong: Mutex<Instant>,
    established: AtomicBool,
    /// Set when we are the ones closing it
    intentional: AtomicBool,
    lost_reported: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    fn new(id: u64, sink: WsSink, queue_capacity: usize) -> Self {
        let (auth, _) = watch::channel(AuthStatus::Pending);
        Self {
            id,
            cancel: CancellationToken::new(),
            sink: AsyncMutex::new(sink),
            audio: AudioSendQueue::new(queue_capacity),
            auth,
            last_pong: Mutex::new(Instant::now()),
            established: AtomicBool::new(false),
            intentional: AtomicBool::new(false),
            lost_reported: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn send_control(&self, message: &ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn send_audio(&self, frame: Bytes) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Stop every task of this link without waiting for them
    fn halt(&self) {
        self.cancel.cancel();
        self.audio.close();
    }
}

struct SessionShared {
    config: SessionConfig,
    opus: OpusConfig,
    audio: Mutex<AudioConfig>,
    events: broadcast::Sender<SessionEvent>,
    signals: broadcast::Sender<LinkSignal>,
    mixer: Arc<Mixer>,

    connected: AtomicBool,
    transmitting: AtomicBool,
    /// f32 bits
    input_gain: AtomicU32,
    current_freq: Mutex<Option<i32>>,
    session_token: Mutex<Option<String>>,
    last_params: Mutex<Option<ConnectParams>>,
    link: Mutex<Option<Arc<Link>>>,
    next_link_id: AtomicU64,

    /// PCM accumulation and encoder, guarded by its own lock
    transmitter: Mutex<Option<VoiceFramer>>,
    /// Playback device and its ring, guarded by its own lock
    playback: Mutex<Option<PlaybackOutput>>,

    joined: DashMap<i32, JoinedFrequency>,
    counters: Counters,
}

/// Handle to a voice session. Clones share the same connection.
#[derive(Clone)]
pub struct TransportSession {
    shared: Arc<SessionShared>,
}

impl TransportSession {
    pub fn new(config: SessionConfig, audio: AudioConfig, opus: OpusConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (signals, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mixer = Arc::new(Mixer::new(Arc::new(FrequencyTable::new())));
        mixer.set_master_volume(audio.output_volume);
        let input_gain = audio.input_gain.clamp(0.0, MAX_GAIN);

        Self {
            shared: Arc::new(SessionShared {
                config,
                opus,
                audio: Mutex::new(audio),
                events,
                signals,
                mixer,
                connected: AtomicBool::new(false),
                transmitting: AtomicBool::new(false),
                input_gain: AtomicU32::new(input_gain.to_bits()),
                current_freq: Mutex::new(None),
                session_token: Mutex::new(None),
                last_params: Mutex::new(None),
                link: Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                transmitter: Mutex::new(None),
                playback: Mutex::new(None),
                joined: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Build a session and seed the frequency table from a client config
    pub fn from_config(config: &ClientConfig) -> Self {
        let session = Self::new(
            config.session.clone(),
            config.audio.clone(),
            config.opus.clone(),
        );
        let table = session.frequency_settings();
        for freq in &config.frequencies {
            table.set(freq.id, FrequencySettings::new(freq.volume, freq.pan, freq.muted));
        }
        session
    }

    /// Connect and authenticate.
    ///
    /// Returns `Err` only for invalid host or port, before any I/O. Network
    /// and auth failures are reported as status events and yield `Ok(false)`.
    pub async fn connect(&self, params: ConnectParams) -> Result<bool> {
        let endpoint = Endpoint::parse(&params.host, params.port)?;
        let shared = &self.shared;

        *shared.last_params.lock() = Some(params.clone());
        if let Some(old) = shared.take_link() {
            shared.close_link(old, true).await;
            shared.release_resources();
        }

        shared.status("Connecting...");
        let url = endpoint.url();
        shared.status(format!("Connecting to {} ...", url));

        let ws = match tokio::time::timeout(shared.config.connect_timeout(), connect_async(url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                tracing::warn!("Connect to {} failed: {}", url, e);
                shared.error(e.to_string());
                shared.status(format!("WebSocket connect failed: {}", e));
                return Ok(false);
            }
            Err(_) => {
                tracing::warn!("Connect to {} timed out", url);
                shared.status("WebSocket connect failed: timed out");
                return Ok(false);
            }
        };

        let (sink, source) = ws.split();
        let link = Arc::new(Link::new(
            shared.next_link_id.fetch_add(1, Ordering::Relaxed),
            sink,
            shared.config.send_queue_capacity,
        ));
        *shared.link.lock() = Some(link.clone());

        let mut auth_rx = link.auth.subscribe();
        let inbound = tokio::spawn(inbound_loop(shared.clone(), link.clone(), source));
        link.tasks.lock().push(inbound);

        shared.status("WebSocket connected, sending auth...");
        let auth = ClientMessage::Auth {
            discord_user_id: params.discord_user_id,
            freq_id: *shared.current_freq.lock(),
            guild_id: params.guild_id,
            auth_token: params.auth_token,
        };
        if let Err(e) = link.send_control(&auth).await {
            tracing::warn!("Failed to send auth: {}", e);
            shared.status(format!("WebSocket connect failed: {}", e));
            shared.abandon_link(&link).await;
            return Ok(false);
        }

        // No lock is held while waiting; the inbound task resolves auth
        let outcome = tokio::select! {
            _ = link.cancel.cancelled() => None,
            waited = tokio::time::timeout(
                shared.config.auth_timeout(),
                auth_rx.wait_for(|status| *status != AuthStatus::Pending),
            ) => match waited {
                Ok(Ok(status)) => Some(status.clone()),
                Ok(Err(_)) => None,
                Err(_) => {
                    shared.status("Auth timeout - server did not respond");
                    None
                }
            },
        };

        match outcome {
            Some(AuthStatus::Accepted) => Ok(true),
            _ => {
                shared.abandon_link(&link).await;
                Ok(false)
            }
        }
    }

    /// Close the connection and release every per-connection resource.
    /// Safe to call in any state.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        if let Some(link) = shared.take_link() {
            shared.close_link(link, true).await;
        }
        shared.release_resources();
        shared.status("Disconnected");
    }

    /// Quietly drop whatever is left of a lost connection before a retry
    pub async fn release_for_reconnect(&self) {
        let shared = &self.shared;
        if let Some(link) = shared.take_link() {
            shared.close_link(link, false).await;
        }
        shared.release_resources();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn session_token(&self) -> Option<String> {
        self.shared.session_token.lock().clone()
    }

    /// Frequency outgoing audio is tagged with
    pub fn current_frequency(&self) -> Option<i32> {
        *self.shared.current_freq.lock()
    }

    pub fn last_params(&self) -> Option<ConnectParams> {
        self.shared.last_params.lock().clone()
    }

    /// Ask the relay to join a frequency. Outgoing audio is tagged with it
    /// right away; the listener count arrives with `join_ok`.
    pub async fn join_frequency(&self, freq_id: i32) -> bool {
        let sent = self.send_control(ClientMessage::Join { freq_id }).await;
        if sent {
            *self.shared.current_freq.lock() = Some(freq_id);
        }
        sent
    }

    pub async fn leave_frequency(&self, freq_id: i32) -> bool {
        let sent = self.send_control(ClientMessage::Leave { freq_id }).await;
        if sent {
            // leave has no confirmation message
            self.shared.joined.remove(&freq_id);
        }
        sent
    }

    pub async fn mute_frequency(&self, freq_id: i32) -> bool {
        self.send_control(ClientMessage::Mute { freq_id }).await
    }

    pub async fn unmute_frequency(&self, freq_id: i32) -> bool {
        self.send_control(ClientMessage::Unmute { freq_id }).await
    }

    async fn send_control(&self, message: ClientMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(link) = self.shared.current_link() else {
            return false;
        };
        match link.send_control(&message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Control send failed: {}", e);
                false
            }
        }
    }

    /// Begin a transmission with a fresh encoder and sequence 0
    pub fn start_transmit(&self) -> Result<()> {
        let gain = f32::from_bits(self.shared.input_gain.load(Ordering::Relaxed));
        let framer = VoiceFramer::new(&self.shared.opus, gain)?;
        *self.shared.transmitter.lock() = Some(framer);
        self.shared.transmitting.store(true, Ordering::Release);
        tracing::debug!("Transmit started");
        Ok(())
    }

    /// End the transmission. Buffered partial frames are discarded.
    pub fn stop_transmit(&self) {
        self.shared.transmitting.store(false, Ordering::Release);
        *self.shared.transmitter.lock() = None;
        tracing::debug!("Transmit stopped");
    }

    pub fn is_transmitting(&self) -> bool {
        self.shared.transmitting.load(Ordering::Acquire)
    }

    /// Feed captured PCM. Never blocks on the network.
    pub fn send_audio(&self, pcm: &[u8], format: PcmFormat) {
        let shared = &self.shared;
        if !self.is_transmitting() || !self.is_connected() {
            return;
        }
        let Some(link) = shared.current_link() else {
            return;
        };

        let samples = match to_wire_pcm(pcm, format) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::debug!("Dropping captured audio: {}", e);
                return;
            }
        };
        let freq_id = shared.current_freq.lock().unwrap_or(0);

        let packets = {
            let mut guard = shared.transmitter.lock();
            let Some(framer) = guard.as_mut() else {
                return;
            };
            let errors_before = framer.encode_errors();
            let packets = framer.push(freq_id, &samples);
            let new_errors = framer.encode_errors() - errors_before;
            if new_errors > 0 {
                shared
                    .counters
                    .encode_errors
                    .fetch_add(new_errors, Ordering::Relaxed);
            }
            packets
        };

        for packet in packets {
            match link.audio.push(packet.encode()) {
                PushOutcome::Queued => Counters::bump(&shared.counters.packets_queued),
                PushOutcome::DroppedOldest => {
                    Counters::bump(&shared.counters.packets_queued);
                    Counters::bump(&shared.counters.packets_dropped);
                }
                PushOutcome::Closed => break,
            }
        }
    }

    /// Per-frequency volume, pan and mute, shared with the inbound path
    pub fn frequency_settings(&self) -> Arc<FrequencyTable> {
        self.shared.mixer.table().clone()
    }

    pub fn set_input_gain(&self, gain: f32) {
        let gain = gain.clamp(0.0, MAX_GAIN);
        self.shared.input_gain.store(gain.to_bits(), Ordering::Relaxed);
        if let Some(framer) = self.shared.transmitter.lock().as_mut() {
            framer.set_gain(gain);
        }
    }

    pub fn set_output_volume(&self, volume: f32) {
        self.shared.mixer.set_master_volume(volume);
    }

    /// Select the output device. An open playback output is rebuilt on it.
    pub async fn set_output_device(&self, name: Option<String>) {
        self.shared.audio.lock().output_device = name;
        let shared = self.shared.clone();
        let _ = tokio::task::spawn_blocking(move || shared.reopen_playback_if_open()).await;
    }

    /// Samples waiting in the playback ring
    pub fn playback_buffered(&self) -> usize {
        self.shared
            .playback
            .lock()
            .as_ref()
            .map_or(0, |output| output.ring().len())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn link_signals(&self) -> broadcast::Receiver<LinkSignal> {
        self.shared.signals.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Frequencies confirmed by the relay on the current connection
    pub fn joined_frequencies(&self) -> Vec<(i32, JoinedFrequency)> {
        let mut joined: Vec<_> = self
            .shared
            .joined
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        joined.sort_by_key(|(id, _)| *id);
        joined
    }
}

impl SessionShared {
    fn status(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("{}", text);
        let _ = self.events.send(SessionEvent::Status(text));
    }

    fn error(&self, text: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Error(text.into()));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().clone()
    }

    fn take_link(&self) -> Option<Arc<Link>> {
        self.link.lock().take()
    }

    fn is_current(&self, link: &Link) -> bool {
        self.link.lock().as_ref().is_some_and(|current| current.id == link.id)
    }

    /// Cancel a link, optionally say goodbye, and wait for its tasks
    async fn close_link(&self, link: Arc<Link>, handshake: bool) {
        link.intentional.store(true, Ordering::Release);
        link.halt();
        self.connected.store(false, Ordering::Release);

        let close_timeout = self.config.close_timeout();
        if handshake {
            let goodbye = async {
                let mut sink = link.sink.lock().await;
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("bye"),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = sink.close().await;
            };
            if tokio::time::timeout(close_timeout, goodbye).await.is_err() {
                tracing::debug!("Close handshake timed out");
            }
        }

        let tasks = std::mem::take(&mut *link.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(close_timeout, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    /// Drop a link that never became usable
    async fn abandon_link(&self, link: &Arc<Link>) {
        let was_current = {
            let mut slot = self.link.lock();
            if slot.as_ref().is_some_and(|current| current.id == link.id) {
                slot.take();
                true
            } else {
                false
            }
        };
        self.close_link(link.clone(), true).await;
        if was_current {
            self.release_resources();
        }
    }

    fn release_resources(&self) {
        self.connected.store(false, Ordering::Release);
        self.transmitting.store(false, Ordering::Release);
        *self.transmitter.lock() = None;
        if let Some(mut output) = self.playback.lock().take() {
            output.stop();
        }
        *self.session_token.lock() = None;
        self.joined.clear();
    }

    /// The link ended without us closing it
    fn link_dropped(&self, link: &Link, reason: String) {
        if link.intentional.load(Ordering::Acquire) || !self.is_current(link) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        link.halt();

        if link.established.load(Ordering::Acquire) && !link.lost_reported.swap(true, Ordering::AcqRel)
        {
            tracing::warn!("Connection lost: {}", reason);
            let _ = self.signals.send(LinkSignal::Lost { reason });
        }
    }

    async fn on_authenticated(self: &Arc<Self>, link: &Arc<Link>) {
        if link.established.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || shared.open_playback()).await {
            tracing::warn!("Playback init failed: {}", e);
        }

        if link.cancel.is_cancelled() {
            return;
        }
        *link.last_pong.lock() = Instant::now();
        self.connected.store(true, Ordering::Release);

        let drain = tokio::spawn(drain_loop(self.clone(), link.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), link.clone()));
        link.tasks.lock().extend([drain, heartbeat]);

        self.status("Connected");
        let _ = self.signals.send(LinkSignal::Established);
        link.auth.send_replace(AuthStatus::Accepted);
    }

    fn open_playback(&self) {
        let audio = self.audio.lock().clone();
        let mut guard = self.playback.lock();
        if let Some(mut old) = guard.take() {
            old.stop();
        }
        *guard = Some(PlaybackOutput::open(
            audio.output_device.as_deref(),
            audio.playback_buffer_ms,
            audio.device_playback,
        ));
    }

    fn reopen_playback_if_open(&self) {
        let audio = self.audio.lock().clone();
        let mut guard = self.playback.lock();
        if let Some(mut old) = guard.take() {
            old.stop();
            *guard = Some(PlaybackOutput::open(
                audio.output_device.as_deref(),
                audio.playback_buffer_ms,
                audio.device_playback,
            ));
        }
    }

    /// Surface errors raised by the output device callback
    fn report_playback_errors(&self) {
        let errors: Vec<_> = {
            let playback = self.playback.lock();
            let Some(output) = playback.as_ref() else {
                return;
            };
            std::iter::from_fn(|| output.check_errors()).collect()
        };
        for e in errors {
            tracing::warn!("Playback error: {}", e);
            self.error(e.to_string());
        }
    }

    fn handle_audio_frame(&self, frame: &[u8], decoder: Option<&mut OpusDecoder>) {
        Counters::bump(&self.counters.frames_received);

        let packet = match AudioPacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                Counters::bump(&self.counters.malformed_frames);
                tracing::debug!("Dropping audio frame: {}", e);
                return;
            }
        };

        if self.mixer.table().is_muted(packet.freq_id) {
            Counters::bump(&self.counters.frames_muted);
            return;
        }

        let Some(decoder) = decoder else {
            return;
        };
        let pcm = match decoder.decode(&packet.payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                Counters::bump(&self.counters.decode_errors);
                tracing::debug!("Skipping frame on {}: {}", packet.freq_id, e);
                return;
            }
        };

        // Muted again while decoding
        let Some(stereo) = self.mixer.render(packet.freq_id, &pcm) else {
            Counters::bump(&self.counters.frames_muted);
            return;
        };

        let playback = self.playback.lock();
        if let Some(output) = playback.as_ref() {
            output.write(&stereo);
            Counters::bump(&self.counters.frames_played);
        }
    }

    async fn handle_control(self: &Arc<Self>, link: &Arc<Link>, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Unparseable control message: {}", text);
                self.status(format!("WS parse error: {}", e));
                return;
            }
        };

        match message {
            ServerMessage::AuthOk { session_token } => {
                *self.session_token.lock() = Some(session_token.unwrap_or_default());
                self.on_authenticated(link).await;
            }
            ServerMessage::AuthError { reason } => {
                let reason = reason.unwrap_or_else(|| "unknown".to_string());
                self.status(format!("Auth failed: {}", reason));
                self.connected.store(false, Ordering::Release);
                link.auth.send_replace(AuthStatus::Rejected(reason));
            }
            ServerMessage::JoinOk {
                freq_id,
                listener_count,
            } => {
                self.joined.entry(freq_id).or_default().listener_count = listener_count;
                self.emit(SessionEvent::FrequencyJoined {
                    freq_id,
                    listener_count,
                });
            }
            ServerMessage::ListenerUpdate {
                freq_id,
                listener_count,
            } => {
                if let Some(mut joined) = self.joined.get_mut(&freq_id) {
                    joined.listener_count = listener_count;
                }
                self.emit(SessionEvent::ListenerCount {
                    freq_id,
                    listener_count,
                });
            }
            ServerMessage::MuteOk { freq_id, muted } => {
                if let Some(mut joined) = self.joined.get_mut(&freq_id) {
                    joined.server_muted = muted;
                }
                self.emit(SessionEvent::MuteConfirmed { freq_id, muted });
            }
            ServerMessage::Rx {
                discord_user_id,
                username,
                freq_id,
                action,
            } => {
                let display_name = username
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| discord_user_id.clone());
                self.emit(SessionEvent::RxStateChanged {
                    user_id: discord_user_id,
                    display_name,
                    freq_id,
                    action,
                });
            }
            ServerMessage::Pong => {
                *link.last_pong.lock() = Instant::now();
            }
            ServerMessage::Error { message } => {
                let message = message.unwrap_or_else(|| "unknown error".to_string());
                self.status(format!("Server error: {}", message));
                self.error(message);
            }
            ServerMessage::Unknown => {
                tracing::debug!("Ignoring control message: {}", text);
            }
        }
    }

    /// One-shot recovery used when no supervisor is attached
    fn spawn_self_reconnect(self: &Arc<Self>) {
        let Some(params) = self.last_params.lock().clone() else {
            return;
        };
        let session = TransportSession {
            shared: self.clone(),
        };
        tokio::spawn(async move {
            session.release_for_reconnect().await;
            match session.connect(params).await {
                Ok(true) => tracing::info!("Self-reconnect succeeded"),
                Ok(false) => tracing::warn!("Self-reconnect failed"),
                Err(e) => tracing::warn!("Self-reconnect rejected: {}", e),
            }
        });
    }
}

async fn inbound_loop(shared: Arc<SessionShared>, link: Arc<Link>, mut source: WsSource) {
    let mut decoder = match OpusDecoder::new() {
        Ok(decoder) => Some(decoder),
        Err(e) => {
            tracing::warn!("Inbound audio disabled: {}", e);
            None
        }
    };

    let reason = loop {
        let next = tokio::select! {
            _ = link.cancel.cancelled() => break None,
            next = source.next() => next,
        };

        match next {
            Some(Ok(Message::Binary(frame))) => {
                shared.handle_audio_frame(&frame, decoder.as_mut());
            }
            Some(Ok(Message::Text(text))) => {
                shared.handle_control(&link, text.as_str()).await;
            }
            Some(Ok(Message::Close(frame))) => {
                shared.status("Server closed connection");
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "server closed connection".to_string());
                break Some(reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if !link.cancel.is_cancelled() {
                    tracing::warn!("Read failed: {}", e);
                    shared.error(e.to_string());
                }
                break Some(e.to_string());
            }
            None => break Some("connection closed".to_string()),
        }
    };

    if let Some(reason) = reason {
        shared.link_dropped(&link, reason);
    }
    tracing::debug!("Inbound loop {} finished", link.id);
}

async fn drain_loop(shared: Arc<SessionShared>, link: Arc<Link>) {
    loop {
        let frame = tokio::select! {
            _ = link.cancel.cancelled() => break,
            frame = link.audio.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match tokio::time::timeout(shared.config.heartbeat_interval(), link.send_audio(frame)).await
        {
            Ok(Ok(())) => Counters::bump(&shared.counters.packets_sent),
            Ok(Err(e)) => {
                tracing::debug!("Audio send failed: {}", e);
                break;
            }
            Err(_) => {
                shared.link_dropped(&link, "audio send stalled".to_string());
                break;
            }
        }
    }
    tracing::debug!("Audio drain {} finished", link.id);
}

async fn heartbeat_loop(shared: Arc<SessionShared>, link: Arc<Link>) {
    let period = shared.config.heartbeat_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        shared.report_playback_errors();

        // Checked before sending so a stalled socket cannot hide a dead link
        let silent = link.last_pong.lock().elapsed();
        if silent > shared.config.heartbeat_timeout() {
            shared.status("Heartbeat timeout - reconnecting...");
            shared.link_dropped(&link, "heartbeat timeout".to_string());
            if shared.config.self_reconnect_on_heartbeat {
                shared.spawn_self_reconnect();
            }
            return;
        }

        match tokio::time::timeout(period, link.send_control(&ClientMessage::Ping)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Ping failed: {}", e),
            Err(_) => tracing::debug!("Ping send stalled"),
        }
    }
}
