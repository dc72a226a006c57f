//! Reconnect supervisor
//!
//! Owns the [`ConnectionState`] and decides when to retry. The session only
//! reports raw outcomes; every unexpected drop arrives as a
//! [`LinkSignal::Lost`] and starts a back-off retry cycle.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │ lost
//!      │                        └──fail──▶ Disconnected
//!      │                                           ▼
//!      └────────disconnect──────────────── Reconnecting ──ok──▶ Connected
//!                                                  │
//!                                                  └─retries exhausted─▶ Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectConfig;
use crate::error::{ConfigError, Result};
use crate::network::events::{ConnectionState, LinkSignal, SupervisorEvent};
use crate::network::session::{ConnectParams, TransportSession};

/// Capped exponential back-off with proportional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial_ms: f64,
    factor: f64,
    max_ms: f64,
    jitter: f64,
    min_ms: f64,
    max_retries: u32,
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_ms: config.initial_delay_ms as f64,
            factor: config.factor,
            max_ms: config.max_delay_ms as f64,
            jitter: config.jitter_factor,
            min_ms: config.min_delay_ms as f64,
            max_retries: config.max_retries,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl BackoffPolicy {
    fn base_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        (self.initial_ms * self.factor.powi(exponent)).min(self.max_ms)
    }

    /// Delay before jitter: `min(initial * factor^attempt, max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_ms(attempt).round() as u64)
    }

    /// Delay for a given jitter position, `unit` in `[-1, 1]`
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_ms(attempt);
        let jittered = base + unit.clamp(-1.0, 1.0) * self.jitter * base;
        Duration::from_millis(jittered.max(self.min_ms).round() as u64)
    }

    /// Delay with uniformly random jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, unit)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[derive(Default)]
struct RetryState {
    attempt: u32,
    retry: Option<CancellationToken>,
    params: Option<ConnectParams>,
}

struct SupervisorInner {
    session: TransportSession,
    policy: BackoffPolicy,
    retry: Mutex<RetryState>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SupervisorEvent>,
    /// Serializes connect and disconnect calls on the session
    op_lock: AsyncMutex<()>,
    shutdown: CancellationToken,
}

/// State machine driving a [`TransportSession`] through drops and retries
pub struct ReconnectSupervisor {
    inner: Arc<SupervisorInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectSupervisor {
    /// Create a supervisor for `session`. Must be called inside a Tokio runtime.
    pub fn new(session: TransportSession, config: &ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        let signals = session.link_signals();

        let inner = Arc::new(SupervisorInner {
            session,
            policy: BackoffPolicy::from(config),
            retry: Mutex::new(RetryState::default()),
            state,
            events,
            op_lock: AsyncMutex::new(()),
            shutdown: CancellationToken::new(),
        });

        let listener = tokio::spawn(listen(inner.clone(), signals));

        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn session(&self) -> &TransportSession {
        &self.inner.session
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.inner.policy
    }

    /// Parameters used by `connect` and every retry
    pub fn set_connection_params(&self, params: ConnectParams) {
        self.inner.retry.lock().params = Some(params);
    }

    /// Explicit connect. A failed first attempt is not retried.
    pub async fn connect(&self) -> Result<bool> {
        let inner = &self.inner;
        let params = {
            let mut retry = inner.retry.lock();
            if let Some(pending) = retry.retry.take() {
                pending.cancel();
            }
            retry.attempt = 0;
            inner.transition(ConnectionState::Connecting);
            retry.params.clone()
        };
        let Some(params) = params else {
            inner.transition(ConnectionState::Disconnected);
            return Err(ConfigError::InvalidValue {
                key: "relay".to_string(),
                message: "no connection parameters set".to_string(),
            }
            .into());
        };

        let _op = inner.op_lock.lock().await;
        if inner.current() != ConnectionState::Connecting {
            // Disconnected while waiting for the previous operation
            return Ok(false);
        }

        match inner.session.connect(params).await {
            Ok(true) => Ok(inner.on_connected()),
            Ok(false) => {
                inner.transition_from(ConnectionState::Connecting, ConnectionState::Disconnected);
                Ok(false)
            }
            Err(e) => {
                inner.transition_from(ConnectionState::Connecting, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Explicit disconnect. Cancels pending retries first.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut retry = inner.retry.lock();
            if let Some(pending) = retry.retry.take() {
                pending.cancel();
            }
            retry.attempt = 0;
            inner.transition(ConnectionState::Disconnected);
        }
        let _op = inner.op_lock.lock().await;
        inner.session.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Consecutive failed attempts in the current retry cycle
    pub fn attempt(&self) -> u32 {
        self.inner.retry.lock().attempt
    }

    /// Stop supervising and close the session
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect().await;
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl SupervisorInner {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` and return the previous state
    fn transition(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("Connection state: {} -> {}", previous, next);
            let _ = self.events.send(SupervisorEvent::StateChanged(next));
        }
        previous
    }

    fn transition_from(&self, expected: ConnectionState, next: ConnectionState) {
        let _retry = self.retry.lock();
        if self.current() == expected {
            self.transition(next);
        }
    }

    /// Record a successful connect. Returns false when the link was
    /// already gone, in which case a retry cycle has been started instead.
    fn on_connected(self: &Arc<Self>) -> bool {
        let (previous, retry_token) = {
            let mut retry = self.retry.lock();
            if self.current() == ConnectionState::Disconnected {
                // A disconnect is waiting on the op lock and will close this link
                return false;
            }
            retry.attempt = 0;
            if let Some(pending) = retry.retry.take() {
                pending.cancel();
            }
            let previous = self.transition(ConnectionState::Connected);

            // A drop reported before the transition was ignored by the
            // listener, so the session flag is the only trace of it.
            if self.session.is_connected() {
                (previous, None)
            } else {
                tracing::warn!("Connection dropped right after connecting");
                (previous, Some(self.arm_retry(&mut retry)))
            }
        };

        match retry_token {
            None => {
                if previous == ConnectionState::Reconnecting {
                    tracing::info!("Reconnected");
                    let _ = self.events.send(SupervisorEvent::Reconnected);
                }
                true
            }
            Some(token) => {
                tokio::spawn(retry_loop(self.clone(), token));
                false
            }
        }
    }

    fn on_link_lost(self: &Arc<Self>, reason: &str) {
        let token = {
            let mut retry = self.retry.lock();
            match self.current() {
                ConnectionState::Connected => {
                    tracing::warn!("Connection dropped: {}", reason);
                    self.arm_retry(&mut retry)
                }
                // Connect paths re-check the session once they finish
                state => {
                    tracing::debug!("Ignoring drop while {}: {}", state, reason);
                    return;
                }
            }
        };
        tokio::spawn(retry_loop(self.clone(), token));
    }

    /// Enter `Reconnecting` with a fresh retry token. Caller holds the retry lock.
    fn arm_retry(&self, retry: &mut RetryState) -> CancellationToken {
        if let Some(pending) = retry.retry.take() {
            pending.cancel();
        }
        retry.attempt = 0;
        let token = self.shutdown.child_token();
        retry.retry = Some(token.clone());
        self.transition(ConnectionState::Reconnecting);
        token
    }
}

async fn listen(inner: Arc<SupervisorInner>, mut signals: broadcast::Receiver<LinkSignal>) {
    loop {
        let signal = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            signal = signals.recv() => signal,
        };
        match signal {
            Ok(LinkSignal::Lost { reason }) => inner.on_link_lost(&reason),
            Ok(LinkSignal::Established) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} link signals", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn retry_loop(inner: Arc<SupervisorInner>, token: CancellationToken) {
    loop {
        let attempt = inner.retry.lock().attempt;

        if attempt >= inner.policy.max_retries() {
            let mut retry = inner.retry.lock();
            if token.is_cancelled() {
                return;
            }
            retry.retry = None;
            inner.transition(ConnectionState::Failed);
            drop(retry);
            tracing::warn!("Giving up after {} attempts", attempt);
            let _ = inner.events.send(SupervisorEvent::GaveUp);
            return;
        }

        let delay = inner.policy.delay_for(attempt);
        tracing::info!("Reconnect attempt {} in {:?}", attempt + 1, delay);
        let _ = inner
            .events
            .send(SupervisorEvent::RetryScheduled { attempt, delay });

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let _op = inner.op_lock.lock().await;
        let params = {
            let mut retry = inner.retry.lock();
            if token.is_cancelled() {
                return;
            }
            retry.attempt += 1;
            retry.params.clone()
        };
        let Some(params) = params else {
            tracing::warn!("No connection parameters to reconnect with");
            continue;
        };

        inner.session.release_for_reconnect().await;
        let connected = matches!(inner.session.connect(params).await, Ok(true));

        if token.is_cancelled() {
            // A disconnect is waiting on the op lock and will close this link
            return;
        }
        if connected {
            inner.on_connected();
            return;
        }
        tracing::warn!("Reconnect attempt {} failed", attempt + 1);
    }
}
