//! Connection abstraction, outbound backpressure and the reconnect state machine.
//!
//! Implementations of [`Connection`]:
//! - `WsConnection` (in fastsync-client) - tokio-tungstenite websocket
//! - `MemoryConnection` - records frames for tests

use crate::protocol::{self, Action};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    /// The socket went away while a frame was waiting to be queued.
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Close reasons after which the client must not reconnect on its own.
pub const CLOSE_AUTH_FAILED: &str = "AuthorizationFaild";
pub const CLOSE_CLIENT: &str = "ClientClose";
pub const CLOSE_UNREGISTER: &str = "unRegister";

pub fn suppresses_reconnect(reason: &str) -> bool {
    matches!(reason, CLOSE_AUTH_FAILED | CLOSE_CLIENT | CLOSE_UNREGISTER)
}

/// The live duplex connection to the server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Queue a text frame.
    async fn send_text(&self, frame: String) -> Result<()>;

    /// Queue a binary frame.
    async fn send_binary(&self, frame: Vec<u8>) -> Result<()>;

    /// Bytes queued but not yet written to the socket.
    fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    fn is_authenticated(&self) -> bool;
}

/// Sending side used by the engine. Every send waits for the buffer to drain first.
#[derive(Clone)]
pub struct Outbox {
    conn: Arc<dyn Connection>,
    threshold: usize,
    poll: Duration,
}

impl Outbox {
    pub fn new(conn: Arc<dyn Connection>, threshold: usize, poll: Duration) -> Self {
        Self { conn, threshold, poll }
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn.is_authenticated()
    }

    pub fn buffered_amount(&self) -> usize {
        self.conn.buffered_amount()
    }

    /// Wait until queued bytes fall below the threshold.
    pub async fn wait_for_drain(&self) -> Result<()> {
        let mut logged = false;
        while self.conn.buffered_amount() >= self.threshold {
            if !self.conn.is_open() {
                return Err(TransportError::Closed);
            }
            if !logged {
                debug!(
                    "Send buffer at {} bytes, waiting for it to drain",
                    self.conn.buffered_amount()
                );
                logged = true;
            }
            tokio::time::sleep(self.poll).await;
        }
        Ok(())
    }

    /// Send a JSON payload under `action`. Returns the frame size.
    pub async fn send<T: Serialize + Sync>(&self, action: Action, payload: &T) -> Result<usize> {
        let frame = protocol::encode_text(action.as_str(), payload)?;
        let size = frame.len();
        self.wait_for_drain().await?;
        self.conn.send_text(frame).await?;
        Ok(size)
    }

    /// Send a raw string payload under `action`.
    pub async fn send_raw(&self, action: Action, payload: &str) -> Result<()> {
        self.wait_for_drain().await?;
        self.conn.send_text(protocol::encode_raw(action.as_str(), payload)).await
    }

    /// Send a binary frame without waiting; callers wait with [`Outbox::wait_for_drain`].
    pub async fn send_binary_now(&self, frame: Vec<u8>) -> Result<()> {
        self.conn.send_binary(frame).await
    }
}

// ==================== Reconnect state machine ====================

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    /// Socket open, authorization sent, no ack yet
    Unauthenticated,
    Authenticated,
    /// Waiting out a backoff before the next connect
    ReconnectPending { attempt: u32, until_ms: u64 },
}

/// Reconnect backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(300),
            max_attempts: 15,
        }
    }
}

/// `base * 2^(attempt - 1)`, capped at `max_delay`.
pub fn backoff_delay(attempt: u32, policy: &ReconnectPolicy) -> Duration {
    let factor = 2f64.powi(attempt.saturating_sub(1) as i32);
    let secs = policy.base_delay.as_secs_f64() * factor;
    Duration::from_secs_f64(secs.min(policy.max_delay.as_secs_f64()))
}

/// Inputs to [`ConnectionMachine::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Register,
    Unregister,
    Opened,
    /// Connect attempt failed before the socket opened
    ConnectFailed,
    AuthAccepted,
    AuthRejected,
    Closed { reason: String },
    Tick,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Nothing,
    Connect,
    SendAuthorization,
    /// Authenticated: send client info and run the startup sync
    StartSession,
    ScheduleReconnect { delay: Duration },
    Close { code: u16, reason: &'static str },
    GiveUp,
}

/// Pure transition function over [`TransportState`]; time is passed in.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: TransportState,
    registered: bool,
    attempts: u32,
    auth_failed: bool,
    policy: ReconnectPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: TransportState::Disconnected,
            registered: false,
            attempts: 0,
            auth_failed: false,
            policy,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn handle(&mut self, event: TransportEvent, now_ms: u64) -> TransportCommand {
        use TransportCommand as Cmd;
        use TransportState as S;

        match event {
            TransportEvent::Register => {
                self.registered = true;
                self.auth_failed = false;
                match self.state {
                    S::Disconnected | S::ReconnectPending { .. } => {
                        self.state = S::Connecting;
                        Cmd::Connect
                    }
                    _ => Cmd::Nothing,
                }
            }
            TransportEvent::Unregister => {
                self.registered = false;
                let was_open = matches!(self.state, S::Unauthenticated | S::Authenticated | S::Connecting);
                self.state = S::Disconnected;
                if was_open {
                    Cmd::Close {
                        code: 1000,
                        reason: CLOSE_UNREGISTER,
                    }
                } else {
                    Cmd::Nothing
                }
            }
            TransportEvent::Opened => {
                self.state = S::Unauthenticated;
                self.attempts = 0;
                Cmd::SendAuthorization
            }
            TransportEvent::AuthAccepted => {
                if self.state == S::Unauthenticated {
                    self.state = S::Authenticated;
                    Cmd::StartSession
                } else {
                    Cmd::Nothing
                }
            }
            TransportEvent::AuthRejected => {
                self.auth_failed = true;
                Cmd::Close {
                    code: 1000,
                    reason: CLOSE_AUTH_FAILED,
                }
            }
            TransportEvent::Closed { reason } => self.on_closed(&reason, now_ms),
            TransportEvent::ConnectFailed => self.on_closed("", now_ms),
            TransportEvent::Tick => match self.state {
                S::ReconnectPending { until_ms, .. } if now_ms >= until_ms && self.registered => {
                    self.state = S::Connecting;
                    Cmd::Connect
                }
                _ => Cmd::Nothing,
            },
        }
    }

    fn on_closed(&mut self, reason: &str, now_ms: u64) -> TransportCommand {
        self.state = TransportState::Disconnected;
        if !self.registered || self.auth_failed || suppresses_reconnect(reason) {
            return TransportCommand::Nothing;
        }
        if self.attempts >= self.policy.max_attempts {
            return TransportCommand::GiveUp;
        }
        self.attempts += 1;
        let delay = backoff_delay(self.attempts, &self.policy);
        self.state = TransportState::ReconnectPending {
            attempt: self.attempts,
            until_ms: now_ms + delay.as_millis() as u64,
        };
        TransportCommand::ScheduleReconnect { delay }
    }
}

// ==================== Test double ====================

/// In-memory [`Connection`] that records every frame.
pub struct MemoryConnection {
    texts: Mutex<Vec<String>>,
    binaries: Mutex<Vec<Vec<u8>>>,
    buffered: AtomicUsize,
    open: AtomicBool,
    authenticated: AtomicBool,
    stall_after_binaries: Mutex<Option<(usize, usize)>>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
            binaries: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
            stall_after_binaries: Mutex::new(None),
        }
    }
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// After `count` binary frames, report `bytes` buffered until [`Self::set_buffered`] clears it.
    pub fn stall_after_binaries(&self, count: usize, bytes: usize) {
        *self.stall_after_binaries.lock().unwrap_or_else(|e| e.into_inner()) = Some((count, bytes));
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn binaries(&self) -> Vec<Vec<u8>> {
        self.binaries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Action names of sent text frames, in order.
    pub fn actions(&self) -> Vec<String> {
        self.texts()
            .iter()
            .filter_map(|t| protocol::split_text(t).ok().map(|(a, _)| a.to_string()))
            .collect()
    }

    /// JSON payloads sent under `action`, in order.
    pub fn payloads(&self, action: Action) -> Vec<serde_json::Value> {
        self.texts()
            .iter()
            .filter_map(|t| protocol::split_text(t).ok())
            .filter(|(a, _)| *a == action.as_str())
            .filter_map(|(_, p)| serde_json::from_str(p).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.binaries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send_text(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
        Ok(())
    }

    async fn send_binary(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let sent = {
            let mut binaries = self.binaries.lock().unwrap_or_else(|e| e.into_inner());
            binaries.push(frame);
            binaries.len()
        };
        let stall = *self.stall_after_binaries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((count, bytes)) = stall {
            if sent == count {
                self.set_buffered(bytes);
            }
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.is_open() && self.authenticated.load(Ordering::SeqCst)
    }
}
