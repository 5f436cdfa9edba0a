//! Session driver: owns the reconnect state machine and feeds the engine.
//!
//! The driver reacts to three inputs: socket events, connect results and a one-second
//! tick. Every [`TransportCommand`] the machine returns is carried out here. Inbound
//! frames go to a single applier task that hands them to the engine in arrival order;
//! a chunk frame must never overtake the metadata frame that opened its session.
//! Ledger changes are flushed to disk on a fixed interval and once more on shutdown.

use crate::config::sync_url;
use crate::connection::{Inbound, SocketEvent, WsConnection};
use crate::kv_store::JsonFileKv;
use crate::log_file::FileAppender;
use crate::native_fs::NativeFs;
use crate::watcher::FileWatcher;
use anyhow::Result;
use fastsync_core::protocol::{Envelope, split_text};
use fastsync_core::{
    Action, ConnectionMachine, ReconnectPolicy, SyncEngine, SyncEvent, SyncLog, SyncSettings,
    TransportCommand, TransportEvent,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectResult {
    Opened(Box<Socket>),
    Failed(String),
}

pub struct SyncClient {
    engine: SyncEngine,
    conn: Arc<WsConnection>,
    machine: ConnectionMachine,
    attempt: u32,
    started: Instant,
    socket_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_rx: mpsc::UnboundedReceiver<SocketEvent>,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,
    frames_tx: mpsc::UnboundedSender<Inbound>,
    frames_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
}

impl SyncClient {
    /// Build the engine over a local vault directory and load its hash stores.
    pub async fn open(vault_path: &Path, settings: SyncSettings) -> Result<Self> {
        let fs = Arc::new(NativeFs::new(vault_path.to_path_buf()));
        let kv = Arc::new(JsonFileKv::open(vault_path));
        let log = Arc::new(SyncLog::new(Arc::new(FileAppender::new(vault_path))));
        let conn = Arc::new(WsConnection::new());

        let engine = SyncEngine::builder(settings, fs, kv, conn.clone()).log(log).build();
        engine.initialize_stores().await?;
        info!("Hash stores ready for {}", vault_path.display());
        Ok(Self::with_engine(engine, conn))
    }

    pub fn with_engine(engine: SyncEngine, conn: Arc<WsConnection>) -> Self {
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            conn,
            machine: ConnectionMachine::new(ReconnectPolicy::default()),
            attempt: 0,
            started: Instant::now(),
            socket_tx,
            socket_rx,
            connect_tx,
            connect_rx,
            frames_tx,
            frames_rx: Some(frames_rx),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn connection(&self) -> &Arc<WsConnection> {
        &self.conn
    }

    /// Feed watcher events to the engine one at a time. The task owns the watcher.
    pub fn forward_local_events(&self, mut watcher: FileWatcher) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            while let Some(event) = watcher.event_rx().recv().await {
                engine.on_local_event(event).await;
            }
            debug!("Watcher for {} stopped", watcher.vault_path().display());
        });
    }

    /// Connect and keep the session alive until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(frames) = self.frames_rx.take() {
            tokio::spawn(apply_frames(self.engine.clone(), frames));
        }
        let flusher = tokio::spawn(flush_periodically(self.engine.clone()));
        self.step(TransportEvent::Register);
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                Some(event) = self.socket_rx.recv() => {
                    self.on_socket_event(event);
                }
                Some(result) = self.connect_rx.recv() => {
                    self.on_connect_result(result);
                }
                _ = tick.tick() => {
                    self.step(TransportEvent::Tick);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Closing sync session");
        self.step(TransportEvent::Unregister);
        flusher.abort();
        self.engine.flush().await;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn step(&mut self, event: TransportEvent) {
        let now = self.now_ms();
        let command = self.machine.handle(event, now);
        self.execute(command);
    }

    fn execute(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Nothing => {}
            TransportCommand::Connect => self.connect(),
            TransportCommand::SendAuthorization => {
                let outbox = self.engine.context().outbox.clone();
                let token = self.engine.context().settings.api_token.clone();
                tokio::spawn(async move {
                    if let Err(e) = outbox.send_raw(Action::Authorization, &token).await {
                        warn!("Failed to send authorization: {}", e);
                    }
                });
            }
            TransportCommand::StartSession => {
                info!("Authorized with sync server");
                self.conn.set_authenticated(true);
                let engine = self.engine.clone();
                tokio::spawn(async move { engine.on_authenticated().await });
            }
            TransportCommand::ScheduleReconnect { delay } => {
                info!("Reconnecting in {:?} (attempt {})", delay, self.machine.attempts());
            }
            TransportCommand::Close { code, reason } => {
                debug!("Closing socket: {}", reason);
                self.conn.close(code, reason);
            }
            TransportCommand::GiveUp => {
                error!("Giving up after {} reconnect attempts", self.machine.attempts());
                self.engine
                    .events()
                    .emit(SyncEvent::error("Unable to reach the sync server, reconnect gave up"));
            }
        }
    }

    fn connect(&mut self) {
        self.attempt += 1;
        let url = sync_url(&self.engine.context().settings.server_url, self.attempt);
        info!("Connecting to {}", url);
        let results = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = match connect_async(url.as_str()).await {
                Ok((stream, _)) => ConnectResult::Opened(Box::new(stream)),
                Err(e) => ConnectResult::Failed(e.to_string()),
            };
            let _ = results.send(result);
        });
    }

    fn on_connect_result(&mut self, result: ConnectResult) {
        match result {
            ConnectResult::Opened(stream) => {
                if !self.machine.is_registered() {
                    debug!("Connected after unregister, dropping socket");
                    return;
                }
                let socket = self.conn.attach(*stream, self.socket_tx.clone());
                debug!("Socket {} open", socket);
                self.step(TransportEvent::Opened);
            }
            ConnectResult::Failed(e) => {
                warn!("Connection failed: {}", e);
                self.step(TransportEvent::ConnectFailed);
            }
        }
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        let current = self.conn.socket();
        match event.inbound {
            Inbound::Closed { reason } => {
                if current.is_some() && current != Some(event.socket) {
                    return;
                }
                info!("Disconnected from sync server ({})", reason);
                self.conn.detach();
                self.forward(Inbound::Closed { reason: reason.clone() });
                self.step(TransportEvent::Closed { reason });
            }
            _ if current != Some(event.socket) => {
                debug!("Dropping frame from stale socket {}", event.socket);
            }
            Inbound::Text(text) => {
                if is_authorization(&text) {
                    self.on_authorization_ack(&text);
                    return;
                }
                self.forward(Inbound::Text(text));
            }
            Inbound::Binary(data) => self.forward(Inbound::Binary(data)),
        }
    }

    fn forward(&self, frame: Inbound) {
        if self.frames_tx.send(frame).is_err() {
            warn!("Frame applier stopped, dropping inbound frame");
        }
    }

    fn on_authorization_ack(&mut self, text: &str) {
        let accepted = match split_text(text).map(|(_, payload)| Envelope::parse(payload)) {
            Ok(Ok(envelope)) if !envelope.is_error() => true,
            Ok(Ok(envelope)) => {
                let message = envelope.describe_error();
                error!("Authorization rejected: {}", message);
                self.engine
                    .events()
                    .emit(SyncEvent::error(format!("Authorization failed: {}", message)));
                false
            }
            Ok(Err(e)) | Err(e) => {
                error!("Unreadable authorization reply: {}", e);
                self.engine
                    .events()
                    .emit(SyncEvent::error("Authorization failed: unreadable server reply"));
                false
            }
        };
        let event = if accepted {
            TransportEvent::AuthAccepted
        } else {
            TransportEvent::AuthRejected
        };
        self.step(event);
    }
}

/// Apply inbound frames one at a time. A close runs the engine's disconnect handling
/// only after every frame received before it.
async fn apply_frames(engine: SyncEngine, mut frames: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(frame) = frames.recv().await {
        match frame {
            Inbound::Text(text) => engine.handle_text(&text).await,
            Inbound::Binary(data) => engine.handle_binary(&data).await,
            Inbound::Closed { .. } => engine.on_disconnected(),
        }
    }
}

async fn flush_periodically(engine: SyncEngine) {
    let mut interval = tokio::time::interval(engine.context().timings.store_flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        engine.flush().await;
    }
}

fn is_authorization(text: &str) -> bool {
    matches!(split_text(text), Ok((name, _)) if name == Action::Authorization.as_str())
}
