//! WebSocket connection to the sync server.
//!
//! One `WsConnection` lives for the whole process; each socket the driver opens is
//! attached to it and split into a writer task and a read loop. Frames are queued on an
//! unbounded channel and counted as buffered until the writer has flushed them.

use async_trait::async_trait;
use fastsync_core::transport::{Connection, Result, TransportError};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

/// Frame or close received on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The socket is gone; `reason` is the close-frame reason, empty on network failure.
    Closed { reason: String },
}

/// An [`Inbound`] tagged with the socket it came from.
#[derive(Debug)]
pub struct SocketEvent {
    pub socket: u64,
    pub inbound: Inbound,
}

struct Link {
    socket: u64,
    tx: mpsc::UnboundedSender<Message>,
    buffered: Arc<AtomicUsize>,
}

#[derive(Default)]
pub struct WsConnection {
    link: Mutex<Option<Link>>,
    next_socket: AtomicU64,
    authenticated: AtomicBool,
}

fn frame_len(msg: &Message) -> usize {
    match msg {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

impl WsConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take over a freshly opened socket. Returns its id; events from it carry that id.
    pub fn attach<S>(&self, stream: WebSocketStream<S>, events: mpsc::UnboundedSender<SocketEvent>) -> u64
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed) + 1;
        let (mut write, read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let buffered = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&buffered);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let size = frame_len(&msg);
                let closing = matches!(msg, Message::Close(_));
                let sent = write.send(msg).await;
                counter.fetch_sub(size, Ordering::Relaxed);
                if let Err(e) = sent {
                    debug!("Socket {} writer stopped: {}", socket, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(Self::read_loop(socket, read, events));

        self.authenticated.store(false, Ordering::Relaxed);
        let previous = self
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Link { socket, tx, buffered });
        if let Some(previous) = previous {
            debug!("Socket {} replaced by {}", previous.socket, socket);
        }
        socket
    }

    /// Read loop that forwards frames to the driver, ending with one `Closed`.
    async fn read_loop<S>(
        socket: u64,
        mut read: futures::stream::SplitStream<WebSocketStream<S>>,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut reason = String::new();
        loop {
            let inbound = match read.next().await {
                Some(Ok(Message::Text(text))) => Inbound::Text(text),
                Some(Ok(Message::Binary(data))) => Inbound::Binary(data),
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        reason = frame.reason.into_owned();
                    }
                    debug!("Socket {} received close frame ({})", socket, reason);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Socket {} closed", socket);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on socket {}: {}", socket, e);
                    break;
                }
                None => {
                    debug!("Socket {} stream ended", socket);
                    break;
                }
            };
            if events.send(SocketEvent { socket, inbound }).is_err() {
                return;
            }
        }
        let _ = events.send(SocketEvent {
            socket,
            inbound: Inbound::Closed { reason },
        });
    }

    /// Id of the attached socket, if any.
    pub fn socket(&self) -> Option<u64> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| link.socket)
    }

    /// Forget the current socket. Its writer ends once the queue is flushed.
    pub fn detach(&self) {
        self.authenticated.store(false, Ordering::Relaxed);
        self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Queue a close frame and detach.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        if let Some(link) = self.link.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if link.tx.send(Message::Close(Some(frame))).is_err() {
                warn!("Socket {} already gone, close frame dropped", link.socket);
            }
        }
        self.detach();
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Relaxed);
    }

    fn queue(&self, msg: Message) -> Result<()> {
        let guard = self.link.lock().unwrap_or_else(|e| e.into_inner());
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        if link.tx.is_closed() {
            return Err(TransportError::Closed);
        }
        let size = frame_len(&msg);
        link.buffered.fetch_add(size, Ordering::Relaxed);
        link.tx.send(msg).map_err(|e| {
            link.buffered.fetch_sub(size, Ordering::Relaxed);
            TransportError::Send(e.to_string())
        })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&self, frame: String) -> Result<()> {
        self.queue(Message::Text(frame))
    }

    async fn send_binary(&self, frame: Vec<u8>) -> Result<()> {
        self.queue(Message::Binary(frame))
    }

    fn buffered_amount(&self) -> usize {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| link.buffered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn is_open(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|link| !link.tx.is_closed())
            .unwrap_or(false)
    }

    fn is_authenticated(&self) -> bool {
        self.is_open() && self.authenticated.load(Ordering::Relaxed)
    }
}
