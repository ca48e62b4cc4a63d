//! WebSocket transport with offline queueing and automatic reconnection.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, dispose)
//! - An unbounded outbound queue replayed in order on the next open
//! - Exponential-backoff reconnection after unexpected closes
//! - Periodic PING keepalive
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──open──▶ Connected
//!        ▲                       ▲                    │ unexpected close
//!        │ attempts exhausted    │ backoff elapsed    ▼
//!        └─────────────────── Reconnecting ◀──────────┘
//! ```
//!
//! A caller-initiated `disconnect()` always lands in `Disconnected` and never
//! triggers reconnection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::clock::TimeSource;
use crate::config::TransportConfig;
use crate::error::{ProtocolError, TransportError};
use crate::events::{EventBus, Subscription};
use crate::protocol::Message;
use crate::timer::ScheduledTask;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        })
    }
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Socket open; queued messages have been handed to the writer.
    Connected,
    Disconnected {
        reason: Option<String>,
    },
    /// A decoded inbound frame.
    Message(Message),
    /// Socket error or undecodable frame. Does not by itself close the socket.
    Error(String),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Emitted once when `max_reconnect_attempts` is exhausted.
    ReconnectFailed {
        attempts: u32,
    },
}

/// Backoff before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt - 1), max)`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

struct Shared {
    state: ConnectionState,
    outgoing: Option<mpsc::UnboundedSender<WsMessage>>,
    queue: VecDeque<Message>,
    greeting: Option<Message>,
    attempts: u32,
    manual_close: bool,
    disposed: bool,
    /// Bumped on every open and caller-initiated close; stale socket tasks
    /// compare against it and stand down.
    generation: u64,
    reconnect: Option<ScheduledTask>,
    keepalive: Option<ScheduledTask>,
    reader: Option<ScheduledTask>,
    writer: Option<ScheduledTask>,
}

struct Inner {
    config: TransportConfig,
    time: Arc<dyn TimeSource>,
    events: EventBus<TransportEvent>,
    shared: Mutex<Shared>,
}

/// The socket adapter. Dropping it disposes the connection.
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(config: TransportConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                time,
                events: EventBus::new(),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    outgoing: None,
                    queue: VecDeque::new(),
                    greeting: None,
                    attempts: 0,
                    manual_close: false,
                    disposed: false,
                    generation: 0,
                    reconnect: None,
                    keepalive: None,
                    reader: None,
                    writer: None,
                }),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Lossless event stream for the single consumer that drives the
    /// protocol. `None` once taken.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events.take_event_rx()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive failed reconnect attempts since the last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().attempts
    }

    /// Message written first on every open, ahead of the queue.
    pub fn set_greeting(&self, greeting: Option<Message>) {
        self.inner.shared.lock().greeting = greeting;
    }

    pub fn queued_len(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Snapshot of the outbound queue.
    pub fn queued_messages(&self) -> Vec<Message> {
        self.inner.shared.lock().queue.iter().cloned().collect()
    }

    /// Open the socket. On failure or timeout the state returns to
    /// `Disconnected` and no reconnection is scheduled.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.disposed {
                return Err(TransportError::Disposed);
            }
            if shared.state == ConnectionState::Connected {
                return Ok(());
            }
            shared.manual_close = false;
            if let Some(pending) = shared.reconnect.take() {
                pending.cancel();
            }
        }

        match self.inner.open().await {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("connect to {} failed: {err}", self.inner.config.url);
                self.inner.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Send now if connected, otherwise enqueue for the next open.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        let mut shared = self.inner.shared.lock();
        if shared.disposed {
            return Err(TransportError::Disposed);
        }
        if shared.state == ConnectionState::Connected {
            if let Some(tx) = &shared.outgoing {
                let frame = encode_frame(&message)?;
                log::debug!("→ {}", message.type_name());
                if tx.send(frame).is_ok() {
                    return Ok(());
                }
            }
        }
        log::debug!("queued {} while {}", message.type_name(), shared.state);
        shared.queue.push_back(message);
        Ok(())
    }

    /// Close cleanly and stay closed. Cancels every timer.
    pub fn disconnect(&self) {
        let was = {
            let mut shared = self.inner.shared.lock();
            shared.manual_close = true;
            shared.generation += 1;
            shared.attempts = 0;
            shared.reconnect = None;
            shared.keepalive = None;
            shared.reader = None;
            if let Some(tx) = shared.outgoing.take() {
                let _ = tx.send(WsMessage::Close(None));
            }
            // The writer drains the Close frame and exits on its own.
            if let Some(writer) = shared.writer.take() {
                writer.detach();
            }
            shared.state
        };

        if was != ConnectionState::Disconnected {
            log::info!("disconnected from {}", self.inner.config.url);
            self.inner.set_state(ConnectionState::Disconnected);
            self.inner.events.emit(TransportEvent::Disconnected {
                reason: Some("client disconnect".into()),
            });
        }
    }

    /// Disconnect, drop the queue and abort the socket tasks. Terminal.
    pub fn dispose(&self) {
        self.disconnect();
        let mut shared = self.inner.shared.lock();
        shared.disposed = true;
        shared.queue.clear();
        shared.greeting = None;
        shared.writer = None;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn encode_frame(message: &Message) -> Result<WsMessage, ProtocolError> {
    Ok(WsMessage::Text(message.encode()?.into()))
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.shared.lock().state, state);
        if previous != state {
            log::debug!("transport {previous} → {state}");
            self.events.emit(TransportEvent::StateChanged(state));
        }
    }

    async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        let generation = {
            let shared = self.shared.lock();
            if shared.disposed {
                return Err(TransportError::Disposed);
            }
            shared.generation
        };
        self.set_state(ConnectionState::Connecting);

        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout;
        let socket = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => return Err(TransportError::ConnectTimeout { url, timeout }),
        };
        self.attach(socket, generation)
    }

    /// Wire a freshly opened socket: writer, reader, keepalive, queue flush.
    fn attach(self: &Arc<Self>, socket: Socket, generation: u64) -> Result<(), TransportError> {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let flushed = {
            let mut shared = self.shared.lock();
            if shared.disposed {
                return Err(TransportError::Disposed);
            }
            if shared.generation != generation {
                // Disconnected while the handshake was in flight.
                return Err(TransportError::Closed);
            }
            shared.generation += 1;
            let generation = shared.generation;
            shared.attempts = 0;

            shared.writer = ScheduledTask::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let closing = matches!(frame, WsMessage::Close(_));
                    if sink.send(frame).await.is_err() || closing {
                        break;
                    }
                }
            });

            let inner = self.clone();
            shared.reader = ScheduledTask::spawn(async move {
                let mut reason = None;
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => inner.dispatch(Message::decode(text.as_str())),
                        Ok(WsMessage::Binary(bytes)) => inner.dispatch(Message::decode_bytes(&bytes)),
                        Ok(WsMessage::Close(frame)) => {
                            reason = frame.map(|f| f.reason.as_str().to_string());
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // The stream ends after a fatal error; the close follows.
                            log::warn!("socket error: {e}");
                            inner.events.emit(TransportEvent::Error(e.to_string()));
                        }
                    }
                }
                inner.handle_closed(generation, reason);
            });

            let inner = self.clone();
            shared.keepalive = ScheduledTask::every(self.config.ping_interval, move || {
                let ping = Message::ping(inner.time.now_ms());
                if let Ok(frame) = encode_frame(&ping) {
                    if let Some(tx) = &inner.shared.lock().outgoing {
                        let _ = tx.send(frame);
                    }
                }
            });

            let greeting = shared.greeting.clone();
            let mut flushed = 0;
            for message in greeting.into_iter().chain(shared.queue.drain(..)) {
                match encode_frame(&message) {
                    Ok(frame) => {
                        let _ = tx.send(frame);
                        flushed += 1;
                    }
                    Err(e) => log::warn!("dropping unencodable {}: {e}", message.type_name()),
                }
            }
            shared.outgoing = Some(tx);
            flushed
        };

        log::info!("connected to {} ({flushed} frames flushed)", self.config.url);
        self.set_state(ConnectionState::Connected);
        self.events.emit(TransportEvent::Connected);
        Ok(())
    }

    fn dispatch(&self, decoded: Result<Message, ProtocolError>) {
        match decoded {
            Ok(message) => {
                log::debug!("← {}", message.type_name());
                self.events.emit(TransportEvent::Message(message));
            }
            Err(e) => {
                log::warn!("dropping malformed frame: {e}");
                self.events.emit(TransportEvent::Error(e.to_string()));
            }
        }
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let reconnect = {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                return;
            }
            shared.outgoing = None;
            shared.keepalive = None;
            shared.writer = None;
            // Running inside the reader task; don't abort ourselves.
            if let Some(own) = shared.reader.take() {
                own.detach();
            }
            !shared.manual_close && !shared.disposed
        };

        log::info!(
            "connection to {} closed{}",
            self.config.url,
            reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
        );
        self.events.emit(TransportEvent::Disconnected { reason });
        if reconnect {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let scheduled = {
            let mut shared = self.shared.lock();
            if shared.manual_close || shared.disposed {
                return;
            }
            if shared.attempts >= self.config.max_reconnect_attempts {
                Err(shared.attempts)
            } else {
                shared.attempts += 1;
                let attempt = shared.attempts;
                let delay = reconnect_delay(
                    attempt,
                    self.config.reconnect_base_delay,
                    self.config.reconnect_max_delay,
                );
                let inner = self.clone();
                shared.reconnect =
                    ScheduledTask::once(delay, move || async move { inner.reconnect_now().await });
                Ok((attempt, delay))
            }
        };

        match scheduled {
            Ok((attempt, delay)) => {
                log::info!("reconnect attempt {attempt} in {delay:?}");
                self.set_state(ConnectionState::Reconnecting);
                self.events.emit(TransportEvent::ReconnectScheduled { attempt, delay });
            }
            Err(attempts) => {
                log::error!("giving up on {} after {attempts} reconnect attempts", self.config.url);
                self.set_state(ConnectionState::Disconnected);
                self.events.emit(TransportEvent::ReconnectFailed { attempts });
            }
        }
    }

    async fn reconnect_now(self: Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            if let Some(own) = shared.reconnect.take() {
                own.detach();
            }
            if shared.manual_close || shared.disposed {
                return;
            }
        }
        if let Err(e) = self.open().await {
            log::warn!("reconnect to {} failed: {e}", self.config.url);
            self.events.emit(TransportEvent::Error(e.to_string()));
            self.schedule_reconnect();
        }
    }
}
