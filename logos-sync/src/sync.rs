//! Message-level sync protocol on top of the [`Transport`].
//!
//! Owns the Lamport clock, paginated history replay, operation broadcast
//! with acknowledgment tracking, and throttled presence emission. Remote
//! presence lives in the protocol's [`PresenceTracker`], which HELLO_ACK
//! peers and inbound PRESENCE frames feed.
//!
//! Join handshake:
//! ```text
//! client                         relay
//!   │ ── HELLO ─────────────────▶ │   (written first on every open)
//!   │ ◀──────────────── HELLO_ACK │   peers seed remote presence
//!   │ ── SYNC_REQUEST(since) ───▶ │   since = last synced cursor
//!   │ ◀── SYNC_RESPONSE(page) ─── │   repeat with nextCursor until complete
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::clock::{LamportClock, LogicalTimestamp, TimeSource};
use crate::config::{PresenceConfig, SyncConfig};
use crate::error::SyncError;
use crate::events::{EventBus, Subscription};
use crate::ids::IdGenerator;
use crate::operation::{Operation, OperationKind};
use crate::presence::{PresenceData, PresencePatch, PresenceTracker};
use crate::protocol::{Message, PeerInfo};
use crate::timer::ScheduledTask;
use crate::transport::{ConnectionState, Transport, TransportEvent};

/// Events emitted by the [`SyncProtocol`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    /// HELLO_ACK received. `clients` excludes ourselves.
    Connected {
        clients: Vec<PeerInfo>,
    },
    Disconnected {
        reason: Option<String>,
    },
    /// History replay finished.
    SyncComplete {
        cursor: Option<LogicalTimestamp>,
    },
    /// An operation authored elsewhere, live or replayed.
    RemoteOperation(Operation),
    OperationAck {
        operation_id: String,
        success: bool,
        error: Option<String>,
    },
    Presence {
        client_id: String,
        presence: PresencePatch,
    },
    /// An ERROR frame from the server.
    ServerError {
        code: String,
        message: String,
        details: Option<Value>,
    },
    /// Socket error or malformed frame.
    TransportError(String),
    /// Reconnection gave up; call `connect()` again to retry.
    ReconnectFailed,
}

type AckResult = Result<(), SyncError>;

/// Resolves when the server acknowledges an operation.
#[derive(Debug)]
pub struct AckWaiter {
    operation_id: String,
    rx: oneshot::Receiver<AckResult>,
}

impl AckWaiter {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Wait for OPERATION_ACK. A failed ack yields [`SyncError::Rejected`].
    pub async fn wait(self) -> AckResult {
        self.rx.await.unwrap_or(Err(SyncError::Disposed))
    }

    pub async fn wait_timeout(self, timeout: Duration) -> AckResult {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(result) => result.unwrap_or(Err(SyncError::Disposed)),
            Err(_) => Err(SyncError::AckTimeout(self.operation_id)),
        }
    }
}

struct SyncState {
    clock: LamportClock,
    syncing: bool,
    last_synced: Option<LogicalTimestamp>,
    last_pong: Option<u64>,
    pending_presence: Option<PresencePatch>,
    last_presence_flush: Option<Instant>,
    presence_flush: Option<ScheduledTask>,
    waiters: HashMap<String, oneshot::Sender<AckResult>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    driver: Option<ScheduledTask>,
    disposed: bool,
}

struct SyncInner {
    config: SyncConfig,
    client_id: String,
    user_id: String,
    ids: Arc<dyn IdGenerator>,
    time: Arc<dyn TimeSource>,
    transport: Transport,
    presence: PresenceTracker,
    events: EventBus<SyncEvent>,
    state: Mutex<SyncState>,
}

/// One client's view of the sync session for a single document.
pub struct SyncProtocol {
    inner: Arc<SyncInner>,
}

impl SyncProtocol {
    pub fn new(
        config: SyncConfig,
        user_id: impl Into<String>,
        transport: Transport,
        presence: PresenceConfig,
        ids: Arc<dyn IdGenerator>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let client_id = config.client_id.clone().unwrap_or_else(|| ids.next_id());
        let presence = PresenceTracker::new(
            client_id.clone(),
            config.user_name.clone(),
            presence,
            time.clone(),
        );
        transport.set_greeting(Some(Message::hello(
            client_id.clone(),
            config.document_id.clone(),
            config.user_name.clone(),
        )));
        let transport_events = transport.take_event_rx();

        Self {
            inner: Arc::new(SyncInner {
                state: Mutex::new(SyncState {
                    clock: LamportClock::new(client_id.clone()),
                    syncing: false,
                    last_synced: None,
                    last_pong: None,
                    pending_presence: None,
                    last_presence_flush: None,
                    presence_flush: None,
                    waiters: HashMap::new(),
                    transport_events,
                    driver: None,
                    disposed: false,
                }),
                config,
                client_id,
                user_id: user_id.into(),
                ids,
                time,
                transport,
                presence,
                events: EventBus::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Lossless event stream for the single consumer that applies remote
    /// operations. `None` once taken.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.inner.events.take_event_rx()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn document_id(&self) -> &str {
        &self.inner.config.document_id
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Local and remote presence, seeded by HELLO_ACK and merged from
    /// inbound PRESENCE frames.
    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Start processing transport events and open the socket.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.start();
        self.inner.transport.connect().await?;
        Ok(())
    }

    /// Spawn the driver task that feeds transport events into the protocol
    /// and start the presence expiry sweep. Idempotent; no-op outside a
    /// tokio runtime.
    pub fn start(&self) {
        self.inner.presence.start();
        let mut state = self.inner.state.lock();
        if state.disposed || state.driver.is_some() {
            return;
        }
        let Some(mut events) = state.transport_events.take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        state.driver = ScheduledTask::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_transport_event(event);
            }
        });
    }

    pub fn disconnect(&self) {
        self.inner.transport.disconnect();
        self.inner.state.lock().syncing = false;
    }

    /// Process one inbound protocol message.
    pub fn handle_message(&self, message: Message) {
        self.inner.handle_message(message);
    }

    // ── Clock & operations ───────────────────────────────────────

    pub fn clock(&self) -> LogicalTimestamp {
        self.inner.state.lock().clock.current()
    }

    /// Build an operation with a fresh id and the next timestamp, without
    /// sending it or advancing the clock.
    pub fn stamp_operation(&self, kind: OperationKind) -> Operation {
        let timestamp = self.inner.state.lock().clock.peek_next();
        Operation::new(
            self.inner.ids.next_id(),
            self.inner.user_id.clone(),
            self.inner.config.document_id.clone(),
            timestamp,
            kind,
        )
    }

    /// Advance the clock past `operation` and send it.
    pub fn broadcast_operation(&self, operation: Operation) -> Result<AckWaiter, SyncError> {
        let operation_id = operation.id().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(SyncError::Disposed);
            }
            state.clock.merge(operation.timestamp());
            state.clock.tick();
            state.waiters.retain(|_, waiter| !waiter.is_closed());
            state.waiters.insert(operation_id.clone(), tx);
        }

        if let Err(e) = self.inner.transport.send(Message::operation(operation)) {
            self.inner.state.lock().waiters.remove(&operation_id);
            return Err(e.into());
        }
        Ok(AckWaiter { operation_id, rx })
    }

    /// [`stamp_operation`](Self::stamp_operation) then
    /// [`broadcast_operation`](Self::broadcast_operation).
    pub fn create_operation(&self, kind: OperationKind) -> Result<(Operation, AckWaiter), SyncError> {
        let operation = self.stamp_operation(kind);
        let waiter = self.broadcast_operation(operation.clone())?;
        Ok((operation, waiter))
    }

    /// Operations sent but not yet acknowledged.
    pub fn pending_acks(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiters
            .values()
            .filter(|w| !w.is_closed())
            .count()
    }

    // ── Presence ─────────────────────────────────────────────────

    /// Queue a local presence change. Calls within one throttle window
    /// coalesce into a single PRESENCE frame.
    pub fn update_presence(&self, patch: PresencePatch) {
        let throttle = self.inner.config.presence_throttle;
        let flush_now = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            match state.pending_presence.as_mut() {
                Some(pending) => pending.merge(patch),
                None => state.pending_presence = Some(patch),
            }
            if state.presence_flush.is_some() {
                return;
            }
            let elapsed = state.last_presence_flush.map(|at| at.elapsed());
            match elapsed {
                Some(elapsed) if elapsed < throttle => {
                    let weak = Arc::downgrade(&self.inner);
                    state.presence_flush = ScheduledTask::once(throttle - elapsed, move || async move {
                        if let Some(inner) = Weak::upgrade(&weak) {
                            inner.flush_presence();
                        }
                    });
                    // Without a runtime there is nothing to wait on.
                    state.presence_flush.is_none()
                }
                _ => true,
            }
        };
        if flush_now {
            self.inner.flush_presence();
        }
    }

    /// Snapshot of every live remote presence, by client id.
    pub fn remote_presence(&self) -> Vec<PresenceData> {
        let mut all = self.inner.presence.remotes();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.state.lock().syncing
    }

    /// Cursor of the last completed history replay.
    pub fn last_synced(&self) -> Option<LogicalTimestamp> {
        self.inner.state.lock().last_synced.clone()
    }

    /// Wall-clock ms of the last PONG.
    pub fn last_pong(&self) -> Option<u64> {
        self.inner.state.lock().last_pong
    }

    /// Cancel timers, stop the driver, dispose the transport and reject
    /// every outstanding acknowledgment waiter.
    pub fn dispose(&self) {
        let waiters: Vec<oneshot::Sender<AckResult>> = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.syncing = false;
            state.presence_flush = None;
            state.pending_presence = None;
            state.driver = None;
            state.transport_events = None;
            state.waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        self.inner.presence.dispose();
        log::debug!("sync disposed, rejecting {} ack waiters", waiters.len());
        for waiter in waiters {
            let _ = waiter.send(Err(SyncError::Disposed));
        }
        self.inner.transport.dispose();
    }
}

impl Drop for SyncProtocol {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl SyncInner {
    fn send(&self, message: Message) {
        if let Err(e) = self.transport.send(message) {
            log::warn!("send failed: {e}");
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.handle_message(message),
            TransportEvent::StateChanged(state) => {
                self.events.emit(SyncEvent::StateChanged(state));
            }
            TransportEvent::Connected => {
                log::debug!("transport open, HELLO sent as {}", self.client_id);
            }
            TransportEvent::Disconnected { reason } => {
                self.state.lock().syncing = false;
                self.events.emit(SyncEvent::Disconnected { reason });
            }
            TransportEvent::Error(error) => {
                self.events.emit(SyncEvent::TransportError(error));
            }
            TransportEvent::ReconnectScheduled { .. } => {}
            TransportEvent::ReconnectFailed { .. } => {
                self.events.emit(SyncEvent::ReconnectFailed);
            }
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::HelloAck { clients } => self.on_hello_ack(clients),
            Message::SyncResponse {
                operations,
                complete,
                next_cursor,
            } => self.on_sync_response(operations, complete, next_cursor),
            Message::Operation { operation } => {
                if let Some(operation) = self.observe(operation) {
                    self.events.emit(SyncEvent::RemoteOperation(operation));
                }
            }
            Message::OperationAck {
                operation_id,
                success,
                error,
            } => self.on_ack(operation_id, success, error),
            Message::Presence {
                client_id,
                presence,
            } => self.on_presence(client_id, presence),
            Message::Ping { timestamp } => self.send(Message::pong(timestamp)),
            Message::Pong { .. } => {
                self.state.lock().last_pong = Some(self.time.now_ms());
            }
            Message::Error {
                code,
                message,
                details,
            } => {
                log::warn!("server error {code}: {message}");
                self.events.emit(SyncEvent::ServerError {
                    code,
                    message,
                    details,
                });
            }
            other @ (Message::Hello { .. } | Message::SyncRequest { .. }) => {
                log::debug!("ignoring server-bound {}", other.type_name());
            }
        }
    }

    fn on_hello_ack(&self, clients: Vec<PeerInfo>) {
        let peers: Vec<PeerInfo> = clients
            .into_iter()
            .filter(|peer| peer.client_id != self.client_id)
            .collect();
        for peer in &peers {
            let patch = PresencePatch {
                user_name: Some(peer.user_name.clone()),
                color: peer.color.clone(),
                ..PresencePatch::default()
            };
            self.presence.update_remote_presence(&peer.client_id, &patch);
        }

        let since = {
            let mut state = self.state.lock();
            state.syncing = true;
            state.last_synced.clone()
        };

        log::info!("joined {} with {} peers", self.config.document_id, peers.len());
        self.events.emit(SyncEvent::Connected { clients: peers });
        self.send(Message::sync_request(since));
    }

    fn on_sync_response(
        &self,
        operations: Vec<Operation>,
        complete: bool,
        next_cursor: Option<LogicalTimestamp>,
    ) {
        let last = operations.last().map(|op| op.timestamp().clone());
        let count = operations.len();
        for operation in operations {
            if let Some(operation) = self.observe(operation) {
                self.events.emit(SyncEvent::RemoteOperation(operation));
            }
        }

        if !complete {
            log::debug!("sync page of {count}, requesting more");
            self.send(Message::sync_request(next_cursor.or(last)));
            return;
        }

        let cursor = {
            let mut state = self.state.lock();
            if let Some(cursor) = next_cursor.or(last) {
                state.last_synced = Some(cursor);
            }
            state.syncing = false;
            state.last_synced.clone()
        };
        log::info!("sync complete at {}", cursor.as_ref().map(ToString::to_string).unwrap_or_default());
        self.events.emit(SyncEvent::SyncComplete { cursor });
    }

    /// Merge the clock; our own echoes are swallowed.
    fn observe(&self, operation: Operation) -> Option<Operation> {
        self.state.lock().clock.merge(operation.timestamp());
        if operation.timestamp().origin == self.client_id {
            log::debug!("skipping own operation {}", operation.id());
            return None;
        }
        Some(operation)
    }

    fn on_ack(&self, operation_id: String, success: bool, error: Option<String>) {
        let waiter = self.state.lock().waiters.remove(&operation_id);
        if let Some(waiter) = waiter {
            let result = if success {
                Ok(())
            } else {
                Err(SyncError::Rejected {
                    operation_id: operation_id.clone(),
                    reason: error.clone().unwrap_or_else(|| "rejected".into()),
                })
            };
            let _ = waiter.send(result);
        }
        if !success {
            log::warn!("operation {operation_id} rejected by server");
        }
        self.events.emit(SyncEvent::OperationAck {
            operation_id,
            success,
            error,
        });
    }

    fn on_presence(&self, client_id: String, presence: PresencePatch) {
        if client_id == self.client_id {
            return;
        }
        self.presence.update_remote_presence(&client_id, &presence);
        self.events.emit(SyncEvent::Presence {
            client_id,
            presence,
        });
    }

    fn flush_presence(&self) {
        let patch = {
            let mut state = self.state.lock();
            if let Some(own) = state.presence_flush.take() {
                own.detach();
            }
            let Some(patch) = state.pending_presence.take() else {
                return;
            };
            state.last_presence_flush = Some(Instant::now());
            patch
        };
        if !patch.is_empty() {
            self.send(Message::presence(self.client_id.clone(), patch));
        }
    }
}
