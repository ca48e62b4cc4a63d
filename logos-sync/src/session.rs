//! One client's collaboration session on one document.
//!
//! Wires the [`SyncProtocol`], [`ConflictResolver`], [`PermissionBridge`] and
//! [`PresenceTracker`] together:
//!
//! ```text
//!  submit(kind) ─▶ stamp ─▶ bridge gate ─▶ replica ─▶ pending ─▶ OPERATION
//!
//!  OPERATION ─▶ author role ─▶ detect vs pending ─▶ resolve ─┬─ local kept ─▶ skip
//!                                                            └─ otherwise ──▶ bridge (locks) ─▶ replica
//!
//!  OPERATION_ACK ─▶ drop from pending (failure ─▶ Rejected)
//!  HELLO_ACK ─────▶ peer roles
//! ```
//!
//! Sync events reach the session over the protocol's lossless feed, so every
//! replayed or live operation is reconciled in arrival order. Authors' roles
//! come from [`set_participant_role`](CollabSession::set_participant_role),
//! HELLO_ACK peer entries, or a [`RoleSource`] queried on first sight.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bridge::{ApplyOutcome, PermissionBridge};
use crate::clock::{LogicalTimestamp, SystemTimeSource, TimeSource};
use crate::config::SessionConfig;
use crate::conflict::{Conflict, ConflictResolver};
use crate::error::SyncError;
use crate::events::{EventBus, Subscription};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::operation::{Operation, OperationKind};
use crate::permissions::{Role, RoleSource};
use crate::presence::{PresencePatch, PresenceTracker};
use crate::protocol::PeerInfo;
use crate::replica::DocumentReplica;
use crate::sync::{AckWaiter, SyncEvent, SyncProtocol};
use crate::timer::ScheduledTask;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Applied to the local replica, local or remote.
    Applied(Operation),
    Rejected {
        operation: Operation,
        reason: String,
    },
    ConflictResolved(Conflict),
    Synced {
        cursor: Option<LogicalTimestamp>,
    },
}

struct SessionInner<R> {
    config: SessionConfig,
    sync: SyncProtocol,
    resolver: Mutex<ConflictResolver>,
    bridge: PermissionBridge<R>,
    role_source: Mutex<Option<Arc<dyn RoleSource>>>,
    /// Local operations sent but not yet acknowledged, in send order.
    pending: Mutex<Vec<Operation>>,
    events: EventBus<SessionEvent>,
    sync_events: Mutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    driver: Mutex<Option<ScheduledTask>>,
}

pub struct CollabSession<R> {
    inner: Arc<SessionInner<R>>,
}

impl<R: DocumentReplica + 'static> CollabSession<R> {
    pub fn new(config: SessionConfig, replica: R) -> Self {
        Self::with_sources(
            config,
            replica,
            Arc::new(UuidIdGenerator),
            Arc::new(SystemTimeSource),
        )
    }

    /// Use injected id and wall-clock sources.
    pub fn with_sources(
        config: SessionConfig,
        replica: R,
        ids: Arc<dyn IdGenerator>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let transport = Transport::new(config.transport.clone(), time.clone());
        let sync = SyncProtocol::new(
            config.sync.clone(),
            config.user_id.clone(),
            transport,
            config.presence.clone(),
            ids,
            time.clone(),
        );

        let mut resolver = ConflictResolver::new(&config.conflict);
        resolver.set_participant_role(config.user_id.clone(), config.role);

        let bridge = PermissionBridge::new(
            replica,
            config.user_id.clone(),
            config.role,
            config.locks.clone(),
            time,
        )
        .with_user_name(config.sync.user_name.clone());
        let sync_events = sync.take_event_rx();

        Self {
            inner: Arc::new(SessionInner {
                config,
                sync,
                resolver: Mutex::new(resolver),
                bridge,
                role_source: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                events: EventBus::new(),
                sync_events: Mutex::new(sync_events),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn sync(&self) -> &SyncProtocol {
        &self.inner.sync
    }

    pub fn bridge(&self) -> &PermissionBridge<R> {
        &self.inner.bridge
    }

    pub fn presence(&self) -> &PresenceTracker {
        self.inner.sync.presence()
    }

    pub fn with_resolver<T>(&self, f: impl FnOnce(&mut ConflictResolver) -> T) -> T {
        f(&mut self.inner.resolver.lock())
    }

    /// Record a collaborator's role for conflict precedence. For the local
    /// user this also changes what the bridge lets through.
    pub fn set_participant_role(&self, user_id: &str, role: Role) {
        self.inner.resolver.lock().set_participant_role(user_id, role);
        if user_id == self.inner.config.user_id {
            self.inner.bridge.update_role(role);
        }
    }

    /// Consulted for authors without a recorded role.
    pub fn set_role_source(&self, source: impl RoleSource + 'static) {
        *self.inner.role_source.lock() = Some(Arc::new(source));
    }

    /// Start the driver and presence sweep, then open the connection.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.start();
        self.inner.sync.connect().await
    }

    /// Spawn the task that feeds sync events into the session. Idempotent.
    pub fn start(&self) {
        self.inner.sync.start();

        let mut driver = self.inner.driver.lock();
        if driver.is_some() {
            return;
        }
        let Some(mut events) = self.inner.sync_events.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        *driver = ScheduledTask::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_sync_event(event);
            }
        });
    }

    /// Originate a local operation.
    ///
    /// The operation is applied to the replica before it is sent. A gate
    /// refusal yields [`SyncError::LocalRejection`] and nothing is sent.
    pub fn submit(&self, kind: OperationKind) -> Result<AckWaiter, SyncError> {
        let inner = &self.inner;
        let operation = inner.sync.stamp_operation(kind);

        if let ApplyOutcome::Rejected(reason) = inner.bridge.apply_local_operation(&operation)? {
            inner.events.emit(SessionEvent::Rejected {
                operation,
                reason: reason.clone(),
            });
            return Err(SyncError::LocalRejection(reason));
        }

        inner.resolver.lock().record_operation(&operation);
        inner.pending.lock().push(operation.clone());
        inner.events.emit(SessionEvent::Applied(operation.clone()));

        let operation_id = operation.id().to_string();
        inner.sync.broadcast_operation(operation).inspect_err(|_| {
            inner.pending.lock().retain(|op| op.id() != operation_id);
        })
    }

    /// Reconcile and apply an operation from a peer.
    pub fn handle_remote_operation(&self, operation: Operation) {
        self.inner.on_remote_operation(operation);
    }

    /// Update local presence and forward the change.
    pub fn update_presence(&self, patch: PresencePatch) {
        let delta = self.inner.sync.presence().update_local_presence(patch);
        self.inner.sync.update_presence(delta);
    }

    /// Local operations awaiting acknowledgment.
    pub fn pending(&self) -> Vec<Operation> {
        self.inner.pending.lock().clone()
    }

    pub fn disconnect(&self) {
        self.inner.sync.disconnect();
    }

    /// Tear down every component.
    pub fn dispose(&self) {
        self.inner.driver.lock().take();
        self.inner.sync_events.lock().take();
        self.inner.sync.dispose();
        self.inner.bridge.dispose();
    }
}

impl<R> Drop for CollabSession<R> {
    fn drop(&mut self) {
        self.inner.driver.lock().take();
    }
}

impl<R: DocumentReplica> SessionInner<R> {
    fn on_sync_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::RemoteOperation(operation) => self.on_remote_operation(operation),
            SyncEvent::OperationAck {
                operation_id,
                success,
                error,
            } => self.on_ack(&operation_id, success, error),
            SyncEvent::Connected { clients } => self.learn_peer_roles(&clients),
            SyncEvent::SyncComplete { cursor } => {
                self.events.emit(SessionEvent::Synced { cursor });
            }
            _ => {}
        }
    }

    fn learn_peer_roles(&self, peers: &[PeerInfo]) {
        let mut resolver = self.resolver.lock();
        for peer in peers {
            if let (Some(user_id), Some(role)) = (&peer.user_id, peer.role) {
                log::debug!("peer {} acts as {user_id} ({role})", peer.client_id);
                resolver.set_participant_role(user_id.clone(), role);
            }
        }
    }

    /// Ask the role source about an author seen for the first time.
    fn learn_author_role(&self, user_id: &str) {
        if self.resolver.lock().has_participant(user_id) {
            return;
        }
        let Some(source) = self.role_source.lock().clone() else {
            return;
        };
        if let Some(role) = source.role_of(user_id) {
            self.resolver.lock().set_participant_role(user_id, role);
        }
    }

    fn on_remote_operation(&self, operation: Operation) {
        self.learn_author_role(operation.user_id());
        let pending = self.pending.lock().clone();
        let conflicts: Vec<Conflict> = {
            let resolver = self.resolver.lock();
            resolver
                .detect_conflicts(&operation, &pending)
                .into_iter()
                .map(|conflict| resolver.resolve_conflict(conflict))
                .collect()
        };

        let local_kept = conflicts.iter().any(Conflict::local_won);
        for conflict in conflicts {
            log::debug!(
                "{:?} between local {} and remote {} resolved",
                conflict.kind,
                conflict.local.id(),
                conflict.remote.id()
            );
            self.events.emit(SessionEvent::ConflictResolved(conflict));
        }
        if local_kept {
            log::info!("skipping remote {}: pending local operation wins", operation.id());
            return;
        }

        match self.bridge.apply_remote_operation(&operation) {
            Ok(ApplyOutcome::Applied) => {
                self.resolver.lock().record_operation(&operation);
                self.events.emit(SessionEvent::Applied(operation));
            }
            Ok(ApplyOutcome::Rejected(reason)) => {
                self.events.emit(SessionEvent::Rejected { operation, reason });
            }
            Err(e) => {
                log::warn!("replica refused remote {}: {e}", operation.id());
                self.events.emit(SessionEvent::Rejected {
                    operation,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_ack(&self, operation_id: &str, success: bool, error: Option<String>) {
        let acked = {
            let mut pending = self.pending.lock();
            let index = pending.iter().position(|op| op.id() == operation_id);
            index.map(|i| pending.remove(i))
        };
        if let (Some(operation), false) = (acked, success) {
            self.events.emit(SessionEvent::Rejected {
                operation,
                reason: error.unwrap_or_else(|| "rejected by server".into()),
            });
        }
    }
}
