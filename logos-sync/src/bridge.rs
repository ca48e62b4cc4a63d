//! Permission-aware replica bridge.
//!
//! Every operation passes two independent gates before it may touch the
//! local replica or be forwarded:
//!
//! 1. **Permission**: the active role must grant `edit` (fails closed).
//! 2. **Element lock**: the target node must not carry an unexpired lock
//!    held by another user.
//!
//! Element locks are advisory, time-bounded claims that collaborators use to
//! avoid stepping on each other. The lock table is only mutated through this
//! type, and holds at most one lock per node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::TimeSource;
use crate::config::LockConfig;
use crate::error::ReplicaError;
use crate::events::{EventBus, Subscription};
use crate::operation::{NodeId, Operation};
use crate::permissions::{Permission, Role};
use crate::replica::DocumentReplica;
use crate::timer::ScheduledTask;

/// An advisory exclusive claim on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementLock {
    pub node_id: NodeId,
    pub holder_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_name: Option<String>,
    /// Wall-clock ms.
    pub acquired_at: u64,
    /// Wall-clock ms; `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl ElementLock {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }

    fn holder_label(&self) -> &str {
        self.holder_name.as_deref().unwrap_or(&self.holder_id)
    }
}

/// Why a lock went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Released,
    Forced,
    Expired,
    /// Mirrored from a peer.
    Remote,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReleaseReason::Released => "released",
            ReleaseReason::Forced => "forced",
            ReleaseReason::Expired => "expired",
            ReleaseReason::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    OperationApplied(Operation),
    OperationRejected {
        operation: Operation,
        reason: String,
    },
    PermissionDenied {
        role: Role,
        permission: Permission,
        reason: String,
    },
    LockAcquired(ElementLock),
    LockDenied {
        node_id: NodeId,
        reason: String,
        holder_id: Option<String>,
    },
    LockReleased {
        node_id: NodeId,
        holder_id: String,
        reason: ReleaseReason,
    },
    RoleChanged {
        from: Role,
        to: Role,
    },
}

/// Result of pushing an operation through the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Refused by a gate; the replica was not touched.
    Rejected(String),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Invoked with the rejected operation and the reason.
pub type RejectionCallback = Box<dyn Fn(&Operation, &str) + Send + Sync>;

#[derive(Default)]
struct LockTable {
    locks: HashMap<NodeId, ElementLock>,
    expiry_timers: HashMap<NodeId, ScheduledTask>,
}

impl LockTable {
    fn remove(&mut self, node_id: &str) -> Option<ElementLock> {
        if let Some(timer) = self.expiry_timers.remove(node_id) {
            timer.cancel();
        }
        self.locks.remove(node_id)
    }

    /// Unexpired lock on `node_id` held by someone other than `user_id`.
    fn foreign(&self, node_id: &str, user_id: &str, now_ms: u64) -> Option<&ElementLock> {
        self.locks
            .get(node_id)
            .filter(|lock| lock.holder_id != user_id && !lock.is_expired(now_ms))
    }
}

/// Guards a [`DocumentReplica`] with role permissions and element locks.
pub struct PermissionBridge<R> {
    user_id: String,
    user_name: Option<String>,
    role: Mutex<Role>,
    locks: Arc<Mutex<LockTable>>,
    replica: Mutex<R>,
    events: EventBus<BridgeEvent>,
    time: Arc<dyn TimeSource>,
    config: LockConfig,
    on_reject: Option<RejectionCallback>,
}

impl<R: DocumentReplica> PermissionBridge<R> {
    pub fn new(
        replica: R,
        user_id: impl Into<String>,
        role: Role,
        config: LockConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: None,
            role: Mutex::new(role),
            locks: Arc::new(Mutex::new(LockTable::default())),
            replica: Mutex::new(replica),
            events: EventBus::new(),
            time,
            config,
            on_reject: None,
        }
    }

    /// Display name recorded on locks this user acquires.
    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn on_reject(mut self, callback: impl Fn(&Operation, &str) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Box::new(callback));
        self
    }

    pub fn subscribe(&self) -> Subscription<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Takes effect for every subsequent check. Earlier operations are not
    /// re-validated.
    pub fn update_role(&self, role: Role) {
        let from = std::mem::replace(&mut *self.role.lock(), role);
        if from != role {
            log::info!("role changed from {from} to {role}");
            self.events.emit(BridgeEvent::RoleChanged { from, to: role });
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role().has(permission)
    }

    /// Read access to the wrapped replica.
    pub fn with_replica<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(&self.replica.lock())
    }

    // ── Gates ────────────────────────────────────────────────────

    /// Every operation kind mutates the document and needs `edit`.
    pub fn can_perform_operation(&self, _op: &Operation) -> bool {
        self.has_permission(Permission::Edit)
    }

    pub fn can_edit_element(&self, node_id: &str) -> bool {
        self.has_permission(Permission::Edit)
            && self
                .locks
                .lock()
                .foreign(node_id, &self.user_id, self.time.now_ms())
                .is_none()
    }

    /// Run both gates for a locally-originated operation. On failure the
    /// rejection is reported and `false` returned.
    pub fn validate_and_reject(&self, op: &Operation) -> bool {
        self.gate(op).is_none()
    }

    /// The reported rejection reason, if any gate fails.
    fn gate(&self, op: &Operation) -> Option<String> {
        if !self.can_perform_operation(op) {
            let role = self.role();
            let reason = format!(
                "role '{role}' lacks {} permission for {} on {}",
                Permission::Edit,
                op.kind().name(),
                op.target_node().map(String::as_str).unwrap_or("document")
            );
            self.events.emit(BridgeEvent::PermissionDenied {
                role,
                permission: Permission::Edit,
                reason: reason.clone(),
            });
            self.reject(op, reason.clone());
            return Some(reason);
        }

        let reason = self.lock_violation(op, &self.user_id)?;
        self.reject(op, reason.clone());
        Some(reason)
    }

    fn lock_violation(&self, op: &Operation, actor: &str) -> Option<String> {
        let node_id = op.target_node()?;
        let locks = self.locks.lock();
        locks
            .foreign(node_id, actor, self.time.now_ms())
            .map(|lock| format!("element {node_id} is locked by {}", lock.holder_label()))
    }

    fn reject(&self, op: &Operation, reason: String) {
        log::warn!("operation {} rejected: {reason}", op.id());
        if let Some(callback) = &self.on_reject {
            callback(op, &reason);
        }
        self.events.emit(BridgeEvent::OperationRejected {
            operation: op.clone(),
            reason,
        });
    }

    // ── Application ──────────────────────────────────────────────

    /// Validate a local operation and apply it.
    pub fn apply_local_operation(&self, op: &Operation) -> Result<ApplyOutcome, ReplicaError> {
        if let Some(reason) = self.gate(op) {
            return Ok(ApplyOutcome::Rejected(reason));
        }
        self.apply(op)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Apply an operation authored by a peer.
    ///
    /// The author's role was checked by its own client and by the server, so
    /// only the lock gate runs here, against the author rather than us.
    pub fn apply_remote_operation(&self, op: &Operation) -> Result<ApplyOutcome, ReplicaError> {
        if let Some(reason) = self.lock_violation(op, op.user_id()) {
            self.reject(op, reason.clone());
            return Ok(ApplyOutcome::Rejected(reason));
        }
        self.apply(op)?;
        Ok(ApplyOutcome::Applied)
    }

    fn apply(&self, op: &Operation) -> Result<(), ReplicaError> {
        self.replica.lock().apply_operation(op)?;
        self.events.emit(BridgeEvent::OperationApplied(op.clone()));
        Ok(())
    }

    // ── Locks ────────────────────────────────────────────────────

    /// Claim `node_id` for `timeout` (default from [`LockConfig`]).
    pub fn request_lock(&self, node_id: &str, timeout: Option<Duration>) -> bool {
        if !self.has_permission(Permission::Edit) {
            self.deny_lock(
                node_id,
                format!("role '{}' cannot lock elements", self.role()),
                None,
            );
            return false;
        }

        let now = self.time.now_ms();
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let mut expired = None;
        let lock = {
            let mut table = self.locks.lock();
            if let Some(existing) = table.locks.get(node_id) {
                if existing.holder_id != self.user_id {
                    if !existing.is_expired(now) {
                        let reason = format!("element {node_id} is locked by {}", existing.holder_label());
                        let holder = existing.holder_id.clone();
                        drop(table);
                        self.deny_lock(node_id, reason, Some(holder));
                        return false;
                    }
                    expired = table.remove(node_id);
                }
            }

            let lock = ElementLock {
                node_id: node_id.to_string(),
                holder_id: self.user_id.clone(),
                holder_name: self.user_name.clone(),
                acquired_at: now,
                expires_at: Some(now.saturating_add(timeout.as_millis() as u64)),
            };
            table.locks.insert(node_id.to_string(), lock.clone());
            self.schedule_expiry(&mut table, &lock, timeout);
            lock
        };

        if let Some(old) = expired {
            self.events.emit(BridgeEvent::LockReleased {
                node_id: old.node_id,
                holder_id: old.holder_id,
                reason: ReleaseReason::Expired,
            });
        }
        log::debug!("lock acquired on {node_id} by {}", self.user_id);
        self.events.emit(BridgeEvent::LockAcquired(lock));
        true
    }

    fn deny_lock(&self, node_id: &str, reason: String, holder_id: Option<String>) {
        log::debug!("lock denied on {node_id}: {reason}");
        self.events.emit(BridgeEvent::LockDenied {
            node_id: node_id.to_string(),
            reason,
            holder_id,
        });
    }

    fn schedule_expiry(&self, table: &mut LockTable, lock: &ElementLock, after: Duration) {
        let locks = self.locks.clone();
        let events = self.events.clone();
        let node_id = lock.node_id.clone();
        let acquired_at = lock.acquired_at;
        let holder_id = lock.holder_id.clone();
        let timer = ScheduledTask::once(after, move || async move {
            let expired = {
                let mut table = locks.lock();
                let current = table
                    .locks
                    .get(&node_id)
                    .is_some_and(|l| l.holder_id == holder_id && l.acquired_at == acquired_at);
                if !current {
                    return;
                }
                if let Some(own) = table.expiry_timers.remove(&node_id) {
                    own.detach();
                }
                table.locks.remove(&node_id)
            };
            if let Some(lock) = expired {
                log::debug!("lock on {} expired", lock.node_id);
                events.emit(BridgeEvent::LockReleased {
                    node_id: lock.node_id,
                    holder_id: lock.holder_id,
                    reason: ReleaseReason::Expired,
                });
            }
        });
        match timer {
            Some(timer) => {
                table.expiry_timers.insert(lock.node_id.clone(), timer);
            }
            None => {
                // Without a runtime the lock still lapses lazily via `is_expired`.
                table.expiry_timers.remove(&lock.node_id);
            }
        }
    }

    /// Release a lock we hold, or any lock if we are an owner.
    pub fn release_lock(&self, node_id: &str) -> bool {
        let is_owner = self.role() == Role::Owner;
        let released = {
            let mut table = self.locks.lock();
            match table.locks.get(node_id) {
                Some(lock) if lock.holder_id == self.user_id || is_owner => table.remove(node_id),
                _ => None,
            }
        };
        self.finish_release(released, ReleaseReason::Released)
    }

    /// Owners may break any lock.
    pub fn force_release_lock(&self, node_id: &str) -> bool {
        if self.role() != Role::Owner {
            log::debug!("force release of {node_id} denied for role {}", self.role());
            return false;
        }
        let released = self.locks.lock().remove(node_id);
        self.finish_release(released, ReleaseReason::Forced)
    }

    fn finish_release(&self, released: Option<ElementLock>, reason: ReleaseReason) -> bool {
        let Some(lock) = released else {
            return false;
        };
        log::debug!("lock on {} {reason}", lock.node_id);
        self.events.emit(BridgeEvent::LockReleased {
            node_id: lock.node_id,
            holder_id: lock.holder_id,
            reason,
        });
        true
    }

    /// Mirror a lock a peer acquired. The peer already ran its own gate.
    pub fn apply_remote_lock(&self, lock: ElementLock) {
        {
            let mut table = self.locks.lock();
            table.remove(&lock.node_id);
            table.locks.insert(lock.node_id.clone(), lock.clone());
            if let Some(expires_at) = lock.expires_at {
                let after = Duration::from_millis(expires_at.saturating_sub(self.time.now_ms()));
                self.schedule_expiry(&mut table, &lock, after);
            }
        }
        self.events.emit(BridgeEvent::LockAcquired(lock));
    }

    /// Mirror a peer's release.
    pub fn apply_remote_lock_release(&self, node_id: &str) -> bool {
        let released = self.locks.lock().remove(node_id);
        self.finish_release(released, ReleaseReason::Remote)
    }

    /// Drop every lock held by `user_id`, e.g. after they leave.
    pub fn release_locks_held_by(&self, user_id: &str) -> Vec<NodeId> {
        let released: Vec<ElementLock> = {
            let mut table = self.locks.lock();
            let nodes: Vec<NodeId> = table
                .locks
                .values()
                .filter(|l| l.holder_id == user_id)
                .map(|l| l.node_id.clone())
                .collect();
            nodes.iter().filter_map(|n| table.remove(n)).collect()
        };
        released
            .into_iter()
            .map(|lock| {
                let node_id = lock.node_id.clone();
                self.finish_release(Some(lock), ReleaseReason::Remote);
                node_id
            })
            .collect()
    }

    /// The unexpired lock on `node_id`, if any.
    pub fn lock(&self, node_id: &str) -> Option<ElementLock> {
        let now = self.time.now_ms();
        self.locks
            .lock()
            .locks
            .get(node_id)
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    pub fn is_locked(&self, node_id: &str) -> bool {
        self.lock(node_id).is_some()
    }

    /// Every unexpired lock, ordered by node id.
    pub fn locks(&self) -> Vec<ElementLock> {
        let now = self.time.now_ms();
        let mut locks: Vec<ElementLock> = self
            .locks
            .lock()
            .locks
            .values()
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        locks
    }

    /// Cancel every auto-release timer. Lock state is left as is.
    pub fn dispose(&self) {
        let mut table = self.locks.lock();
        for (_, timer) in table.expiry_timers.drain() {
            timer.cancel();
        }
    }
}

impl<R> Drop for PermissionBridge<R> {
    fn drop(&mut self) {
        self.locks.lock().expiry_timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LogicalTimestamp, ManualTimeSource};
    use crate::operation::{OperationKind, PropertyPath};
    use crate::replica::MemoryReplica;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn replica() -> MemoryReplica {
        let mut replica = MemoryReplica::new();
        replica.insert("root", "n1", json!({ "fill": "#000" }));
        replica.insert("root", "n2", json!({}));
        replica
    }

    fn bridge(user: &str, role: Role, time: &ManualTimeSource) -> PermissionBridge<MemoryReplica> {
        PermissionBridge::new(replica(), user, role, LockConfig::default(), Arc::new(time.clone()))
    }

    fn fill(user: &str, node: &str) -> Operation {
        Operation::new(
            format!("{user}-{node}"),
            user,
            "doc",
            LogicalTimestamp::new(1, user),
            OperationKind::update(node, PropertyPath::new(["fill"]), json!("#000"), json!("#fff")),
        )
    }

    #[test]
    fn test_viewer_is_denied_and_reported() {
        let time = ManualTimeSource::new(0);
        let rejected = Arc::new(AtomicUsize::new(0));
        let counter = rejected.clone();
        let bridge = bridge("v", Role::Viewer, &time).on_reject(move |_, reason| {
            assert!(reason.contains("viewer"));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut events = bridge.subscribe();

        assert!(!bridge.apply_local_operation(&fill("v", "n1")).unwrap().is_applied());
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        bridge.with_replica(|r| assert_eq!(r.node("n1"), Some(&json!({ "fill": "#000" }))));

        let evs = events.drain();
        assert!(matches!(evs[0], BridgeEvent::PermissionDenied { role: Role::Viewer, .. }));
        assert!(matches!(evs[1], BridgeEvent::OperationRejected { .. }));
    }

    #[test]
    fn test_editor_applies() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("e", Role::Editor, &time);
        let mut events = bridge.subscribe();
        assert!(bridge.apply_local_operation(&fill("e", "n1")).unwrap().is_applied());
        bridge.with_replica(|r| assert_eq!(r.node("n1"), Some(&json!({ "fill": "#fff" }))));
        assert!(matches!(events.try_recv(), Some(BridgeEvent::OperationApplied(_))));
    }

    #[test]
    fn test_replica_errors_propagate() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("e", Role::Editor, &time);
        let err = bridge.apply_local_operation(&fill("e", "ghost"));
        assert_eq!(err, Err(ReplicaError::NodeNotFound("ghost".into())));
    }

    #[test]
    fn test_role_change_applies_immediately() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("u", Role::Commenter, &time);
        assert!(!bridge.can_perform_operation(&fill("u", "n1")));
        bridge.update_role(Role::Editor);
        assert!(bridge.can_perform_operation(&fill("u", "n1")));
        assert!(bridge.can_edit_element("n1"));
    }

    #[tokio::test]
    async fn test_second_lock_denied_until_expiry() {
        let time = ManualTimeSource::new(10_000);
        let alice = bridge("alice", Role::Editor, &time).with_user_name("Alice");
        let bob = bridge("bob", Role::Editor, &time);
        let mut bob_events = bob.subscribe();

        assert!(alice.request_lock("n1", Some(Duration::from_secs(60))));
        let lock = alice.lock("n1").unwrap();
        bob.apply_remote_lock(lock);
        bob_events.drain();

        assert!(!bob.request_lock("n1", None));
        match bob_events.try_recv() {
            Some(BridgeEvent::LockDenied { reason, holder_id, .. }) => {
                assert!(reason.contains("Alice"));
                assert_eq!(holder_id.as_deref(), Some("alice"));
            }
            other => panic!("expected LockDenied, got {other:?}"),
        }
        assert!(!bob.can_edit_element("n1"));

        time.advance(Duration::from_secs(61));
        assert!(bob.request_lock("n1", None));
        assert_eq!(bob.lock("n1").unwrap().holder_id, "bob");
        let evs = bob_events.drain();
        assert!(matches!(
            evs[0],
            BridgeEvent::LockReleased { reason: ReleaseReason::Expired, .. }
        ));
        assert!(matches!(evs[1], BridgeEvent::LockAcquired(_)));
    }

    #[test]
    fn test_lock_blocks_other_users_operations() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("me", Role::Editor, &time);
        bridge.apply_remote_lock(ElementLock {
            node_id: "n1".into(),
            holder_id: "other".into(),
            holder_name: None,
            acquired_at: 0,
            expires_at: None,
        });

        assert!(!bridge.apply_local_operation(&fill("me", "n1")).unwrap().is_applied());
        assert!(bridge.apply_local_operation(&fill("me", "n2")).unwrap().is_applied());
        // The holder's own edits still go through.
        assert!(bridge.apply_remote_operation(&fill("other", "n1")).unwrap().is_applied());
        assert!(!bridge.apply_remote_operation(&fill("third", "n1")).unwrap().is_applied());
    }

    #[test]
    fn test_viewer_cannot_lock() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("v", Role::Viewer, &time);
        let mut events = bridge.subscribe();
        assert!(!bridge.request_lock("n1", None));
        assert!(matches!(events.try_recv(), Some(BridgeEvent::LockDenied { holder_id: None, .. })));
    }

    #[test]
    fn test_release_rules() {
        let time = ManualTimeSource::new(0);
        let editor = bridge("e", Role::Editor, &time);
        let owner = bridge("o", Role::Owner, &time);
        let foreign = ElementLock {
            node_id: "n1".into(),
            holder_id: "x".into(),
            holder_name: None,
            acquired_at: 0,
            expires_at: None,
        };

        editor.apply_remote_lock(foreign.clone());
        assert!(!editor.release_lock("n1"));
        assert!(!editor.force_release_lock("n1"));
        assert!(editor.is_locked("n1"));

        owner.apply_remote_lock(foreign.clone());
        assert!(owner.release_lock("n1"));
        owner.apply_remote_lock(foreign);
        let mut events = owner.subscribe();
        assert!(owner.force_release_lock("n1"));
        assert!(matches!(
            events.try_recv(),
            Some(BridgeEvent::LockReleased { reason: ReleaseReason::Forced, .. })
        ));
        assert!(!owner.force_release_lock("n1"));
    }

    #[test]
    fn test_holder_can_renew_and_release() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("e", Role::Editor, &time);
        assert!(bridge.request_lock("n1", Some(Duration::from_secs(1))));
        time.advance(Duration::from_millis(500));
        assert!(bridge.request_lock("n1", Some(Duration::from_secs(1))));
        assert_eq!(bridge.lock("n1").unwrap().expires_at, Some(1_500));
        assert!(bridge.release_lock("n1"));
        assert!(!bridge.release_lock("n1"));
        assert!(bridge.locks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_release_timer() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("e", Role::Editor, &time);
        let mut events = bridge.subscribe();
        assert!(bridge.request_lock("n1", Some(Duration::from_secs(5))));
        events.drain();

        tokio::time::sleep(Duration::from_millis(5_010)).await;
        assert!(bridge.locks.lock().locks.is_empty());
        assert!(matches!(
            events.try_recv(),
            Some(BridgeEvent::LockReleased { reason: ReleaseReason::Expired, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancels_timer() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("e", Role::Editor, &time);
        assert!(bridge.request_lock("n1", Some(Duration::from_secs(5))));
        assert!(bridge.release_lock("n1"));
        assert!(bridge.request_lock("n1", Some(Duration::from_secs(60))));
        let mut events = bridge.subscribe();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(bridge.is_locked("n1"));
        assert!(events.try_recv().is_none());
        bridge.dispose();
    }

    #[test]
    fn test_release_locks_held_by_departed_user() {
        let time = ManualTimeSource::new(0);
        let bridge = bridge("me", Role::Editor, &time);
        for node in ["a", "b", "c"] {
            bridge.apply_remote_lock(ElementLock {
                node_id: node.into(),
                holder_id: if node == "b" { "stay".into() } else { "gone".into() },
                holder_name: None,
                acquired_at: 0,
                expires_at: None,
            });
        }
        let mut released = bridge.release_locks_held_by("gone");
        released.sort();
        assert_eq!(released, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(bridge.locks().len(), 1);
    }

    #[test]
    fn test_lock_wire_shape() {
        let lock = ElementLock {
            node_id: "n1".into(),
            holder_id: "alice".into(),
            holder_name: Some("Alice".into()),
            acquired_at: 5,
            expires_at: Some(10),
        };
        assert_eq!(
            serde_json::to_value(&lock).unwrap(),
            json!({ "nodeId": "n1", "holderId": "alice", "holderName": "Alice", "acquiredAt": 5, "expiresAt": 10 })
        );
    }
}
