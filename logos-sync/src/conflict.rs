//! Collision detection and resolution between concurrent operations.
//!
//! A remote operation collides with a pending local one when both target the
//! same node, their logical timestamps are within the concurrency window,
//! and their combination is one of:
//!
//! | Local / remote            | Conflict type    |
//! |---------------------------|------------------|
//! | either is a delete        | `delete_edit`    |
//! | updates, overlapping path | `concurrent_edit`|
//! | both moves                | `move_conflict`  |
//!
//! Everything else (different nodes, disjoint property paths, a move
//! racing an update) applies cleanly in either order.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConflictConfig;
use crate::error::MergeError;
use crate::events::{EventBus, Subscription};
use crate::operation::{NodeId, Operation, OperationKind};
use crate::permissions::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentEdit,
    DeleteEdit,
    MoveConflict,
    PermissionDenied,
}

/// A collision between a pending local operation and an incoming remote one.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub kind: ConflictType,
    pub local: Operation,
    pub remote: Operation,
    /// The operation that survives, once resolved.
    pub resolved: Option<Operation>,
    pub auto_resolved: bool,
}

impl Conflict {
    pub fn new(kind: ConflictType, local: Operation, remote: Operation) -> Self {
        Self {
            kind,
            local,
            remote,
            resolved: None,
            auto_resolved: false,
        }
    }

    /// True when resolution kept the local operation.
    pub fn local_won(&self) -> bool {
        self.resolved
            .as_ref()
            .is_some_and(|op| op.id() == self.local.id())
    }
}

/// How a resolver picks the surviving operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Higher author role wins; equal roles fall back to the later logical
    /// timestamp, origin breaking counter ties, so every peer agrees.
    #[default]
    RolePrecedence,
    /// Last write wins; equal counters favor local.
    Timestamp,
    /// Disjoint updates both apply; true overlaps use role precedence.
    Merge,
    LocalWins,
    RemoteWins,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictEvent {
    Detected(Conflict),
    Resolved(Conflict),
    /// No strategy could pick a winner; only the affected operation is held back.
    Unresolvable(Conflict),
}

/// Result of [`ConflictResolver::three_way_merge`].
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Disjoint paths: `base` with both new values written.
    Merged(Value),
    /// Same path: a resolved `concurrent_edit`.
    Resolved(Conflict),
}

pub struct ConflictResolver {
    strategy: ResolutionStrategy,
    concurrency_threshold: u64,
    history_limit: usize,
    history: HashMap<NodeId, VecDeque<Operation>>,
    roles: HashMap<String, Role>,
    events: EventBus<ConflictEvent>,
}

impl ConflictResolver {
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            strategy: config.strategy,
            concurrency_threshold: config.concurrency_threshold,
            history_limit: config.history_limit.max(1),
            history: HashMap::new(),
            roles: HashMap::new(),
            events: EventBus::new(),
        }
    }

    pub fn with_strategy(strategy: ResolutionStrategy) -> Self {
        Self::new(&ConflictConfig {
            strategy,
            ..ConflictConfig::default()
        })
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: ResolutionStrategy) {
        self.strategy = strategy;
    }

    pub fn subscribe(&self) -> Subscription<ConflictEvent> {
        self.events.subscribe()
    }

    // ── Participants ─────────────────────────────────────────────

    pub fn set_participant_role(&mut self, user_id: impl Into<String>, role: Role) {
        self.roles.insert(user_id.into(), role);
    }

    pub fn remove_participant(&mut self, user_id: &str) {
        self.roles.remove(user_id);
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.roles.contains_key(user_id)
    }

    /// Unknown participants rank as viewers.
    pub fn participant_role(&self, user_id: &str) -> Role {
        self.roles.get(user_id).copied().unwrap_or(Role::Viewer)
    }

    // ── Detection ────────────────────────────────────────────────

    /// One conflict per pending local operation that collides with `incoming`.
    pub fn detect_conflicts(&self, incoming: &Operation, pending_local: &[Operation]) -> Vec<Conflict> {
        let conflicts: Vec<Conflict> = pending_local
            .iter()
            .filter_map(|local| {
                self.classify(local, incoming)
                    .map(|kind| Conflict::new(kind, local.clone(), incoming.clone()))
            })
            .collect();

        for conflict in &conflicts {
            log::debug!(
                "conflict {:?} on {:?}: local {} vs remote {}",
                conflict.kind,
                conflict.remote.target_node(),
                conflict.local.id(),
                conflict.remote.id()
            );
            self.events.emit(ConflictEvent::Detected(conflict.clone()));
        }
        conflicts
    }

    /// Conflict type for a pair, or `None` when they commute.
    pub fn classify(&self, local: &Operation, remote: &Operation) -> Option<ConflictType> {
        let (Some(local_node), Some(remote_node)) = (local.target_node(), remote.target_node())
        else {
            return None;
        };
        if local_node != remote_node {
            return None;
        }
        if local.timestamp().distance(remote.timestamp()) >= self.concurrency_threshold {
            return None;
        }

        match (local.kind(), remote.kind()) {
            (OperationKind::Delete { .. }, _) | (_, OperationKind::Delete { .. }) => {
                Some(ConflictType::DeleteEdit)
            }
            (
                OperationKind::Update { path: local_path, .. },
                OperationKind::Update { path: remote_path, .. },
            ) if local_path.overlaps(remote_path) => Some(ConflictType::ConcurrentEdit),
            (OperationKind::Move { .. }, OperationKind::Move { .. }) => {
                Some(ConflictType::MoveConflict)
            }
            _ => None,
        }
    }

    // ── Resolution ───────────────────────────────────────────────

    /// Pick the surviving operation under the configured strategy.
    pub fn resolve_conflict(&self, mut conflict: Conflict) -> Conflict {
        match self.pick_winner(&conflict) {
            Some(winner) => {
                conflict.resolved = Some(winner);
                conflict.auto_resolved = true;
                self.events.emit(ConflictEvent::Resolved(conflict.clone()));
            }
            None => {
                log::warn!(
                    "unresolvable {:?} between {} and {}",
                    conflict.kind,
                    conflict.local.id(),
                    conflict.remote.id()
                );
                self.events.emit(ConflictEvent::Unresolvable(conflict.clone()));
            }
        }
        conflict
    }

    fn pick_winner(&self, conflict: &Conflict) -> Option<Operation> {
        let (local, remote) = (&conflict.local, &conflict.remote);
        let winner = match self.strategy {
            ResolutionStrategy::RolePrecedence => self.by_role(local, remote),
            ResolutionStrategy::Timestamp => by_timestamp(local, remote),
            ResolutionStrategy::Merge => match (local.update_path(), remote.update_path()) {
                (Some(a), Some(b)) if !a.overlaps(b) => remote,
                _ => self.by_role(local, remote),
            },
            ResolutionStrategy::LocalWins => local,
            ResolutionStrategy::RemoteWins => remote,
        };
        Some(winner.clone())
    }

    fn by_role<'a>(&self, local: &'a Operation, remote: &'a Operation) -> &'a Operation {
        let local_priority = self.participant_role(local.user_id()).priority();
        let remote_priority = self.participant_role(remote.user_id()).priority();
        match local_priority.cmp(&remote_priority) {
            Ordering::Greater => local,
            Ordering::Less => remote,
            Ordering::Equal => by_total_order(local, remote),
        }
    }

    /// Merge two concurrent updates against a common `base` node value.
    pub fn three_way_merge(
        &self,
        base: &Value,
        local: &Operation,
        remote: &Operation,
    ) -> Result<MergeOutcome, MergeError> {
        let (
            OperationKind::Update {
                node_id: local_node,
                path: local_path,
                new_value: local_value,
                ..
            },
            OperationKind::Update {
                node_id: remote_node,
                path: remote_path,
                new_value: remote_value,
                ..
            },
        ) = (local.kind(), remote.kind())
        else {
            return Err(MergeError::NotUpdates);
        };

        if local_node != remote_node {
            return Err(MergeError::DifferentNodes {
                local: local_node.clone(),
                remote: remote_node.clone(),
            });
        }

        if local_path == remote_path {
            let conflict = Conflict::new(ConflictType::ConcurrentEdit, local.clone(), remote.clone());
            return Ok(MergeOutcome::Resolved(self.resolve_conflict(conflict)));
        }

        // Shorter path first so a nested write is not clobbered by its parent.
        let mut writes = [(local_path, local_value), (remote_path, remote_value)];
        writes.sort_by_key(|(path, _)| path.segments().len());

        let mut merged = base.clone();
        for (path, value) in writes {
            path.set(&mut merged, value.clone())?;
        }
        Ok(MergeOutcome::Merged(merged))
    }

    // ── History ──────────────────────────────────────────────────

    /// Append to the node's bounded history, evicting the oldest entry.
    pub fn record_operation(&mut self, op: &Operation) {
        let Some(node) = op.target_node() else {
            return;
        };
        let log = self.history.entry(node.clone()).or_default();
        if log.len() == self.history_limit {
            log.pop_front();
        }
        log.push_back(op.clone());
    }

    /// Oldest first.
    pub fn history(&self, node_id: &str) -> Vec<Operation> {
        self.history
            .get(node_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(&ConflictConfig::default())
    }
}

fn by_timestamp<'a>(local: &'a Operation, remote: &'a Operation) -> &'a Operation {
    if local.timestamp().counter >= remote.timestamp().counter {
        local
    } else {
        remote
    }
}

fn by_total_order<'a>(local: &'a Operation, remote: &'a Operation) -> &'a Operation {
    if local.timestamp() >= remote.timestamp() {
        local
    } else {
        remote
    }
}
