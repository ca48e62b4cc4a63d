//! # logos-sync — Real-time collaboration sync core for Logos
//!
//! Keeps each client's replica of a shared design document consistent with
//! its peers through a central relay, while enforcing per-user permissions
//! and element-level locks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Transport   │ ◄─────────────────► │ Relay       │
//! │ (per user)  │     JSON frames     │ (external)  │
//! └──────┬──────┘                     └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐     ┌──────────────────┐
//! │ SyncProtocol│ ──► │ ConflictResolver │
//! │ clock, acks │     └────────┬─────────┘
//! └──────┬──────┘              ▼
//!        │           ┌──────────────────┐     ┌──────────────────┐
//!        │           │ PermissionBridge │ ──► │ DocumentReplica  │
//!        │           │ roles, locks     │     │ (host document)  │
//!        ▼           └──────────────────┘     └──────────────────┘
//! ┌─────────────────┐
//! │ PresenceTracker │
//! └─────────────────┘
//! ```
//!
//! [`CollabSession`] owns one of each for a single document.
//!
//! ## Modules
//!
//! - [`transport`] — WebSocket adapter with offline queue and backoff
//! - [`sync`] — Handshake, paginated history replay, acks, presence throttle
//! - [`conflict`] — Collision detection and resolution strategies
//! - [`bridge`] — Permission and lock gates in front of the replica
//! - [`presence`] — Remote cursors and selections with expiry
//! - [`session`] — The pieces above wired together
//! - [`protocol`] — JSON wire messages
//! - [`operation`] — Document operations and property paths

pub mod bridge;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod ids;
pub mod operation;
pub mod permissions;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod sync;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use bridge::{ApplyOutcome, BridgeEvent, ElementLock, PermissionBridge, ReleaseReason};
pub use clock::{LamportClock, LogicalTimestamp, ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::{
    ConflictConfig, LockConfig, PresenceConfig, SessionConfig, SyncConfig, TransportConfig,
};
pub use conflict::{
    Conflict, ConflictEvent, ConflictResolver, ConflictType, MergeOutcome, ResolutionStrategy,
};
pub use error::{
    ConfigError, MergeError, ProtocolError, ReplicaError, SyncError, TransportError,
};
pub use events::{EventBus, Subscription};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use operation::{NodeId, Operation, OperationKind, PropertyPath};
pub use permissions::{Permission, Role, RoleSource};
pub use presence::{
    CursorColor, CursorView, Point, PresenceData, PresenceEvent, PresencePatch,
    PresenceTracker, SelectionView, Viewport,
};
pub use protocol::{Message, PeerInfo, PROTOCOL_VERSION};
pub use replica::{DocumentReplica, MemoryReplica};
pub use session::{CollabSession, SessionEvent};
pub use sync::{AckWaiter, SyncEvent, SyncProtocol};
pub use timer::ScheduledTask;
pub use transport::{ConnectionState, Transport, TransportEvent};
