//! Error types for each layer of the sync engine.
//!
//! Permission denials and lock conflicts are not errors: they are reported
//! as events with a human-readable reason and the operation is dropped.

use std::time::Duration;

use thiserror::Error;

/// Wire encoding/decoding failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
}

/// Socket-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("transport disposed")]
    Disposed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures surfaced by the sync protocol and session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("operation {0} was not acknowledged in time")]
    AckTimeout(String),
    #[error("operation {operation_id} rejected by server: {reason}")]
    Rejected { operation_id: String, reason: String },
    #[error("operation rejected locally: {0}")]
    LocalRejection(String),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("sync protocol disposed")]
    Disposed,
}

/// Failures reported by the external document replica.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicaError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("invalid operation: {0}")]
    Invalid(String),
}

/// Failures of the three-way merge entry point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("three-way merge requires two update operations")]
    NotUpdates,
    #[error("cannot merge updates targeting different nodes ({local} vs {remote})")]
    DifferentNodes { local: String, remote: String },
    #[error("cannot write property path {0}")]
    InvalidPath(String),
}

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
