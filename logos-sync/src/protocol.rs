//! JSON wire protocol between the sync client and the relay server.
//!
//! Every frame is one JSON object with a `type` discriminator:
//! ```text
//! { "type": "OPERATION", "operation": { "id": "...", "type": "update", ... } }
//! ```
//!
//! | Type          | Direction | Payload                                   |
//! |---------------|-----------|-------------------------------------------|
//! | HELLO         | c → s     | clientId, documentId, userName, version   |
//! | HELLO_ACK     | s → c     | clients (id, name, color?, userId?, role?)|
//! | SYNC_REQUEST  | c → s     | since (nullable cursor)                   |
//! | SYNC_RESPONSE | s → c     | operations, complete, nextCursor          |
//! | OPERATION     | both      | operation                                 |
//! | OPERATION_ACK | s → c     | operationId, success, error?              |
//! | PRESENCE      | both      | clientId, presence (partial)              |
//! | PING / PONG   | both      | timestamp                                 |
//! | ERROR         | s → c     | code, message, details?                   |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::LogicalTimestamp;
use crate::error::ProtocolError;
use crate::operation::Operation;
use crate::permissions::Role;
use crate::presence::PresencePatch;

/// Version announced in HELLO.
pub const PROTOCOL_VERSION: u32 = 1;

/// Peer entry in a HELLO_ACK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub client_id: String,
    pub user_name: String,
    #[serde(default)]
    pub color: Option<String>,
    /// Author id this client's operations carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl PeerInfo {
    pub fn new(client_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_name: user_name.into(),
            color: None,
            user_id: None,
            role: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_role(mut self, user_id: impl Into<String>, role: Role) -> Self {
        self.user_id = Some(user_id.into());
        self.role = Some(role);
        self
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    Hello {
        client_id: String,
        document_id: String,
        user_name: String,
        version: u32,
    },
    HelloAck {
        #[serde(default)]
        clients: Vec<PeerInfo>,
    },
    SyncRequest {
        since: Option<LogicalTimestamp>,
    },
    SyncResponse {
        #[serde(default)]
        operations: Vec<Operation>,
        complete: bool,
        #[serde(default)]
        next_cursor: Option<LogicalTimestamp>,
    },
    Operation {
        operation: Operation,
    },
    OperationAck {
        operation_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Presence {
        client_id: String,
        presence: PresencePatch,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl Message {
    pub fn hello(
        client_id: impl Into<String>,
        document_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Message::Hello {
            client_id: client_id.into(),
            document_id: document_id.into(),
            user_name: user_name.into(),
            version: PROTOCOL_VERSION,
        }
    }

    pub fn sync_request(since: Option<LogicalTimestamp>) -> Self {
        Message::SyncRequest { since }
    }

    pub fn operation(operation: Operation) -> Self {
        Message::Operation { operation }
    }

    pub fn presence(client_id: impl Into<String>, presence: PresencePatch) -> Self {
        Message::Presence {
            client_id: client_id.into(),
            presence,
        }
    }

    pub fn ping(timestamp: u64) -> Self {
        Message::Ping { timestamp }
    }

    pub fn pong(timestamp: u64) -> Self {
        Message::Pong { timestamp }
    }

    /// The wire discriminator, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::HelloAck { .. } => "HELLO_ACK",
            Message::SyncRequest { .. } => "SYNC_REQUEST",
            Message::SyncResponse { .. } => "SYNC_RESPONSE",
            Message::Operation { .. } => "OPERATION",
            Message::OperationAck { .. } => "OPERATION_ACK",
            Message::Presence { .. } => "PRESENCE",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Error { .. } => "ERROR",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::decode(text)
    }
}
