//! Document operations exchanged between replicas.
//!
//! An [`Operation`] is immutable once built: the envelope (id, author,
//! document, timestamp) is shared by every kind, and [`OperationKind`] is an
//! exhaustive sum type so the resolver and the permission bridge match every
//! variant explicitly.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::LogicalTimestamp;
use crate::error::MergeError;

/// Id of a node in the external document tree.
pub type NodeId = String;

/// Ordered property path into a node, e.g. `["fill", "color"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyPath(Vec<String>);

impl PropertyPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when one path is a prefix of the other, compared element by element.
    pub fn overlaps(&self, other: &PropertyPath) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Read the value at this path inside `root`.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(root, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Write `value` at this path inside `root`, creating objects as needed.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), MergeError> {
        let Some((last, parents)) = self.0.split_last() else {
            *root = value;
            return Ok(());
        };

        let mut node = root;
        for segment in parents {
            if node.is_null() {
                *node = Value::Object(Default::default());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Default::default())),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| MergeError::InvalidPath(self.to_string()))?,
                _ => return Err(MergeError::InvalidPath(self.to_string())),
            };
        }

        if node.is_null() {
            *node = Value::Object(Default::default());
        }
        match node {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let slot = last
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| MergeError::InvalidPath(self.to_string()))?;
                *slot = value;
                Ok(())
            }
            _ => Err(MergeError::InvalidPath(self.to_string())),
        }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl<S: Into<String>> FromIterator<S> for PropertyPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OperationKind {
    /// Insert a node under `parent_id`. `node_id` is absent when the server
    /// assigns the id.
    Create {
        parent_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        #[serde(default)]
        node: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Delete {
        node_id: NodeId,
    },
    Update {
        node_id: NodeId,
        path: PropertyPath,
        #[serde(default)]
        old_value: Value,
        new_value: Value,
    },
    Move {
        node_id: NodeId,
        new_parent_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_parent_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Reorder {
        node_id: NodeId,
        from_index: usize,
        to_index: usize,
    },
}

impl OperationKind {
    /// The node this operation acts on, if it names one.
    pub fn target_node(&self) -> Option<&NodeId> {
        match self {
            OperationKind::Create { node_id, .. } => node_id.as_ref(),
            OperationKind::Delete { node_id }
            | OperationKind::Update { node_id, .. }
            | OperationKind::Move { node_id, .. }
            | OperationKind::Reorder { node_id, .. } => Some(node_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Create { .. } => "create",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Update { .. } => "update",
            OperationKind::Move { .. } => "move",
            OperationKind::Reorder { .. } => "reorder",
        }
    }

    pub fn update(
        node_id: impl Into<NodeId>,
        path: PropertyPath,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        OperationKind::Update {
            node_id: node_id.into(),
            path,
            old_value,
            new_value,
        }
    }

    pub fn delete(node_id: impl Into<NodeId>) -> Self {
        OperationKind::Delete {
            node_id: node_id.into(),
        }
    }

    pub fn move_to(node_id: impl Into<NodeId>, new_parent_id: impl Into<NodeId>) -> Self {
        OperationKind::Move {
            node_id: node_id.into(),
            new_parent_id: new_parent_id.into(),
            old_parent_id: None,
            index: None,
        }
    }
}

/// An immutable, timestamped document operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    id: String,
    user_id: String,
    document_id: String,
    timestamp: LogicalTimestamp,
    #[serde(flatten)]
    kind: OperationKind,
}

impl Operation {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        timestamp: LogicalTimestamp,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            document_id: document_id.into(),
            timestamp,
            kind,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn timestamp(&self) -> &LogicalTimestamp {
        &self.timestamp
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn target_node(&self) -> Option<&NodeId> {
        self.kind.target_node()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OperationKind::Delete { .. })
    }

    pub fn update_path(&self) -> Option<&PropertyPath> {
        match &self.kind {
            OperationKind::Update { path, .. } => Some(path),
            _ => None,
        }
    }
}
