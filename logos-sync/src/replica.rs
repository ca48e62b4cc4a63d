//! The document-model seam.
//!
//! The sync engine never owns the scene graph. It hands validated operations
//! to a [`DocumentReplica`] supplied by the host application. [`MemoryReplica`]
//! is a small JSON-backed tree used by tests and headless tools.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ReplicaError;
use crate::operation::{NodeId, Operation, OperationKind};

/// A client's local copy of the shared document.
pub trait DocumentReplica: Send {
    fn apply_operation(&mut self, op: &Operation) -> Result<(), ReplicaError>;

    fn contains(&self, node_id: &str) -> bool;
}

#[derive(Debug, Clone)]
struct MemoryNode {
    parent: NodeId,
    props: Value,
}

/// In-memory node tree. Parents need not exist; any id can act as a root.
#[derive(Debug, Default, Clone)]
pub struct MemoryReplica {
    nodes: HashMap<NodeId, MemoryNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    applied: Vec<String>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a node without going through an operation.
    pub fn insert(&mut self, parent: impl Into<NodeId>, node_id: impl Into<NodeId>, props: Value) {
        let (parent, node_id) = (parent.into(), node_id.into());
        self.children.entry(parent.clone()).or_default().push(node_id.clone());
        self.nodes.insert(node_id, MemoryNode { parent, props });
    }

    pub fn node(&self, node_id: &str) -> Option<&Value> {
        self.nodes.get(node_id).map(|n| &n.props)
    }

    pub fn parent(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).map(|n| n.parent.as_str())
    }

    pub fn children(&self, parent: &str) -> &[NodeId] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of every operation applied, in order.
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    fn detach(&mut self, node_id: &str, parent: &str) {
        if let Some(siblings) = self.children.get_mut(parent) {
            siblings.retain(|id| id != node_id);
        }
    }

    fn attach(&mut self, node_id: &str, parent: &str, index: Option<usize>) {
        let siblings = self.children.entry(parent.to_string()).or_default();
        let at = index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(at, node_id.to_string());
    }

    fn remove_subtree(&mut self, node_id: &str) {
        if let Some(kids) = self.children.remove(node_id) {
            for kid in kids {
                self.remove_subtree(&kid);
            }
        }
        self.nodes.remove(node_id);
    }
}

impl DocumentReplica for MemoryReplica {
    fn apply_operation(&mut self, op: &Operation) -> Result<(), ReplicaError> {
        match op.kind() {
            OperationKind::Create {
                parent_id,
                node_id,
                node,
                index,
            } => {
                let node_id = node_id
                    .clone()
                    .ok_or_else(|| ReplicaError::Invalid("create without node id".into()))?;
                if self.nodes.contains_key(&node_id) {
                    return Err(ReplicaError::Invalid(format!("node {node_id} already exists")));
                }
                self.attach(&node_id, parent_id, *index);
                self.nodes.insert(
                    node_id,
                    MemoryNode {
                        parent: parent_id.clone(),
                        props: node.clone(),
                    },
                );
            }
            OperationKind::Delete { node_id } => {
                let parent = self
                    .nodes
                    .get(node_id)
                    .map(|n| n.parent.clone())
                    .ok_or_else(|| ReplicaError::NodeNotFound(node_id.clone()))?;
                self.detach(node_id, &parent);
                self.remove_subtree(node_id);
            }
            OperationKind::Update {
                node_id,
                path,
                new_value,
                ..
            } => {
                let node = self
                    .nodes
                    .get_mut(node_id)
                    .ok_or_else(|| ReplicaError::NodeNotFound(node_id.clone()))?;
                path.set(&mut node.props, new_value.clone())
                    .map_err(|e| ReplicaError::Invalid(e.to_string()))?;
            }
            OperationKind::Move {
                node_id,
                new_parent_id,
                index,
                ..
            } => {
                let old_parent = self
                    .nodes
                    .get(node_id)
                    .map(|n| n.parent.clone())
                    .ok_or_else(|| ReplicaError::NodeNotFound(node_id.clone()))?;
                self.detach(node_id, &old_parent);
                self.attach(node_id, new_parent_id, *index);
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.parent = new_parent_id.clone();
                }
            }
            OperationKind::Reorder {
                node_id,
                from_index,
                to_index,
            } => {
                let parent = self
                    .nodes
                    .get(node_id)
                    .map(|n| n.parent.clone())
                    .ok_or_else(|| ReplicaError::NodeNotFound(node_id.clone()))?;
                let siblings = self.children.entry(parent).or_default();
                if siblings.get(*from_index).map(String::as_str) != Some(node_id.as_str())
                    || *to_index >= siblings.len()
                {
                    return Err(ReplicaError::Invalid(format!(
                        "cannot reorder {node_id} from {from_index} to {to_index}"
                    )));
                }
                let moved = siblings.remove(*from_index);
                siblings.insert(*to_index, moved);
            }
        }
        self.applied.push(op.id().to_string());
        Ok(())
    }

    fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LogicalTimestamp;
    use crate::operation::PropertyPath;
    use serde_json::json;

    fn op(id: &str, kind: OperationKind) -> Operation {
        Operation::new(id, "u", "doc", LogicalTimestamp::new(1, "c"), kind)
    }

    #[test]
    fn test_create_update_delete() {
        let mut replica = MemoryReplica::new();
        replica
            .apply_operation(&op(
                "1",
                OperationKind::Create {
                    parent_id: "root".into(),
                    node_id: Some("rect".into()),
                    node: json!({ "fill": "#000" }),
                    index: None,
                },
            ))
            .unwrap();
        replica
            .apply_operation(&op(
                "2",
                OperationKind::update("rect", PropertyPath::new(["fill"]), json!("#000"), json!("#fff")),
            ))
            .unwrap();
        assert_eq!(replica.node("rect"), Some(&json!({ "fill": "#fff" })));
        assert_eq!(replica.children("root"), ["rect".to_string()]);

        replica.apply_operation(&op("3", OperationKind::delete("rect"))).unwrap();
        assert!(!replica.contains("rect"));
        assert!(replica.children("root").is_empty());
        assert_eq!(replica.applied(), ["1", "2", "3"]);
    }

    #[test]
    fn test_delete_removes_subtree() {
        let mut replica = MemoryReplica::new();
        replica.insert("root", "frame", json!({}));
        replica.insert("frame", "child", json!({}));
        replica.apply_operation(&op("1", OperationKind::delete("frame"))).unwrap();
        assert!(replica.is_empty());
    }

    #[test]
    fn test_move_and_reorder() {
        let mut replica = MemoryReplica::new();
        replica.insert("root", "a", json!({}));
        replica.insert("root", "b", json!({}));
        replica.insert("root", "c", json!({}));

        replica
            .apply_operation(&op(
                "1",
                OperationKind::Reorder {
                    node_id: "c".into(),
                    from_index: 2,
                    to_index: 0,
                },
            ))
            .unwrap();
        assert_eq!(replica.children("root"), ["c", "a", "b"]);

        replica.apply_operation(&op("2", OperationKind::move_to("a", "frame"))).unwrap();
        assert_eq!(replica.children("root"), ["c", "b"]);
        assert_eq!(replica.parent("a"), Some("frame"));
    }

    #[test]
    fn test_missing_nodes_are_errors() {
        let mut replica = MemoryReplica::new();
        assert_eq!(
            replica.apply_operation(&op("1", OperationKind::delete("ghost"))),
            Err(ReplicaError::NodeNotFound("ghost".into()))
        );
        let create = OperationKind::Create {
            parent_id: "root".into(),
            node_id: None,
            node: json!({}),
            index: None,
        };
        assert!(matches!(
            replica.apply_operation(&op("2", create)),
            Err(ReplicaError::Invalid(_))
        ));
        assert!(replica.applied().is_empty());
    }
}
