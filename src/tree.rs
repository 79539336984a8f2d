//! Snapshot tree traversal

use crate::types::{SnapshotId, SnapshotNode};

/// Flatten a snapshot tree into chronological order.
///
/// Nodes are visited depth-first, each parent before its children and
/// children in the order the platform stores them. The root itself is not
/// part of the result.
pub fn chronological_ids(root: &SnapshotNode) -> Vec<SnapshotId> {
    let mut ids = Vec::with_capacity(root.len() - 1);
    let mut stack: Vec<&SnapshotNode> = root.children.iter().rev().collect();

    while let Some(node) = stack.pop() {
        ids.push(node.id.clone());
        stack.extend(node.children.iter().rev());
    }

    ids
}
