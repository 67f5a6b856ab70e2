//! Read-only tree derived from a snapshot

use crate::tree::path::canonical_order;
use crate::types::{FileDescriptor, FileId, FileKind};
use crate::workspace::preferences::InclusionState;
use crate::workspace::snapshot::WorkspaceSnapshot;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: FileId,
    pub name: String,
    pub path: PathBuf,
    pub kind: FileKind,
    pub inclusion: InclusionState,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeProjection {
    pub root: Option<TreeNode>,
}

impl TreeProjection {
    pub fn from_snapshot(snapshot: &WorkspaceSnapshot) -> Self {
        let root = snapshot
            .root_path
            .as_deref()
            .and_then(|root| snapshot.descriptor_for_path(root))
            .map(|descriptor| build_node(snapshot, descriptor));
        Self { root }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        fn count(node: &TreeNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        self.root.as_ref().map(count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn find(&self, path: &Path) -> Option<&TreeNode> {
        let mut node = self.root.as_ref()?;
        if !path.starts_with(&node.path) {
            return None;
        }
        loop {
            if node.path == path {
                return Some(node);
            }
            node = node.children.iter().find(|c| path.starts_with(&c.path))?;
        }
    }
}

fn build_node(snapshot: &WorkspaceSnapshot, descriptor: &FileDescriptor) -> TreeNode {
    let mut children: Vec<&FileDescriptor> = descriptor
        .children
        .iter()
        .filter_map(|child| snapshot.descriptor(child))
        .collect();
    children.sort_by(|a, b| canonical_order(&a.canonical_path, &b.canonical_path));

    TreeNode {
        id: descriptor.id,
        name: descriptor.name.clone(),
        path: descriptor.canonical_path.clone(),
        kind: descriptor.kind,
        inclusion: snapshot.inclusion(&descriptor.id),
        children: children
            .into_iter()
            .map(|child| build_node(snapshot, child))
            .collect(),
    }
}
