//! Cancellable tree walk over a [`FileSystemAccess`] collaborator

use crate::error::EngineError;
use crate::fs::FileSystemAccess;
use crate::tree::path::standardize_path;
use crate::types::{FileDescriptor, FileId};
use crate::workspace::snapshot::{DescriptorIndex, PathIndex};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Result of a full walk
#[derive(Debug, Clone)]
pub struct WalkOutput {
    pub root_id: FileId,
    pub descriptors: DescriptorIndex,
    pub paths: PathIndex,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Walk the tree under `root`
///
/// Children whose canonical path is in `excluded` are dropped together with
/// their subtrees. The token is checked before and after every directory
/// listing; a cancelled walk returns [`EngineError::Cancelled`] and produces
/// nothing.
#[instrument(skip(fs, excluded, cancel), fields(root = %root.display()))]
pub async fn walk_tree(
    fs: &dyn FileSystemAccess,
    root: &Path,
    excluded: &BTreeSet<PathBuf>,
    cancel: &CancellationToken,
) -> Result<WalkOutput, EngineError> {
    let start = Instant::now();
    check_cancelled(cancel)?;

    let root_id = fs
        .resolve_root(root)
        .await
        .map_err(|e| EngineError::InvalidWorkspace(e.to_string()))?;
    let root_meta = fs
        .metadata(root_id)
        .await
        .map_err(|e| EngineError::InvalidWorkspace(e.to_string()))?;
    if !root_meta.is_directory {
        return Err(EngineError::InvalidWorkspace(format!(
            "{} is not a directory",
            root_meta.path.display()
        )));
    }

    let root_path = standardize_path(&root_meta.path);
    let mut descriptors = DescriptorIndex::new();
    let mut paths = PathIndex::new();
    descriptors.insert(root_id, FileDescriptor::directory(root_id, root_path.clone()));
    paths.insert(root_path, root_id);

    let mut stack = vec![root_id];
    while let Some(dir_id) = stack.pop() {
        check_cancelled(cancel)?;
        let listed = fs.list_children(dir_id).await.map_err(|e| {
            EngineError::InvalidWorkspace(format!("Failed to list directory: {}", e))
        })?;
        check_cancelled(cancel)?;

        let mut child_ids = Vec::with_capacity(listed.len());
        for mut child in listed {
            child.canonical_path = standardize_path(&child.canonical_path);
            if excluded.contains(&child.canonical_path) {
                debug!(path = %child.canonical_path.display(), "Skipping excluded entry");
                continue;
            }
            child_ids.push(child.id);
            if child.is_directory() {
                child.children.clear();
                stack.push(child.id);
            }
            paths.insert(child.canonical_path.clone(), child.id);
            descriptors.insert(child.id, child);
        }

        if let Some(dir) = descriptors.get_mut(&dir_id) {
            dir.children = child_ids;
        }
    }

    info!(
        descriptor_count = descriptors.len(),
        duration_ms = start.elapsed().as_millis(),
        "Tree walk completed"
    );

    Ok(WalkOutput {
        root_id,
        descriptors,
        paths,
    })
}
