//! Context preparation from a workspace snapshot

use crate::context::budget::{ContextBudget, ContextBuildResult, ContextBuilder, LoadedFile};
use crate::error::EngineError;
use crate::fs::{FileContentLoading, LocalContentLoader};
use crate::types::{FileDescriptor, FileId};
use crate::workspace::snapshot::WorkspaceSnapshot;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Resolves candidate files from a snapshot, loads them and applies a budget
#[derive(Clone)]
pub struct ContextPreparer {
    loader: Arc<dyn FileContentLoading>,
}

impl ContextPreparer {
    pub fn new(loader: Arc<dyn FileContentLoading>) -> Self {
        Self { loader }
    }

    pub fn local() -> Self {
        Self::new(Arc::new(LocalContentLoader))
    }

    /// Build context for a snapshot
    ///
    /// Preferred ids are validated before anything is loaded. Candidates come
    /// from the first non-empty source among: included paths, preferred ids,
    /// selected descriptor, selected path, last focused path.
    #[instrument(skip_all, fields(root = ?snapshot.root_path))]
    pub async fn prepare(
        &self,
        snapshot: &WorkspaceSnapshot,
        preferred: Option<&[FileId]>,
        budget: &ContextBudget,
    ) -> Result<ContextBuildResult, EngineError> {
        let candidates = candidate_files(snapshot, preferred)?;
        debug!(candidates = candidates.len(), "Resolved context candidates");

        let mut files = Vec::with_capacity(candidates.len());
        for descriptor in candidates {
            let content = self.load(&descriptor.canonical_path).await?;
            files.push(
                LoadedFile::new(descriptor.canonical_path.clone(), content)
                    .with_descriptor(descriptor.id)
                    .with_language(descriptor.language.clone()),
            );
        }
        Ok(ContextBuilder::build(files, budget))
    }

    /// Build context from explicit paths, outside any snapshot
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub async fn load_paths(
        &self,
        paths: &[PathBuf],
        budget: &ContextBudget,
    ) -> Result<ContextBuildResult, EngineError> {
        let mut seen = HashSet::new();
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            if !seen.insert(path) {
                continue;
            }
            let content = self.load(path).await?;
            files.push(LoadedFile::new(path.clone(), content));
        }
        Ok(ContextBuilder::build(files, budget))
    }

    async fn load(&self, path: &Path) -> Result<String, EngineError> {
        self.loader.load(path).await.map_err(|e| {
            EngineError::ContextLoadFailed(format!("{}: {}", path.display(), e))
        })
    }
}

/// Resolve the file descriptors to load, in canonical order
pub fn candidate_files<'a>(
    snapshot: &'a WorkspaceSnapshot,
    preferred: Option<&[FileId]>,
) -> Result<Vec<&'a FileDescriptor>, EngineError> {
    let preferred = preferred.unwrap_or(&[]);
    let missing = preferred
        .iter()
        .filter(|id| snapshot.descriptor(id).is_none())
        .count();
    if missing > 0 {
        return Err(EngineError::ContextLoadFailed(format!(
            "{} preferred descriptor(s) missing from snapshot",
            missing
        )));
    }

    let preferences = &snapshot.context_preferences;
    let roots: Vec<&Path> = if !preferences.included_paths.is_empty() {
        preferences.included_paths.iter().map(PathBuf::as_path).collect()
    } else if !preferred.is_empty() {
        preferred
            .iter()
            .filter_map(|id| snapshot.path_for(id))
            .collect()
    } else if let Some(path) = snapshot
        .selected_descriptor_id
        .as_ref()
        .and_then(|id| snapshot.path_for(id))
    {
        vec![path]
    } else if let Some(path) = snapshot.selected_path.as_deref() {
        vec![path]
    } else if let Some(path) = preferences.last_focused_file_path.as_deref() {
        vec![path]
    } else {
        Vec::new()
    };

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for root in roots {
        let Some(descriptor) = snapshot.descriptor_for_path(root) else {
            debug!(path = %root.display(), "Context path not in snapshot");
            continue;
        };
        let expanded = if descriptor.is_directory() {
            snapshot.files_within(&descriptor.canonical_path)
        } else {
            vec![descriptor]
        };
        for file in expanded {
            if preferences.is_excluded(&file.canonical_path) {
                continue;
            }
            if seen.insert(file.id) {
                files.push(file);
            }
        }
    }
    Ok(files)
}
