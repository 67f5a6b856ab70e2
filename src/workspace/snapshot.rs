//! Immutable workspace snapshot and its deterministic hash

use crate::tree::hasher::hash_canonical_lines;
use crate::tree::path::canonical_order;
use crate::types::{FileDescriptor, FileId};
use crate::workspace::preferences::{ContextPreferencesState, InclusionState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Descriptor lookup: id → descriptor
pub type DescriptorIndex = HashMap<FileId, FileDescriptor>;

/// Path lookup: canonical path → id
pub type PathIndex = HashMap<PathBuf, FileId>;

/// Selection fields carried by a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub selected_path: Option<PathBuf>,
    pub last_persisted_selection: Option<PathBuf>,
    pub selected_descriptor_id: Option<FileId>,
}

impl Selection {
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Selection of an indexed path, persisted under the same path
    pub fn of(path: PathBuf, id: FileId) -> Self {
        Self {
            selected_path: Some(path.clone()),
            last_persisted_selection: Some(path),
            selected_descriptor_id: Some(id),
        }
    }
}

/// Point-in-time view of the workspace tree, selection and preferences
///
/// Never mutated after construction; the state owner replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub root_path: Option<PathBuf>,
    pub selected_path: Option<PathBuf>,
    pub last_persisted_selection: Option<PathBuf>,
    pub selected_descriptor_id: Option<FileId>,
    pub context_preferences: ContextPreferencesState,
    pub descriptor_paths: HashMap<FileId, PathBuf>,
    pub context_inclusions: HashMap<FileId, InclusionState>,
    /// Canonical (case-insensitive path) order
    pub descriptors: Vec<FileDescriptor>,
    pub snapshot_hash: String,
    position: HashMap<FileId, usize>,
}

impl WorkspaceSnapshot {
    /// Snapshot of a closed workspace
    pub fn empty() -> Self {
        Self::build(
            None,
            Selection::cleared(),
            ContextPreferencesState::default(),
            std::iter::empty(),
        )
    }

    /// Build a snapshot; descriptor order and hash do not depend on input order
    pub fn build<I>(
        root_path: Option<PathBuf>,
        selection: Selection,
        context_preferences: ContextPreferencesState,
        descriptors: I,
    ) -> Self
    where
        I: IntoIterator<Item = FileDescriptor>,
    {
        let mut descriptors: Vec<FileDescriptor> = descriptors.into_iter().collect();
        descriptors.sort_by(|a, b| canonical_order(&a.canonical_path, &b.canonical_path));

        let mut descriptor_paths = HashMap::with_capacity(descriptors.len());
        let mut context_inclusions = HashMap::new();
        let mut position = HashMap::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            descriptor_paths.insert(descriptor.id, descriptor.canonical_path.clone());
            position.insert(descriptor.id, index);
            let state = context_preferences.inclusion_for(&descriptor.canonical_path);
            if state != InclusionState::Neutral {
                context_inclusions.insert(descriptor.id, state);
            }
        }

        let snapshot_hash = compute_snapshot_hash(
            root_path.as_deref(),
            &descriptors,
            &context_inclusions,
            &context_preferences,
        );

        Self {
            root_path,
            selected_path: selection.selected_path,
            last_persisted_selection: selection.last_persisted_selection,
            selected_descriptor_id: selection.selected_descriptor_id,
            context_preferences,
            descriptor_paths,
            context_inclusions,
            descriptors,
            snapshot_hash,
            position,
        }
    }

    /// Same tree, new selection and preferences
    pub fn with_state(&self, selection: Selection, preferences: ContextPreferencesState) -> Self {
        Self::build(
            self.root_path.clone(),
            selection,
            preferences,
            self.descriptors.iter().cloned(),
        )
    }

    pub fn selection(&self) -> Selection {
        Selection {
            selected_path: self.selected_path.clone(),
            last_persisted_selection: self.last_persisted_selection.clone(),
            selected_descriptor_id: self.selected_descriptor_id,
        }
    }

    pub fn is_open(&self) -> bool {
        self.root_path.is_some()
    }

    pub fn descriptor(&self, id: &FileId) -> Option<&FileDescriptor> {
        self.position.get(id).map(|&index| &self.descriptors[index])
    }

    pub fn path_for(&self, id: &FileId) -> Option<&Path> {
        self.descriptor_paths.get(id).map(PathBuf::as_path)
    }

    pub fn descriptor_for_path(&self, path: &Path) -> Option<&FileDescriptor> {
        self.descriptors
            .binary_search_by(|d| canonical_order(&d.canonical_path, path))
            .ok()
            .map(|index| &self.descriptors[index])
    }

    pub fn inclusion(&self, id: &FileId) -> InclusionState {
        self.context_inclusions
            .get(id)
            .copied()
            .unwrap_or(InclusionState::Neutral)
    }

    /// All file descriptors at or beneath `path`, in canonical order
    pub fn files_within(&self, path: &Path) -> Vec<&FileDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| !d.is_directory() && d.canonical_path.starts_with(path))
            .collect()
    }
}

/// Resolve descriptor ids to paths
pub trait DescriptorPathResolver: Send + Sync {
    fn resolve(&self, id: &FileId) -> Option<PathBuf>;
}

impl DescriptorPathResolver for WorkspaceSnapshot {
    fn resolve(&self, id: &FileId) -> Option<PathBuf> {
        self.path_for(id).map(Path::to_path_buf)
    }
}

/// Deterministic digest over the canonical textual encoding of a snapshot
///
/// Covers the root path, `(id, path)` pairs, descriptor fields, inclusion
/// states and preference sets. Selection is not part of the digest.
pub fn compute_snapshot_hash(
    root_path: Option<&Path>,
    descriptors: &[FileDescriptor],
    inclusions: &HashMap<FileId, InclusionState>,
    preferences: &ContextPreferencesState,
) -> String {
    let mut lines = Vec::with_capacity(descriptors.len() * 2 + inclusions.len() + 4);

    lines.push(format!(
        "root:{}",
        root_path
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    ));

    for descriptor in descriptors {
        let path = descriptor.canonical_path.to_string_lossy();
        lines.push(format!("path:{}:{}", descriptor.id, path));

        let mut children: Vec<String> = descriptor.children.iter().map(|c| c.to_string()).collect();
        children.sort();
        lines.push(format!(
            "descriptor:{}|{}|{}|{}|{}|{}",
            path,
            descriptor.language.as_deref().unwrap_or(""),
            descriptor.size,
            descriptor.content_hash.map(hex::encode).unwrap_or_default(),
            descriptor.kind.as_str(),
            children.join(",")
        ));
    }

    for (id, state) in inclusions {
        lines.push(format!("inclusion:{}:{}", id, state.as_str()));
    }

    for path in &preferences.included_paths {
        lines.push(format!("include:{}", path.to_string_lossy()));
    }
    for path in &preferences.excluded_paths {
        lines.push(format!("exclude:{}", path.to_string_lossy()));
    }
    if let Some(focus) = &preferences.last_focused_file_path {
        lines.push(format!("focus:{}", focus.to_string_lossy()));
    }

    hex::encode(hash_canonical_lines(lines))
}
