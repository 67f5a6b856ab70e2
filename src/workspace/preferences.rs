//! Persisted workspace preferences
//!
//! Two records are stored per workspace root: the last selection
//! ([`WorkspacePreferences`]) and the context inclusion sets
//! ([`ContextPreferencesState`]). Both go through [`PreferencesDriver`]; the
//! bundled [`JsonPreferencesStore`] keeps them as JSON files under the XDG data
//! directory, one directory per workspace.

use crate::error::StorageError;
use crate::tree::hasher::compute_content_hash;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Selection record restored by `open_workspace`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePreferences {
    #[serde(default)]
    pub last_selection: Option<PathBuf>,
}

/// Inclusion state of a single descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InclusionState {
    Included,
    Excluded,
    Neutral,
}

impl InclusionState {
    pub fn as_str(self) -> &'static str {
        match self {
            InclusionState::Included => "included",
            InclusionState::Excluded => "excluded",
            InclusionState::Neutral => "neutral",
        }
    }
}

/// User-chosen context inclusion sets. Exclusion wins over inclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPreferencesState {
    #[serde(default)]
    pub included_paths: BTreeSet<PathBuf>,
    #[serde(default)]
    pub excluded_paths: BTreeSet<PathBuf>,
    #[serde(default)]
    pub last_focused_file_path: Option<PathBuf>,
}

impl ContextPreferencesState {
    /// Merge persisted state with in-memory state.
    ///
    /// Sets are unioned; the focused path prefers the persisted value. A path
    /// present in both merged sets stays excluded through [`Self::inclusion_for`].
    pub fn merged(persisted: &Self, in_memory: &Self) -> Self {
        Self {
            included_paths: persisted
                .included_paths
                .union(&in_memory.included_paths)
                .cloned()
                .collect(),
            excluded_paths: persisted
                .excluded_paths
                .union(&in_memory.excluded_paths)
                .cloned()
                .collect(),
            last_focused_file_path: persisted
                .last_focused_file_path
                .clone()
                .or_else(|| in_memory.last_focused_file_path.clone()),
        }
    }

    /// Apply a single inclusion toggle; the two sets stay disjoint for `path`.
    pub fn with_inclusion(&self, path: &Path, included: bool) -> Self {
        let mut next = self.clone();
        if included {
            next.excluded_paths.remove(path);
            next.included_paths.insert(path.to_path_buf());
        } else {
            next.included_paths.remove(path);
            next.excluded_paths.insert(path.to_path_buf());
        }
        next.last_focused_file_path = Some(path.to_path_buf());
        next
    }

    /// True if `path` or one of its ancestors is excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded_paths
            .iter()
            .any(|excluded| path.starts_with(excluded))
    }

    pub fn inclusion_for(&self, path: &Path) -> InclusionState {
        if self.excluded_paths.contains(path) {
            InclusionState::Excluded
        } else if self.included_paths.contains(path) {
            InclusionState::Included
        } else {
            InclusionState::Neutral
        }
    }
}

/// Persistence capability for one preference record type
#[async_trait]
pub trait PreferencesDriver<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Load the record for a workspace root; a missing record yields the default
    async fn load(&self, root: &Path) -> Result<T, StorageError>;

    async fn save(&self, value: &T, root: &Path) -> Result<(), StorageError>;
}

/// JSON-file preference store
///
/// Files live at `<base>/workspaces/<blake3(root)>/<file_name>`.
pub struct JsonPreferencesStore<T> {
    base_dir: PathBuf,
    file_name: &'static str,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonPreferencesStore<T> {
    pub fn new(base_dir: PathBuf, file_name: &'static str) -> Self {
        Self {
            base_dir,
            file_name,
            _record: PhantomData,
        }
    }

    /// Store rooted at the platform data directory (`$XDG_DATA_HOME/skein`)
    pub fn in_data_dir(file_name: &'static str) -> Result<Self, StorageError> {
        Ok(Self::new(crate::config::data_dir()?, file_name))
    }

    pub fn path_for(&self, root: &Path) -> PathBuf {
        workspace_state_dir(&self.base_dir, root).join(self.file_name)
    }
}

/// Per-workspace state directory under `base`
pub fn workspace_state_dir(base: &Path, root: &Path) -> PathBuf {
    let digest = compute_content_hash(root.to_string_lossy().as_bytes());
    base.join("workspaces").join(hex::encode(&digest[..16]))
}

#[async_trait]
impl<T> PreferencesDriver<T> for JsonPreferencesStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    async fn load(&self, root: &Path) -> Result<T, StorageError> {
        let path = self.path_for(root);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No stored preferences, using defaults");
                return Ok(T::default());
            }
            Err(e) => return Err(StorageError::IoError(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::Serialization(format!(
                "Failed to parse preferences {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn save(&self, value: &T, root: &Path) -> Result<(), StorageError> {
        let path = self.path_for(root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        // Write-then-rename so readers never observe a partial file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
