//! Workspace Engine
//!
//! Opens a workspace, keeps its snapshot current through refreshes and watch
//! events, and applies selection and context-inclusion changes. Every commit
//! goes through the [`WorkspaceStateOwner`], which orders the update stream.
//!
//! Preference loads are best-effort and fall back to defaults. Preference
//! saves that back a user action (`select`, `set_context_inclusion`) must
//! succeed; the only exception is clearing a selection, which is persisted
//! opportunistically. Preference-writing operations run one at a time from
//! read through save to commit, so the persisted value is always the one the
//! snapshot holds.

use crate::error::EngineError;
use crate::fs::{
    FileSystemAccess, FileSystemWatching, LocalFileSystem, NotifyWatcher, WatchConfig,
};
use crate::tree::path::{canonicalize_path, standardize_path};
use crate::tree::projection::TreeProjection;
use crate::tree::walker::{walk_tree, WalkOutput};
use crate::workspace::preferences::{
    ContextPreferencesState, JsonPreferencesStore, PreferencesDriver, WorkspacePreferences,
};
use crate::workspace::snapshot::{PathIndex, Selection, WorkspaceSnapshot};
use crate::workspace::state::{
    OwnedState, UpdateNotice, UpdateStream, WatcherHandle, WorkspaceStateOwner,
};
use crate::workspace::watch::run_watch_loop;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// File names used by the bundled JSON preference stores
pub const WORKSPACE_PREFERENCES_FILE: &str = "preferences.json";
pub const CONTEXT_PREFERENCES_FILE: &str = "context_preferences.json";

/// Collaborators the engine consumes
#[derive(Clone)]
pub struct WorkspaceCollaborators {
    pub fs: Arc<dyn FileSystemAccess>,
    pub watcher: Arc<dyn FileSystemWatching>,
    pub preferences: Arc<dyn PreferencesDriver<WorkspacePreferences>>,
    pub context_preferences: Arc<dyn PreferencesDriver<ContextPreferencesState>>,
}

impl WorkspaceCollaborators {
    /// Disk-backed collaborators with preferences under the platform data dir
    pub fn local(watch: WatchConfig) -> Result<Self, EngineError> {
        Ok(Self {
            fs: Arc::new(LocalFileSystem::new()),
            watcher: Arc::new(NotifyWatcher::new(watch)),
            preferences: Arc::new(
                JsonPreferencesStore::in_data_dir(WORKSPACE_PREFERENCES_FILE)
                    .map_err(|e| EngineError::ConfigError(e.to_string()))?,
            ),
            context_preferences: Arc::new(
                JsonPreferencesStore::in_data_dir(CONTEXT_PREFERENCES_FILE)
                    .map_err(|e| EngineError::ConfigError(e.to_string()))?,
            ),
        })
    }
}

pub(crate) struct EngineInner {
    collaborators: WorkspaceCollaborators,
    pub(crate) owner: WorkspaceStateOwner,
    /// Serializes compute, save and commit for preference-writing operations
    writes: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a workspace engine; clones share one state owner
#[derive(Clone)]
pub struct WorkspaceEngine {
    inner: Arc<EngineInner>,
}

impl WorkspaceEngine {
    pub fn new(collaborators: WorkspaceCollaborators) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                collaborators,
                owner: WorkspaceStateOwner::new(),
                writes: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open (or reopen) a workspace rooted at `root`
    #[instrument(skip(self), fields(root = %root.display()))]
    pub async fn open_workspace(&self, root: &Path) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        let snapshot = self.inner.open(root).await?;
        if let Some(root) = snapshot.root_path.as_deref() {
            self.start_watching(root).await;
        }
        Ok(snapshot)
    }

    /// Re-walk the open workspace
    pub async fn refresh(&self) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        self.inner.refresh(&CancellationToken::new()).await
    }

    /// Re-walk the open workspace, abandoning the walk when `cancel` fires
    pub async fn refresh_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        self.inner.refresh(cancel).await
    }

    /// Select a path, or clear the selection with `None`
    #[instrument(skip(self))]
    pub async fn select(&self, path: Option<&Path>) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        match path {
            None => self.inner.clear_selection().await,
            Some(path) => self.inner.select_path(path).await,
        }
    }

    /// Include or exclude a path from AI context
    #[instrument(skip(self))]
    pub async fn set_context_inclusion(
        &self,
        path: &Path,
        included: bool,
    ) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        self.inner.set_context_inclusion(path, included).await
    }

    /// Reconcile persisted context preferences into the current snapshot
    pub async fn context_preferences(&self) -> Result<ContextPreferencesState, EngineError> {
        self.inner.reconcile_context_preferences().await
    }

    pub fn current_snapshot(&self) -> Arc<WorkspaceSnapshot> {
        self.inner.owner.current_snapshot()
    }

    pub fn tree_projection(&self) -> Arc<TreeProjection> {
        self.inner.owner.current().projection
    }

    /// Ordered stream of committed snapshots
    pub fn subscribe(&self) -> UpdateStream {
        self.inner.owner.subscribe()
    }

    /// Stop watching, cancel in-flight walks and end update streams
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Shutting down workspace engine");
        }
        self.inner.shutdown.cancel();
        self.inner.owner.close();
    }

    async fn start_watching(&self, root: &Path) {
        match self.inner.collaborators.watcher.watch(root).await {
            Ok(events) => {
                let cancel = self.inner.shutdown.child_token();
                let task = tokio::spawn(run_watch_loop(
                    Arc::downgrade(&self.inner),
                    events,
                    cancel.clone(),
                ));
                self.inner
                    .owner
                    .replace_watcher(WatcherHandle::new(cancel, task));
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to start watching workspace");
                self.inner.owner.cancel_watcher();
                self.inner
                    .owner
                    .publish_notice(UpdateNotice::WatcherUnavailable);
            }
        }
    }
}

impl EngineInner {
    async fn open(&self, root: &Path) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        if root.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(EngineError::InvalidWorkspace(
                "Workspace path is empty".to_string(),
            ));
        }
        let canonical =
            canonicalize_path(root).map_err(|e| EngineError::InvalidWorkspace(e.to_string()))?;

        let preferences = self.load_workspace_preferences(&canonical).await;
        let context_preferences = self.load_context_preferences(&canonical).await;

        let cancel = self.shutdown.child_token();
        let WalkOutput {
            root_id,
            descriptors,
            paths,
        } = walk_tree(
            self.collaborators.fs.as_ref(),
            &canonical,
            &context_preferences.excluded_paths,
            &cancel,
        )
        .await?;
        let root_path = descriptors
            .get(&root_id)
            .map(|d| d.canonical_path.clone())
            .unwrap_or(canonical);

        let selection = preferences
            .last_selection
            .map(|path| standardize_path(&path))
            .and_then(|path| paths.get(&path).map(|id| Selection::of(path, *id)))
            .unwrap_or_default();
        if selection.selected_path.is_some() {
            debug!(path = ?selection.selected_path, "Restored last selection");
        }

        let snapshot = WorkspaceSnapshot::build(
            Some(root_path.clone()),
            selection,
            context_preferences,
            descriptors.values().cloned(),
        );
        let snapshot = self
            .owner
            .replace(OwnedState::new(snapshot, descriptors, paths));

        info!(
            root = %root_path.display(),
            descriptor_count = snapshot.descriptors.len(),
            snapshot_hash = %snapshot.snapshot_hash,
            "Opened workspace"
        );
        Ok(snapshot)
    }

    pub(crate) async fn refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        let current = self.owner.current_snapshot();
        let root = current
            .root_path
            .clone()
            .ok_or(EngineError::WorkspaceNotOpened)?;

        let persisted = self.load_context_preferences(&root).await;
        let merged = ContextPreferencesState::merged(&persisted, &current.context_preferences);

        let output = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(EngineError::Cancelled),
            result = walk_tree(
                self.collaborators.fs.as_ref(),
                &root,
                &merged.excluded_paths,
                cancel,
            ) => result?,
        };
        let WalkOutput {
            descriptors, paths, ..
        } = output;

        let (snapshot, reset_selection) = self.owner.update(|latest| {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if latest.snapshot.root_path.as_deref() != Some(root.as_path()) {
                debug!("Workspace changed during refresh, discarding walk");
                return Err(EngineError::Cancelled);
            }
            let preferences =
                ContextPreferencesState::merged(&persisted, &latest.snapshot.context_preferences);
            let (selection, reset) = carry_selection(&latest.snapshot, &paths);
            let snapshot = WorkspaceSnapshot::build(
                Some(root.clone()),
                selection,
                preferences,
                descriptors.values().cloned(),
            );
            Ok((OwnedState::new(snapshot, descriptors, paths), reset))
        })?;

        debug!(
            descriptor_count = snapshot.descriptors.len(),
            snapshot_hash = %snapshot.snapshot_hash,
            selection_cleared = reset_selection,
            "Refreshed workspace"
        );

        if reset_selection {
            let _writes = self.writes.lock().await;
            if self.owner.current_snapshot().selected_path.is_none() {
                self.save_workspace_preferences(&WorkspacePreferences::default(), &root)
                    .await?;
            }
        }
        Ok(snapshot)
    }

    async fn clear_selection(&self) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        let _writes = self.writes.lock().await;
        let (snapshot, root) = self.owner.update(|latest| {
            let snapshot = latest.snapshot.with_state(
                Selection::cleared(),
                latest.snapshot.context_preferences.clone(),
            );
            let root = latest.snapshot.root_path.clone();
            Ok::<_, EngineError>((
                OwnedState::from_parts(
                    snapshot,
                    Arc::clone(&latest.descriptors),
                    Arc::clone(&latest.paths),
                ),
                root,
            ))
        })?;

        if let Some(root) = root {
            if let Err(e) = self
                .collaborators
                .preferences
                .save(&WorkspacePreferences::default(), &root)
                .await
            {
                warn!(error = %e, "Failed to persist cleared selection");
            }
        }
        Ok(snapshot)
    }

    async fn select_path(&self, path: &Path) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        let _writes = self.writes.lock().await;
        let current = self.owner.current();
        let root = current
            .snapshot
            .root_path
            .clone()
            .ok_or(EngineError::WorkspaceNotOpened)?;
        let path = resolve_input_path(&root, path);
        if !current.paths.contains_key(&path) {
            return Err(EngineError::InvalidSelection(path));
        }

        self.save_workspace_preferences(
            &WorkspacePreferences {
                last_selection: Some(path.clone()),
            },
            &root,
        )
        .await?;

        let (snapshot, ()) = self.owner.update(|latest| {
            let id = *latest
                .paths
                .get(&path)
                .ok_or_else(|| EngineError::InvalidSelection(path.clone()))?;
            let snapshot = latest.snapshot.with_state(
                Selection::of(path.clone(), id),
                latest.snapshot.context_preferences.clone(),
            );
            Ok::<_, EngineError>((
                OwnedState::from_parts(
                    snapshot,
                    Arc::clone(&latest.descriptors),
                    Arc::clone(&latest.paths),
                ),
                (),
            ))
        })?;
        debug!(path = %path.display(), "Selected path");
        Ok(snapshot)
    }

    async fn set_context_inclusion(
        &self,
        path: &Path,
        included: bool,
    ) -> Result<Arc<WorkspaceSnapshot>, EngineError> {
        let _writes = self.writes.lock().await;
        let current = self.owner.current_snapshot();
        let root = current
            .root_path
            .clone()
            .ok_or(EngineError::WorkspaceNotOpened)?;
        let path = resolve_input_path(&root, path);

        let preferences = current.context_preferences.with_inclusion(&path, included);
        self.collaborators
            .context_preferences
            .save(&preferences, &root)
            .await
            .map_err(EngineError::persistence)?;

        let (snapshot, cleared_selection) = self.owner.update(|latest| {
            let preferences = latest
                .snapshot
                .context_preferences
                .with_inclusion(&path, included);
            let clears_selection = !included
                && latest
                    .snapshot
                    .selected_path
                    .as_deref()
                    .is_some_and(|selected| selected.starts_with(&path));
            let selection = if clears_selection {
                Selection::cleared()
            } else {
                latest.snapshot.selection()
            };
            let snapshot = latest.snapshot.with_state(selection, preferences);
            Ok::<_, EngineError>((
                OwnedState::from_parts(
                    snapshot,
                    Arc::clone(&latest.descriptors),
                    Arc::clone(&latest.paths),
                ),
                clears_selection,
            ))
        })?;

        debug!(
            path = %path.display(),
            included,
            cleared_selection,
            "Updated context inclusion"
        );

        if cleared_selection {
            self.save_workspace_preferences(&WorkspacePreferences::default(), &root)
                .await?;
        }
        Ok(snapshot)
    }

    async fn reconcile_context_preferences(&self) -> Result<ContextPreferencesState, EngineError> {
        let root = self
            .owner
            .current_snapshot()
            .root_path
            .clone()
            .ok_or(EngineError::WorkspaceNotOpened)?;
        let persisted = self.load_context_preferences(&root).await;

        let (snapshot, ()) = self.owner.update(|latest| {
            let merged =
                ContextPreferencesState::merged(&persisted, &latest.snapshot.context_preferences);
            let snapshot = latest.snapshot.with_state(latest.snapshot.selection(), merged);
            Ok::<_, EngineError>((
                OwnedState::from_parts(
                    snapshot,
                    Arc::clone(&latest.descriptors),
                    Arc::clone(&latest.paths),
                ),
                (),
            ))
        })?;
        Ok(snapshot.context_preferences.clone())
    }

    async fn load_workspace_preferences(&self, root: &Path) -> WorkspacePreferences {
        match self.collaborators.preferences.load(root).await {
            Ok(preferences) => preferences,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to load workspace preferences, using defaults");
                WorkspacePreferences::default()
            }
        }
    }

    async fn load_context_preferences(&self, root: &Path) -> ContextPreferencesState {
        match self.collaborators.context_preferences.load(root).await {
            Ok(preferences) => preferences,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to load context preferences, using defaults");
                ContextPreferencesState::default()
            }
        }
    }

    async fn save_workspace_preferences(
        &self,
        preferences: &WorkspacePreferences,
        root: &Path,
    ) -> Result<(), EngineError> {
        self.collaborators
            .preferences
            .save(preferences, root)
            .await
            .map_err(EngineError::persistence)
    }
}

/// Keep the selection if its path survived the walk, re-resolving its id
fn carry_selection(previous: &WorkspaceSnapshot, paths: &PathIndex) -> (Selection, bool) {
    match previous.selected_path.as_ref() {
        None => (previous.selection(), false),
        Some(path) => match paths.get(path) {
            Some(id) => (
                Selection {
                    selected_descriptor_id: Some(*id),
                    ..previous.selection()
                },
                false,
            ),
            None => (Selection::cleared(), true),
        },
    }
}

/// Relative paths are taken relative to the workspace root
fn resolve_input_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        standardize_path(path)
    } else {
        standardize_path(&root.join(path))
    }
}
