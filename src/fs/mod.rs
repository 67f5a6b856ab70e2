//! Filesystem collaborators consumed by the engines
//!
//! The engines only see these traits. [`local`] provides disk-backed
//! implementations and [`watch`] a `notify`-backed watcher.

use crate::error::StorageError;
use crate::types::{FileDescriptor, FileId, FileMetadata};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub mod local;
pub mod watch;

pub use local::{LocalContentLoader, LocalFileSystem};
pub use watch::{NotifyWatcher, WatchConfig};

/// Tree access by stable id
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Resolve the root directory to its id
    async fn resolve_root(&self, path: &Path) -> Result<FileId, StorageError>;

    /// Direct children of a directory. Returned directory descriptors may carry
    /// empty `children`; the walker fills them in.
    async fn list_children(&self, id: FileId) -> Result<Vec<FileDescriptor>, StorageError>;

    async fn metadata(&self, id: FileId) -> Result<FileMetadata, StorageError>;
}

/// File contents for context attachments
#[async_trait]
pub trait FileContentLoading: Send + Sync {
    async fn load(&self, path: &Path) -> Result<String, StorageError>;
}

/// Filesystem change event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl ChangeEvent {
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Removed(p) => p,
            ChangeEvent::Renamed { to, .. } => to,
        }
    }
}

/// Watch source. The returned channel is ordered and closes when watching
/// can no longer continue (root removed, backend failure).
#[async_trait]
pub trait FileSystemWatching: Send + Sync {
    async fn watch(&self, root: &Path) -> Result<mpsc::Receiver<ChangeEvent>, StorageError>;
}
