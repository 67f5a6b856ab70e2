//! Disk-backed filesystem collaborators

use crate::error::StorageError;
use crate::fs::{FileContentLoading, FileSystemAccess};
use crate::tree::hasher::compute_content_hash;
use crate::tree::path::{canonicalize_path, normalize_path_string};
use crate::types::{FileDescriptor, FileId, FileMetadata};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::{DirEntry, WalkDir};

/// Listing configuration
#[derive(Debug, Clone)]
pub struct LocalFsConfig {
    /// Whether to follow symbolic links (default: false for determinism)
    pub follow_symlinks: bool,
    /// Entry names to skip (e.g. ".git", "target")
    pub ignore_patterns: Vec<String>,
    /// Files larger than this are listed without a content hash
    pub max_hashed_bytes: u64,
}

impl Default for LocalFsConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            ignore_patterns: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
            max_hashed_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct IdRegistry {
    by_path: HashMap<PathBuf, FileId>,
    by_id: HashMap<FileId, PathBuf>,
}

impl IdRegistry {
    fn id_for(&mut self, path: &Path) -> FileId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }
        let id = FileId::new();
        self.by_path.insert(path.to_path_buf(), id);
        self.by_id.insert(id, path.to_path_buf());
        id
    }

    /// Forget every path under `dir` whose top-level entry is not in `listed`
    fn prune_below(&mut self, dir: &Path, listed: &HashSet<PathBuf>) -> usize {
        let stale: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|path| {
                let Ok(rest) = path.strip_prefix(dir) else {
                    return false;
                };
                match rest.components().next() {
                    Some(first) => !listed.contains(&dir.join(first)),
                    None => false,
                }
            })
            .cloned()
            .collect();
        for path in &stale {
            if let Some(id) = self.by_path.remove(path) {
                self.by_id.remove(&id);
            }
        }
        stale.len()
    }
}

/// Local filesystem access
///
/// Ids are assigned on first sight of a path and stay stable while the path
/// keeps showing up in listings. Listing a directory forgets entries that have
/// disappeared from it, along with everything registered beneath them.
pub struct LocalFileSystem {
    config: LocalFsConfig,
    registry: Arc<RwLock<IdRegistry>>,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::with_config(LocalFsConfig::default())
    }

    pub fn with_config(config: LocalFsConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(IdRegistry::default())),
        }
    }

    fn path_of(&self, id: FileId) -> Result<PathBuf, StorageError> {
        self.registry
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::UnknownFile(id.to_string()))
    }
}

impl Default for LocalFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn should_ignore(entry: &DirEntry, patterns: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| name == pattern.as_str())
}

fn list_directory(
    dir: &Path,
    config: &LocalFsConfig,
) -> Result<Vec<(PathBuf, bool, u64, Option<[u8; 32]>)>, StorageError> {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(config.follow_symlinks)
        .sort_by_file_name();

    let mut out = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to list {}: {}", dir.display(), e),
            ))
        })?;
        if should_ignore(&entry, &config.ignore_patterns) {
            trace!(path = %entry.path().display(), "Ignoring entry");
            continue;
        }

        let path = PathBuf::from(normalize_path_string(&entry.path().to_string_lossy()));
        let metadata = entry.metadata().map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to read metadata for {}: {}", path.display(), e),
            ))
        })?;

        if metadata.is_dir() {
            out.push((path, true, 0, None));
        } else if metadata.is_file() {
            let size = metadata.len();
            let hash = if size <= config.max_hashed_bytes {
                std::fs::read(entry.path())
                    .ok()
                    .map(|bytes| compute_content_hash(&bytes))
            } else {
                None
            };
            out.push((path, false, size, hash));
        }
        // Symlinks are skipped when not followed
    }
    Ok(out)
}

#[async_trait]
impl FileSystemAccess for LocalFileSystem {
    async fn resolve_root(&self, path: &Path) -> Result<FileId, StorageError> {
        let canonical = canonicalize_path(path)?;
        let metadata = tokio::fs::metadata(&canonical).await?;
        if !metadata.is_dir() {
            return Err(StorageError::InvalidPath(format!(
                "{} is not a directory",
                canonical.display()
            )));
        }
        Ok(self.registry.write().id_for(&canonical))
    }

    async fn list_children(&self, id: FileId) -> Result<Vec<FileDescriptor>, StorageError> {
        let dir = self.path_of(id)?;
        let config = self.config.clone();
        let listed = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || list_directory(&dir, &config))
                .await
                .map_err(|e| {
                    StorageError::IoError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("Listing task failed: {}", e),
                    ))
                })??
        };
        debug!(dir = %dir.display(), entries = listed.len(), "Listed directory");

        let mut registry = self.registry.write();
        let present: HashSet<PathBuf> = listed.iter().map(|(path, ..)| path.clone()).collect();
        let pruned = registry.prune_below(&dir, &present);
        if pruned > 0 {
            debug!(dir = %dir.display(), pruned, "Forgot ids of removed entries");
        }
        Ok(listed
            .into_iter()
            .map(|(path, is_dir, size, hash)| {
                let child_id = registry.id_for(&path);
                if is_dir {
                    FileDescriptor::directory(child_id, path)
                } else {
                    FileDescriptor::file(child_id, path, size, hash)
                }
            })
            .collect())
    }

    async fn metadata(&self, id: FileId) -> Result<FileMetadata, StorageError> {
        let path = self.path_of(id)?;
        let metadata = tokio::fs::metadata(&path).await?;
        Ok(FileMetadata {
            is_directory: metadata.is_dir(),
            byte_size: metadata.is_file().then(|| metadata.len()),
            path,
        })
    }
}

/// Reads file contents as UTF-8 (lossy)
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalContentLoader;

#[async_trait]
impl FileContentLoading for LocalContentLoader {
    async fn load(&self, path: &Path) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
