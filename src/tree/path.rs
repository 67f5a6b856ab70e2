//! Path canonicalization and standardization

use crate::error::StorageError;
use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Canonicalize a path that exists on disk
///
/// Resolves symlinks, `..` and `.` through the filesystem, then applies the same
/// string normalization as [`standardize_path`].
pub fn canonicalize_path(path: &Path) -> Result<PathBuf, StorageError> {
    let canonical = dunce::canonicalize(path).map_err(|e| {
        StorageError::InvalidPath(format!(
            "Failed to canonicalize {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok(PathBuf::from(normalize_path_string(&canonical.to_string_lossy())))
}

/// Standardize a path without touching the filesystem
///
/// Removes `.` components, folds `..` against preceding normal components,
/// normalizes Unicode to NFC and strips trailing separators. Used for paths
/// coming from callers, which must match entries of the canonical path index.
pub fn standardize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    PathBuf::from(normalize_path_string(&out.to_string_lossy()))
}

/// Normalize a path string: NFC Unicode, no trailing separators (root kept)
pub fn normalize_path_string(path: &str) -> String {
    let mut result: String = path.nfc().collect();
    if result.len() > 1 {
        while result.len() > 1 && (result.ends_with('/') || result.ends_with('\\')) {
            result.pop();
        }
    }
    result
}

/// Case-insensitive path ordering with an exact-path tie-break
pub fn canonical_order(a: &Path, b: &Path) -> std::cmp::Ordering {
    let la = a.to_string_lossy().to_lowercase();
    let lb = b.to_string_lossy().to_lowercase();
    la.cmp(&lb).then_with(|| a.cmp(b))
}

/// Plain string ordering of full paths, so `/w/a-b` sorts before `/w/a/b`
pub fn lexicographic_order(a: &Path, b: &Path) -> std::cmp::Ordering {
    a.as_os_str().cmp(b.as_os_str())
}

/// True if `path` equals `ancestor` or lies beneath it
pub fn is_within(path: &Path, ancestor: &Path) -> bool {
    path.starts_with(ancestor)
}
