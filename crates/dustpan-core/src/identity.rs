//! Storage identity of files, for hard-link deduplication.

use std::fmt;
use std::fs::Metadata;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::path::PathKey;

/// Inode information for hardlink detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeInfo {
    /// Inode number.
    pub inode: u64,
    /// Device ID.
    pub device: u64,
}

impl InodeInfo {
    /// Create new inode info.
    pub fn new(inode: u64, device: u64) -> Self {
        Self { inode, device }
    }
}

/// What makes two paths "the same file" for counting purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileIdentity {
    /// Device and inode pair.
    Inode(InodeInfo),
    /// Path only; hard links are indistinguishable in this mode.
    Path(PathKey),
}

/// How file identity is resolved on this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityMode {
    /// The filesystem exposes inode identity; hard links are counted once.
    Inode,
    /// Reduced accuracy: hard-linked files may be double-counted.
    PathOnly,
}

static REDUCED_ACCURACY_LOGGED: AtomicBool = AtomicBool::new(false);

impl IdentityMode {
    /// Stat `dir` and decide which identity mode this system supports.
    ///
    /// Falls back to [`IdentityMode::PathOnly`] when `dir` cannot be
    /// stat'ed or reports no inode number.
    pub fn detect(dir: &Path) -> Self {
        let mode = match std::fs::symlink_metadata(dir) {
            Ok(meta) if inode_of(&meta).is_some() => Self::Inode,
            Ok(_) => Self::PathOnly,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "identity check failed");
                Self::PathOnly
            }
        };

        if mode == Self::PathOnly && !REDUCED_ACCURACY_LOGGED.swap(true, Ordering::Relaxed) {
            warn!("inode identity unavailable; hard-linked files may be double-counted");
        }
        mode
    }

    /// Whether hard links are deduplicated in this mode.
    pub fn dedups_hard_links(self) -> bool {
        self == Self::Inode
    }
}

impl fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode => write!(f, "inode"),
            Self::PathOnly => write!(f, "path-only"),
        }
    }
}

/// Resolve the identity of `key` without following symlinks.
pub fn identity_of(mode: IdentityMode, key: &PathKey) -> Result<FileIdentity, ScanError> {
    let meta = std::fs::symlink_metadata(key.as_path()).map_err(|e| ScanError::io(key.as_path(), e))?;
    Ok(identity_from_metadata(mode, key, &meta))
}

/// Identity of an entry whose metadata is already at hand.
pub fn identity_from_metadata(mode: IdentityMode, key: &PathKey, meta: &Metadata) -> FileIdentity {
    match (mode, inode_of(meta)) {
        (IdentityMode::Inode, Some(info)) => FileIdentity::Inode(info),
        _ => FileIdentity::Path(key.clone()),
    }
}

/// Inode and device of an entry, where the platform exposes them.
#[cfg(unix)]
pub fn inode_of(meta: &Metadata) -> Option<InodeInfo> {
    match meta.ino() {
        0 => None,
        ino => Some(InodeInfo::new(ino, meta.dev())),
    }
}

#[cfg(not(unix))]
pub fn inode_of(_meta: &Metadata) -> Option<InodeInfo> {
    None
}

/// Device ID of an entry, for filesystem boundary checks.
#[cfg(unix)]
pub fn device_of(meta: &Metadata) -> Option<u64> {
    Some(meta.dev())
}

#[cfg(not(unix))]
pub fn device_of(_meta: &Metadata) -> Option<u64> {
    None
}

/// Number of hard links to an entry (1 where unavailable).
#[cfg(unix)]
pub fn link_count(meta: &Metadata) -> u64 {
    meta.nlink()
}

#[cfg(not(unix))]
pub fn link_count(_meta: &Metadata) -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_info() {
        let a = InodeInfo::new(12345, 1);
        let b = InodeInfo::new(12345, 2);
        assert_ne!(a, b);
        assert_eq!(a, InodeInfo::new(12345, 1));
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_inode_mode_on_unix() {
        let temp = tempfile::TempDir::new().unwrap();
        assert_eq!(IdentityMode::detect(temp.path()), IdentityMode::Inode);
    }

    #[test]
    fn test_missing_dir_falls_back_to_path_only() {
        let temp = tempfile::TempDir::new().unwrap();
        let mode = IdentityMode::detect(&temp.path().join("missing"));
        assert_eq!(mode, IdentityMode::PathOnly);
        assert!(!mode.dedups_hard_links());
    }

    #[cfg(unix)]
    #[test]
    fn test_hard_links_share_identity() {
        let temp = tempfile::TempDir::new().unwrap();
        let original = temp.path().join("original");
        let link = temp.path().join("link");
        std::fs::write(&original, b"data").unwrap();
        std::fs::hard_link(&original, &link).unwrap();

        let a = identity_of(IdentityMode::Inode, &PathKey::normalize(&original).unwrap()).unwrap();
        let b = identity_of(IdentityMode::Inode, &PathKey::normalize(&link).unwrap()).unwrap();
        assert_eq!(a, b);

        let a = identity_of(IdentityMode::PathOnly, &PathKey::normalize(&original).unwrap()).unwrap();
        let b = identity_of(IdentityMode::PathOnly, &PathKey::normalize(&link).unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_of_missing_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let key = PathKey::normalize(temp.path().join("gone")).unwrap();
        assert!(matches!(
            identity_of(IdentityMode::Inode, &key),
            Err(ScanError::NotFound { .. })
        ));
    }
}
