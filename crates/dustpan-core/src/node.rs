//! Size tree node types.
//!
//! These trees are transient: they are built by one aggregation, handed to
//! the caller and dropped. Only directory totals are ever persisted.

use std::fmt;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::EntryError;
use crate::identity::FileIdentity;
use crate::path::PathKey;

/// Directory modification time, in nanoseconds since the Unix epoch.
///
/// Signed so that pre-epoch timestamps survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirMtime(pub i64);

impl DirMtime {
    /// Convert a system time, saturating at the `i64` range.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self(i64::try_from(after.as_nanos()).unwrap_or(i64::MAX)),
            Err(before) => Self(
                i64::try_from(before.duration().as_nanos())
                    .map(|n| -n)
                    .unwrap_or(i64::MIN),
            ),
        }
    }

    /// Modification time of an entry, if the platform reports one.
    pub fn of(meta: &Metadata) -> Option<Self> {
        meta.modified().ok().map(Self::from_system_time)
    }

    /// Nanoseconds since the epoch.
    pub fn as_nanos(self) -> i64 {
        self.0
    }
}

/// Kind of entry in a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    /// Sockets, FIFOs, devices.
    Other,
    /// The entry could not be inspected.
    Error,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Dir => write!(f, "dir"),
            Self::Symlink => write!(f, "symlink"),
            Self::Other => write!(f, "other"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A regular file found during aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLeaf {
    pub key: PathKey,
    pub name: CompactString,
    /// Apparent size in bytes.
    pub size: u64,
    pub identity: FileIdentity,
    pub link_count: u64,
    /// False when this file's identity was already counted elsewhere in the
    /// same aggregation.
    pub counted: bool,
}

impl FileLeaf {
    /// Bytes this leaf adds to its parent's total.
    pub fn counted_size(&self) -> u64 {
        if self.counted { self.size } else { 0 }
    }
}

/// A directory with its aggregated size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirNode {
    pub key: PathKey,
    pub name: CompactString,
    /// Total bytes of every regular file below this directory, each storage
    /// identity counted once.
    pub total_size: u64,
    /// Direct children, when retained.
    pub children: Vec<Node>,
    /// A scan for this node is in flight, or was cancelled.
    pub partial: bool,
    /// Some child could not be measured; the true size may be larger.
    pub lower_bound: bool,
    /// The total came from the cache and no listing was done.
    pub from_cache: bool,
    /// Modification time observed before listing.
    pub modified: Option<DirMtime>,
    /// Regular files in this subtree.
    pub file_count: u64,
    /// Directories in this subtree, excluding this one.
    pub dir_count: u64,
}

impl DirNode {
    /// Create an empty directory node.
    pub fn new(key: PathKey) -> Self {
        Self {
            name: key.name(),
            key,
            total_size: 0,
            children: Vec::new(),
            partial: false,
            lower_bound: false,
            from_cache: false,
            modified: None,
            file_count: 0,
            dir_count: 0,
        }
    }

    /// Whether the total is final and complete.
    pub fn is_exact(&self) -> bool {
        !self.partial && !self.lower_bound
    }

    /// Get the number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Sort children by size in descending order, recursively.
    pub fn sort_children_by_size(&mut self) {
        self.children.sort_by(|a, b| b.size().cmp(&a.size()).then_with(|| a.name().cmp(b.name())));
        for child in &mut self.children {
            if let Node::Directory(dir) = child {
                dir.sort_children_by_size();
            }
        }
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name() == name)
    }
}

/// One node in a size tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Directory(DirNode),
    File(FileLeaf),
    /// Never followed; contributes 0 bytes.
    Symlink {
        key: PathKey,
        name: CompactString,
        target: CompactString,
    },
    /// Socket, FIFO or device; contributes 0 bytes.
    Special { key: PathKey, name: CompactString },
    Error(EntryError),
}

impl Node {
    /// Bytes this node contributes to its parent.
    pub fn size(&self) -> u64 {
        match self {
            Self::Directory(dir) => dir.total_size,
            Self::File(leaf) => leaf.counted_size(),
            Self::Symlink { .. } | Self::Special { .. } | Self::Error(_) => 0,
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        match self {
            Self::Directory(dir) => &dir.name,
            Self::File(leaf) => &leaf.name,
            Self::Symlink { name, .. } | Self::Special { name, .. } => name,
            Self::Error(err) => err
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(""),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Directory(_) => EntryKind::Dir,
            Self::File(_) => EntryKind::File,
            Self::Symlink { .. } => EntryKind::Symlink,
            Self::Special { .. } => EntryKind::Other,
            Self::Error(_) => EntryKind::Error,
        }
    }

    /// Path key, for every node except errors.
    pub fn key(&self) -> Option<&PathKey> {
        match self {
            Self::Directory(dir) => Some(&dir.key),
            Self::File(leaf) => Some(&leaf.key),
            Self::Symlink { key, .. } | Self::Special { key, .. } => Some(key),
            Self::Error(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            Self::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InodeInfo;
    use std::time::Duration;

    fn leaf(dir: &PathKey, name: &str, size: u64, counted: bool) -> Node {
        Node::File(FileLeaf {
            key: dir.join(name),
            name: name.into(),
            size,
            identity: FileIdentity::Inode(InodeInfo::new(size, 1)),
            link_count: 1,
            counted,
        })
    }

    #[test]
    fn test_mtime_keeps_nanoseconds_and_sign() {
        let after = UNIX_EPOCH + Duration::new(10, 7);
        assert_eq!(DirMtime::from_system_time(after).as_nanos(), 10_000_000_007);

        let before = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(DirMtime::from_system_time(before).as_nanos(), -1_000_000_000);
    }

    #[test]
    fn test_uncounted_leaf_contributes_nothing() {
        let dir = PathKey::normalize("/data").unwrap();
        assert_eq!(leaf(&dir, "a", 100, true).size(), 100);
        assert_eq!(leaf(&dir, "b", 100, false).size(), 0);
    }

    #[test]
    fn test_sort_children_by_size() {
        let key = PathKey::normalize("/data").unwrap();
        let mut dir = DirNode::new(key.clone());
        dir.children.push(leaf(&key, "small", 1, true));
        dir.children.push(leaf(&key, "big", 1000, true));
        dir.children.push(Node::Symlink {
            key: key.join("link"),
            name: "link".into(),
            target: "/elsewhere".into(),
        });
        dir.sort_children_by_size();

        let names: Vec<_> = dir.children.iter().map(Node::name).collect();
        assert_eq!(names, vec!["big", "small", "link"]);
        assert_eq!(dir.name.as_str(), "data");
        assert!(dir.is_exact());
    }
}
