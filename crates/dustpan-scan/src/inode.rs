//! Identity tracking for hardlink deduplication.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use dustpan_core::FileIdentity;

/// Multi-link file identities counted within one subtree, with their sizes.
///
/// Each directory of a walk owns one set. When a subdirectory finishes, its
/// set is merged into the parent's and any identity both already held is
/// subtracted once, so every identity contributes exactly once per subtree
/// no matter the order entries are visited in.
///
/// Files with a single link never enter the set.
#[derive(Debug, Default)]
pub struct SeenIdentities {
    seen: HashMap<FileIdentity, u64>,
}

impl SeenIdentities {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an identity. Returns `true` if this is the first time seeing it.
    ///
    /// If the identity was already tracked, returns `false` indicating this
    /// is a hardlink to an already-counted file.
    pub fn track(&mut self, identity: FileIdentity, size: u64) -> bool {
        match self.seen.entry(identity) {
            Entry::Vacant(slot) => {
                slot.insert(size);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Fold a finished child subtree's set into this one.
    ///
    /// Returns the bytes the child counted for identities this set already
    /// held; the caller subtracts them from the child's total.
    pub fn merge_child(&mut self, child: SeenIdentities) -> u64 {
        let mut overlap = 0;
        for (identity, size) in child.seen {
            match self.seen.entry(identity) {
                Entry::Vacant(slot) => {
                    slot.insert(size);
                }
                Entry::Occupied(_) => overlap += size,
            }
        }
        overlap
    }

    /// Check if an identity has been seen (without tracking).
    pub fn has_seen(&self, identity: &FileIdentity) -> bool {
        self.seen.contains_key(identity)
    }

    /// Get the number of unique identities tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if no identities have been tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dustpan_core::InodeInfo;

    fn inode(ino: u64, dev: u64) -> FileIdentity {
        FileIdentity::Inode(InodeInfo::new(ino, dev))
    }

    #[test]
    fn test_track_new_identity() {
        let mut seen = SeenIdentities::new();

        assert!(seen.track(inode(12345, 1), 10));
        assert!(!seen.track(inode(12345, 1), 10)); // Second time returns false
        assert!(seen.has_seen(&inode(12345, 1)));
    }

    #[test]
    fn test_different_devices() {
        let mut seen = SeenIdentities::new();

        assert!(seen.track(inode(12345, 1), 10));
        assert!(seen.track(inode(12345, 2), 10)); // Different device, so it's new
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_merge_reports_overlap_once() {
        let mut parent = SeenIdentities::new();
        parent.track(inode(1, 1), 100);

        let mut left = SeenIdentities::new();
        left.track(inode(1, 1), 100);
        left.track(inode(2, 1), 30);

        let mut right = SeenIdentities::new();
        right.track(inode(2, 1), 30);

        assert_eq!(parent.merge_child(left), 100);
        assert_eq!(parent.merge_child(right), 30);
        assert_eq!(parent.len(), 2);
    }
}
