//! Cached size records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dustpan_core::{DirMtime, PathKey};

/// One persisted directory total.
///
/// Usable only while the directory's modification time still equals
/// `mtime` exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEntry {
    pub key: PathKey,
    pub size_bytes: u64,
    /// Directory modification time the total was computed against.
    pub mtime: DirMtime,
    pub computed_at: DateTime<Utc>,
    /// Regular files counted in the subtree.
    #[serde(default)]
    pub file_count: u64,
    /// Directories below the root of the subtree.
    #[serde(default)]
    pub dir_count: u64,
}

impl SizeEntry {
    /// Create an entry computed now.
    pub fn new(key: PathKey, size_bytes: u64, mtime: DirMtime) -> Self {
        Self {
            key,
            size_bytes,
            mtime,
            computed_at: Utc::now(),
            file_count: 0,
            dir_count: 0,
        }
    }

    /// Attach the subtree's file and directory counts.
    pub fn with_counts(mut self, file_count: u64, dir_count: u64) -> Self {
        self.file_count = file_count;
        self.dir_count = dir_count;
        self
    }

    /// Whether the entry still describes a directory whose current
    /// modification time is `current`.
    pub fn is_fresh(&self, current: DirMtime) -> bool {
        self.mtime == current
    }
}

/// SQLite stores integers as `i64`.
pub(crate) fn size_to_sql(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

pub(crate) fn size_from_sql(size: i64) -> u64 {
    u64::try_from(size).unwrap_or(0)
}

pub(crate) fn time_from_sql(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_requires_exact_mtime() {
        let key = PathKey::normalize("/data").unwrap();
        let entry = SizeEntry::new(key, 150, DirMtime(1_700_000_000_123_456_789));

        assert!(entry.is_fresh(DirMtime(1_700_000_000_123_456_789)));
        assert!(!entry.is_fresh(DirMtime(1_700_000_000_123_456_790)));
        assert!(!entry.is_fresh(DirMtime(1_700_000_000_000_000_000)));
    }

    #[test]
    fn test_sizes_clamp_at_sql_range() {
        assert_eq!(size_to_sql(u64::MAX), i64::MAX);
        assert_eq!(size_from_sql(-5), 0);
        assert_eq!(size_from_sql(size_to_sql(4096)), 4096);
    }
}
