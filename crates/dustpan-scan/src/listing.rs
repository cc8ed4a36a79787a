//! Shallow directory listings.

use std::cmp::Ordering;
use std::fs;
use std::sync::Arc;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use dustpan_cache::CacheStore;
use dustpan_core::{
    DirMtime, EntryError, EntryKind, FileIdentity, IdentityMode, PathKey, ScanError, device_of,
    identity_from_metadata, link_count,
};

/// One immediate child of a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: CompactString,
    pub key: PathKey,
    pub kind: EntryKind,
    /// Files: apparent size. Directories: cached total, when fresh.
    pub size: Option<u64>,
    pub identity: Option<FileIdentity>,
    pub link_count: u64,
    pub modified: Option<DirMtime>,
    /// Device the entry lives on, where the platform reports one.
    pub device: Option<u64>,
    /// Set when `kind` is [`EntryKind::Error`].
    pub error: Option<EntryError>,
}

impl ListingEntry {
    fn failed(key: PathKey, name: CompactString, error: EntryError) -> Self {
        Self {
            name,
            key,
            kind: EntryKind::Error,
            size: None,
            identity: None,
            link_count: 0,
            modified: None,
            device: None,
            error: Some(error),
        }
    }
}

/// Order for listing entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Case-insensitive name, ties broken case-sensitively.
    #[default]
    Name,
    /// Largest first; unknown sizes last.
    SizeDesc,
}

/// Produces the immediate children of a directory.
#[derive(Debug, Clone)]
pub struct Lister {
    mode: IdentityMode,
    store: Option<Arc<CacheStore>>,
}

impl Lister {
    /// Create a lister without a cache.
    pub fn new(mode: IdentityMode) -> Self {
        Self { mode, store: None }
    }

    /// Attach a cache store so directories show their cached totals.
    pub fn with_cache(mut self, store: Arc<CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// List the children of `dir`, sorted by name.
    ///
    /// Failing to open `dir` is an error; a failing child is reported inline
    /// with [`EntryKind::Error`].
    pub fn list_children(&self, dir: &PathKey) -> Result<Vec<ListingEntry>, ScanError> {
        let mut entries = read_children(dir, self.mode)?;

        if let Some(store) = &self.store {
            for entry in entries.iter_mut().filter(|e| e.kind == EntryKind::Dir) {
                if let Some(mtime) = entry.modified {
                    entry.size = store.get_fresh(&entry.key, mtime).map(|c| c.size_bytes);
                }
            }
        }

        sort_entries(&mut entries, SortOrder::Name);
        Ok(entries)
    }
}

/// Read the immediate children of `dir` without consulting any cache.
///
/// Entries come back in the order the OS yields them.
pub(crate) fn read_children(dir: &PathKey, mode: IdentityMode) -> Result<Vec<ListingEntry>, ScanError> {
    let read_dir = fs::read_dir(dir.as_path()).map_err(|e| ScanError::io(dir.as_path(), e))?;

    let mut entries = Vec::new();
    for item in read_dir {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                debug!(dir = %dir, error = %e, "directory iteration failed");
                entries.push(ListingEntry::failed(
                    dir.clone(),
                    CompactString::default(),
                    EntryError::read_error(dir.as_path(), &e),
                ));
                continue;
            }
        };

        let file_name = item.file_name();
        let name = CompactString::new(file_name.to_string_lossy());
        let key = dir.join(&file_name);

        // `DirEntry::metadata` does not follow symlinks.
        let meta = match item.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %key, error = %e, "cannot stat entry");
                let error = EntryError::from_io(key.as_path(), &e);
                entries.push(ListingEntry::failed(key, name, error));
                continue;
            }
        };

        let file_type = meta.file_type();
        let (kind, size) = if file_type.is_dir() {
            (EntryKind::Dir, None)
        } else if file_type.is_file() {
            (EntryKind::File, Some(meta.len()))
        } else if file_type.is_symlink() {
            (EntryKind::Symlink, None)
        } else {
            (EntryKind::Other, None)
        };

        let identity = matches!(kind, EntryKind::File | EntryKind::Dir)
            .then(|| identity_from_metadata(mode, &key, &meta));

        entries.push(ListingEntry {
            name,
            kind,
            size,
            identity,
            link_count: link_count(&meta),
            modified: DirMtime::of(&meta),
            device: device_of(&meta),
            error: None,
            key,
        });
    }

    Ok(entries)
}

/// Sort entries in place.
pub fn sort_entries(entries: &mut [ListingEntry], order: SortOrder) {
    match order {
        SortOrder::Name => entries.sort_by(name_order),
        SortOrder::SizeDesc => entries.sort_by(|a, b| match (a.size, b.size) {
            (Some(x), Some(y)) => y.cmp(&x).then_with(|| name_order(a, b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => name_order(a, b),
        }),
    }
}

fn name_order(a: &ListingEntry, b: &ListingEntry) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.name.cmp(&b.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dustpan_cache::SizeEntry;
    use tempfile::TempDir;

    fn names(entries: &[ListingEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_lists_files_with_sizes_and_dirs_without() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), vec![0u8; 100]).unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("sub/b.txt"), vec![0u8; 50]).unwrap();

        let dir = PathKey::normalize(temp.path()).unwrap();
        let entries = Lister::new(IdentityMode::PathOnly).list_children(&dir).unwrap();

        assert_eq!(names(&entries), vec!["a.txt", "sub"]);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, Some(100));
        assert_eq!(entries[1].kind, EntryKind::Dir);
        assert_eq!(entries[1].size, None);
    }

    #[test]
    fn test_fresh_cache_entry_fills_directory_size() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let store = Arc::new(CacheStore::open(temp.path().join("cache.db")).unwrap());
        let sub_key = PathKey::normalize(&sub).unwrap();
        let mtime = DirMtime::of(&fs::metadata(&sub).unwrap()).unwrap();
        store.put(&SizeEntry::new(sub_key, 4242, mtime));

        let dir = PathKey::normalize(temp.path()).unwrap();
        let entries = Lister::new(IdentityMode::PathOnly)
            .with_cache(store)
            .list_children(&dir)
            .unwrap();
        let sub_entry = entries.iter().find(|e| e.name.as_str() == "sub").unwrap();
        assert_eq!(sub_entry.size, Some(4242));
    }

    #[test]
    fn test_name_order_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        for name in ["beta", "Alpha", "gamma"] {
            fs::write(temp.path().join(name), b"x").unwrap();
        }

        let dir = PathKey::normalize(temp.path()).unwrap();
        let entries = Lister::new(IdentityMode::PathOnly).list_children(&dir).unwrap();
        assert_eq!(names(&entries), vec!["Alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_size_order_puts_unknown_last() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("small"), vec![0u8; 1]).unwrap();
        fs::write(temp.path().join("large"), vec![0u8; 10]).unwrap();
        fs::create_dir(temp.path().join("dir")).unwrap();

        let dir = PathKey::normalize(temp.path()).unwrap();
        let mut entries = Lister::new(IdentityMode::PathOnly).list_children(&dir).unwrap();
        sort_entries(&mut entries, SortOrder::SizeDesc);
        assert_eq!(names(&entries), vec!["large", "small", "dir"]);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let temp = TempDir::new().unwrap();
        let dir = PathKey::normalize(temp.path().join("missing")).unwrap();
        assert!(matches!(
            Lister::new(IdentityMode::PathOnly).list_children(&dir),
            Err(ScanError::NotFound { .. })
        ));
    }
}
