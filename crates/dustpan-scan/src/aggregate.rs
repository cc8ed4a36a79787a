//! Recursive size aggregation with cache consultation and hardlink dedup.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dustpan_cache::{CacheStore, SizeEntry};
use dustpan_core::{
    DirMtime, DirNode, EngineConfig, EntryError, EntryErrorKind, EntryKind, FileIdentity, FileLeaf,
    IdentityMode, Node, PathKey, ScanError, device_of, identity_from_metadata, link_count,
};

use crate::inode::SeenIdentities;
use crate::listing::{ListingEntry, read_children};
use crate::progress::{ProgressTracker, ScanProgress};

/// Final result of one aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeReport {
    pub root: Node,
    /// Every per-entry problem met during the walk, regardless of how much
    /// of the tree was retained.
    pub warnings: Vec<EntryError>,
    pub identity_mode: IdentityMode,
    pub progress: ScanProgress,
    pub duration: Duration,
}

impl SizeReport {
    /// Total bytes under the root.
    pub fn total_size(&self) -> u64 {
        self.root.size()
    }

    /// The root directory, unless the root was a file or other entry.
    pub fn root_dir(&self) -> Option<&DirNode> {
        self.root.as_dir()
    }

    /// Whether the walk was cut short by cancellation.
    pub fn is_partial(&self) -> bool {
        self.root_dir().is_some_and(|dir| dir.partial)
    }

    /// Whether the total is final and complete.
    pub fn is_exact(&self) -> bool {
        self.root_dir().is_none_or(DirNode::is_exact)
    }
}

/// One item produced by an [`AggregateStream`].
#[derive(Debug, Clone)]
pub enum AggregateStep {
    /// Running view of the root; always tagged `partial`.
    Partial(DirNode),
    /// The walk is over. Always the last item.
    Finished(SizeReport),
}

/// Snapshot of an aggregator's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    /// Aggregations started.
    pub walks: u64,
    /// Directories whose children were read from disk.
    pub dirs_listed: u64,
    /// Directories answered from the cache.
    pub cache_hits: u64,
    /// Cache records written.
    pub cache_writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    walks: AtomicU64,
    dirs_listed: AtomicU64,
    cache_hits: AtomicU64,
    cache_writes: AtomicU64,
}

/// Computes directory sizes.
///
/// Cheap to clone; clones share their counters and cache store.
#[derive(Debug, Clone)]
pub struct Aggregator {
    config: EngineConfig,
    mode: IdentityMode,
    store: Option<Arc<CacheStore>>,
    counters: Arc<Counters>,
}

impl Aggregator {
    /// Create an aggregator without a cache.
    pub fn new(config: &EngineConfig, mode: IdentityMode) -> Self {
        Self {
            config: config.clone(),
            mode,
            store: None,
            counters: Arc::default(),
        }
    }

    /// Consult and update `store` while walking.
    pub fn with_cache(mut self, store: Arc<CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identity_mode(&self) -> IdentityMode {
        self.mode
    }

    /// Lifetime counters shared by every clone.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            walks: self.counters.walks.load(Ordering::Relaxed),
            dirs_listed: self.counters.dirs_listed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_writes: self.counters.cache_writes.load(Ordering::Relaxed),
        }
    }

    /// Start a lazy walk of `root`.
    ///
    /// Nothing touches the filesystem until the stream is first polled.
    pub fn stream(&self, root: &PathKey, cancel: CancellationToken) -> AggregateStream {
        AggregateStream {
            walk: Walk::new(self.clone(), root.clone(), cancel),
            state: StreamState::Start,
        }
    }

    /// Walk `root` to completion and return the final report.
    pub fn aggregate(&self, root: &PathKey, cancel: CancellationToken) -> Result<SizeReport, ScanError> {
        for step in self.stream(root, cancel) {
            if let AggregateStep::Finished(report) = step? {
                return Ok(report);
            }
        }
        Err(ScanError::Other {
            message: "aggregation ended without a result".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Start,
    Walking,
    Done,
}

/// Iterator over the steps of one aggregation.
///
/// Yields any number of [`AggregateStep::Partial`] snapshots followed by
/// exactly one [`AggregateStep::Finished`], or a single `Err` when the root
/// itself cannot be measured.
pub struct AggregateStream {
    walk: Walk,
    state: StreamState,
}

impl AggregateStream {
    /// Publish progress on `tx` while walking.
    pub fn with_progress(mut self, tx: watch::Sender<ScanProgress>) -> Self {
        self.walk.progress_tx = Some(tx);
        self
    }
}

impl Iterator for AggregateStream {
    type Item = Result<AggregateStep, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                StreamState::Done => return None,
                StreamState::Start => {
                    self.state = StreamState::Walking;
                    match self.walk.begin() {
                        Err(e) => {
                            self.state = StreamState::Done;
                            return Some(Err(e));
                        }
                        Ok(Some(report)) => {
                            self.state = StreamState::Done;
                            return Some(Ok(AggregateStep::Finished(report)));
                        }
                        Ok(None) => {}
                    }
                }
                StreamState::Walking => {
                    if let Some(result) = self.walk.step() {
                        self.state = StreamState::Done;
                        return Some(result.map(AggregateStep::Finished));
                    }
                    if self.walk.snapshot_due() {
                        return Some(Ok(AggregateStep::Partial(self.walk.snapshot())));
                    }
                }
            }
        }
    }
}

/// A directory being walked.
struct Frame {
    dir: DirNode,
    entries: std::vec::IntoIter<ListingEntry>,
    seen: SeenIdentities,
    depth: u32,
    keep_children: bool,
}

struct Walk {
    aggregator: Aggregator,
    root: PathKey,
    cancel: CancellationToken,
    stack: Vec<Frame>,
    warnings: Vec<EntryError>,
    records: Vec<SizeEntry>,
    tracker: ProgressTracker,
    progress_tx: Option<watch::Sender<ScanProgress>>,
    root_device: Option<u64>,
    started: Instant,
    last_snapshot: Instant,
}

impl Walk {
    fn new(aggregator: Aggregator, root: PathKey, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            aggregator,
            root,
            cancel,
            stack: Vec::new(),
            warnings: Vec::new(),
            records: Vec::new(),
            tracker: ProgressTracker::new(),
            progress_tx: None,
            root_device: None,
            started: now,
            last_snapshot: now,
        }
    }

    fn config(&self) -> &EngineConfig {
        &self.aggregator.config
    }

    /// Stat the root. Returns a report straight away for anything that
    /// needs no walk: a file, a link, or a directory with a fresh cache entry.
    fn begin(&mut self) -> Result<Option<SizeReport>, ScanError> {
        self.aggregator.counters.walks.fetch_add(1, Ordering::Relaxed);
        info!(root = %self.root, "aggregation started");

        let root = self.root.clone();
        let meta = fs::symlink_metadata(root.as_path()).map_err(|e| ScanError::io(root.as_path(), e))?;
        self.root_device = device_of(&meta);
        let file_type = meta.file_type();

        if file_type.is_file() {
            let identity = identity_from_metadata(self.aggregator.mode, &root, &meta);
            self.tracker.record_file(meta.len());
            let leaf = FileLeaf {
                name: root.name(),
                key: root,
                size: meta.len(),
                identity,
                link_count: link_count(&meta),
                counted: true,
            };
            return Ok(Some(self.report(Node::File(leaf))));
        }

        if file_type.is_symlink() {
            let name = root.name();
            let node = self.symlink_node(root, name);
            return Ok(Some(self.report(node)));
        }

        if !file_type.is_dir() {
            let node = Node::Special {
                name: root.name(),
                key: root,
            };
            return Ok(Some(self.report(node)));
        }

        let mtime = DirMtime::of(&meta);
        if let Some(cached) = self.cached_dir(&root, mtime) {
            return Ok(Some(self.report(Node::Directory(cached))));
        }

        let entries = read_children(&root, self.aggregator.mode)?;
        self.note_listed(&root);

        let keep_children = self.config().detail_depth > 0;
        let mut dir = DirNode::new(root);
        dir.modified = mtime;
        self.stack.push(Frame {
            dir,
            entries: entries.into_iter(),
            seen: SeenIdentities::new(),
            depth: 0,
            keep_children,
        });
        Ok(None)
    }

    /// Visit one entry, or close one finished directory.
    ///
    /// Returns the final report once the root is done or the walk is
    /// cancelled.
    fn step(&mut self) -> Option<Result<SizeReport, ScanError>> {
        if self.cancel.is_cancelled() {
            return Some(Ok(self.finish_cancelled()));
        }

        let Some(frame) = self.stack.last_mut() else {
            return Some(Err(ScanError::Other {
                message: format!("walk of {} stepped with no open directory", self.root),
            }));
        };

        match frame.entries.next() {
            Some(entry) => {
                self.visit(entry);
                None
            }
            None => {
                let frame = self.stack.pop()?;
                let (dir, seen) = self.close(frame);
                match self.stack.last_mut() {
                    Some(parent) => {
                        absorb(parent, dir, seen);
                        None
                    }
                    None => Some(Ok(self.finish(dir))),
                }
            }
        }
    }

    fn visit(&mut self, entry: ListingEntry) {
        match entry.kind {
            EntryKind::File => self.visit_file(entry),
            EntryKind::Dir => self.visit_dir(entry),
            EntryKind::Symlink => {
                let node = self.symlink_node(entry.key, entry.name);
                self.push_child(node);
            }
            EntryKind::Other => self.push_child(Node::Special {
                key: entry.key,
                name: entry.name,
            }),
            EntryKind::Error => {
                let error = entry.error.unwrap_or_else(|| {
                    EntryError::new(entry.key.as_path(), "unreadable entry", EntryErrorKind::ReadError)
                });
                self.record_error(error);
            }
        }
    }

    fn visit_file(&mut self, entry: ListingEntry) {
        let size = entry.size.unwrap_or(0);
        let identity = entry
            .identity
            .unwrap_or_else(|| FileIdentity::Path(entry.key.clone()));
        let dedup = entry.link_count > 1 && self.aggregator.mode.dedups_hard_links();

        let Some(frame) = self.stack.last_mut() else {
            return;
        };
        let counted = !dedup || frame.seen.track(identity.clone(), size);
        if !counted {
            debug!(path = %entry.key, "hard link already counted");
        }

        let leaf = FileLeaf {
            key: entry.key,
            name: entry.name,
            size,
            identity,
            link_count: entry.link_count,
            counted,
        };
        frame.dir.total_size += leaf.counted_size();
        frame.dir.file_count += 1;
        self.tracker.record_file(leaf.counted_size());
        self.push_child(Node::File(leaf));

        if self.tracker.files_scanned() % self.config().progress_interval.max(1) == 0 {
            self.publish_progress();
        }
    }

    fn visit_dir(&mut self, entry: ListingEntry) {
        if !self.config().cross_filesystems
            && entry.device.is_some()
            && self.root_device.is_some()
            && entry.device != self.root_device
        {
            debug!(path = %entry.key, "skipping directory on another filesystem");
            return;
        }

        if let Some(cached) = self.cached_dir(&entry.key, entry.modified) {
            self.push_dir(cached, SeenIdentities::new());
            return;
        }

        match read_children(&entry.key, self.aggregator.mode) {
            Ok(children) => {
                self.note_listed(&entry.key);
                let depth = self.stack.last().map_or(0, |f| f.depth) + 1;
                let keep_children = depth < self.config().detail_depth;
                let mut dir = DirNode::new(entry.key);
                dir.name = entry.name;
                dir.modified = entry.modified;
                self.stack.push(Frame {
                    dir,
                    entries: children.into_iter(),
                    seen: SeenIdentities::new(),
                    depth,
                    keep_children,
                });
            }
            Err(e) => self.record_error(e.into_entry_error()),
        }
    }

    fn symlink_node(&mut self, key: PathKey, name: CompactString) -> Node {
        let target = fs::read_link(key.as_path())
            .map(|p| CompactString::new(p.to_string_lossy()))
            .unwrap_or_default();
        if fs::metadata(key.as_path()).is_err() {
            self.warnings
                .push(EntryError::broken_symlink(key.as_path(), &target));
        }
        Node::Symlink { key, name, target }
    }

    /// A fresh cached total for `key`, as a leaf directory node.
    fn cached_dir(&mut self, key: &PathKey, mtime: Option<DirMtime>) -> Option<DirNode> {
        let store = self.aggregator.store.as_ref()?;
        let entry = store.get_fresh(key, mtime?)?;

        self.aggregator.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.tracker.record_cache_hit(entry.size_bytes);

        let mut dir = DirNode::new(key.clone());
        dir.total_size = entry.size_bytes;
        dir.file_count = entry.file_count;
        dir.dir_count = entry.dir_count;
        dir.from_cache = true;
        dir.modified = Some(entry.mtime);
        Some(dir)
    }

    fn note_listed(&mut self, key: &PathKey) {
        self.aggregator.counters.dirs_listed.fetch_add(1, Ordering::Relaxed);
        self.tracker.record_dir(key.as_path().to_path_buf());
    }

    fn record_error(&mut self, error: EntryError) {
        debug!(path = %error.path.display(), kind = ?error.kind, "skipping entry: {}", error.message);
        self.tracker.record_error();
        if let Some(frame) = self.stack.last_mut() {
            if error.loses_bytes() {
                frame.dir.lower_bound = true;
            }
        }
        self.push_child(Node::Error(error.clone()));
        self.warnings.push(error);
    }

    fn push_child(&mut self, node: Node) {
        if let Some(frame) = self.stack.last_mut() {
            if frame.keep_children {
                frame.dir.children.push(node);
            }
        }
    }

    fn push_dir(&mut self, dir: DirNode, seen: SeenIdentities) {
        if let Some(parent) = self.stack.last_mut() {
            absorb(parent, dir, seen);
        }
    }

    /// Finish a directory and queue its cache record when its total is exact.
    ///
    /// A subtree holding multi-link files is never cached: a cached total
    /// cannot be deduplicated against links elsewhere in a later walk.
    fn close(&mut self, frame: Frame) -> (DirNode, SeenIdentities) {
        let Frame { dir, seen, .. } = frame;
        if self.aggregator.store.is_none() || dir.lower_bound {
            return (dir, seen);
        }
        if !seen.is_empty() {
            debug!(path = %dir.key, links = seen.len(), "not caching subtree with hard links");
            return (dir, seen);
        }
        if let Some(mtime) = dir.modified {
            self.records.push(
                SizeEntry::new(dir.key.clone(), dir.total_size, mtime)
                    .with_counts(dir.file_count, dir.dir_count),
            );
        }
        (dir, seen)
    }

    fn finish(&mut self, mut root: DirNode) -> SizeReport {
        root.sort_children_by_size();

        if let Some(store) = &self.aggregator.store {
            match store.put_batch(&self.records) {
                Ok(written) => {
                    self.aggregator
                        .counters
                        .cache_writes
                        .fetch_add(written as u64, Ordering::Relaxed);
                }
                Err(e) => warn!(root = %self.root, error = %e, "failed to write cached sizes"),
            }
        }
        self.records.clear();

        let report = self.report(Node::Directory(root));
        info!(
            root = %self.root,
            size = report.total_size(),
            files = report.progress.files_scanned,
            warnings = report.warnings.len(),
            elapsed_ms = report.duration.as_millis() as u64,
            "aggregation finished"
        );
        report
    }

    /// Fold every open directory into its parent and discard pending cache
    /// records.
    fn finish_cancelled(&mut self) -> SizeReport {
        self.records.clear();

        let mut root = None;
        while let Some(frame) = self.stack.pop() {
            let Frame { mut dir, seen, .. } = frame;
            dir.partial = true;
            match self.stack.last_mut() {
                Some(parent) => absorb(parent, dir, seen),
                None => root = Some(dir),
            }
        }

        let mut root = root.unwrap_or_else(|| {
            let mut dir = DirNode::new(self.root.clone());
            dir.partial = true;
            dir
        });
        root.sort_children_by_size();

        info!(root = %self.root, size = root.total_size, "aggregation cancelled");
        self.report(Node::Directory(root))
    }

    fn report(&mut self, root: Node) -> SizeReport {
        self.publish_progress();
        SizeReport {
            root,
            warnings: std::mem::take(&mut self.warnings),
            identity_mode: self.aggregator.mode,
            progress: self.tracker.snapshot(),
            duration: self.started.elapsed(),
        }
    }

    fn publish_progress(&self) {
        if let Some(tx) = &self.progress_tx {
            tx.send_replace(self.tracker.snapshot());
        }
    }

    fn snapshot_due(&self) -> bool {
        !self.stack.is_empty() && self.last_snapshot.elapsed() >= self.config().snapshot_interval()
    }

    /// Running view of the root: its finished children plus the partial
    /// totals of every directory still open.
    fn snapshot(&mut self) -> DirNode {
        self.last_snapshot = Instant::now();

        let Some((root, open)) = self.stack.split_first() else {
            let mut dir = DirNode::new(self.root.clone());
            dir.partial = true;
            return dir;
        };

        let mut node = root.dir.clone();
        node.partial = true;
        for frame in open {
            node.total_size += frame.dir.total_size;
            node.file_count += frame.dir.file_count;
            node.dir_count += frame.dir.dir_count + 1;
            node.lower_bound |= frame.dir.lower_bound;
        }
        node
    }
}

/// Add a finished child directory to its parent.
fn absorb(parent: &mut Frame, child: DirNode, seen: SeenIdentities) {
    let overlap = parent.seen.merge_child(seen);
    parent.dir.total_size += child.total_size.saturating_sub(overlap);
    parent.dir.file_count += child.file_count;
    parent.dir.dir_count += child.dir_count + 1;
    parent.dir.lower_bound |= child.lower_bound;
    parent.dir.partial |= child.partial;
    if parent.keep_children {
        parent.dir.children.push(Node::Directory(child));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn create_test_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::create_dir(root.join("dir1")).unwrap();
        fs::create_dir(root.join("dir2")).unwrap();
        fs::create_dir(root.join("dir1/subdir")).unwrap();

        fs::write(root.join("file1.txt"), "hello").unwrap();
        fs::write(root.join("dir1/file2.txt"), "world world world").unwrap();
        fs::write(root.join("dir1/subdir/file3.txt"), "test").unwrap();
        fs::write(root.join("dir2/file4.txt"), "another file here").unwrap();

        temp
    }

    #[test]
    fn test_basic_aggregate() {
        let temp = create_test_tree();
        let root = PathKey::normalize(temp.path()).unwrap();

        let report = Aggregator::new(&config(), IdentityMode::PathOnly)
            .aggregate(&root, CancellationToken::new())
            .unwrap();

        let dir = report.root_dir().unwrap();
        assert_eq!(report.total_size(), 5 + 17 + 4 + 17);
        assert_eq!(dir.file_count, 4);
        assert_eq!(dir.dir_count, 3);
        assert!(report.is_exact());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_children_sorted_by_size() {
        let temp = create_test_tree();
        let root = PathKey::normalize(temp.path()).unwrap();

        let report = Aggregator::new(&config(), IdentityMode::PathOnly)
            .aggregate(&root, CancellationToken::new())
            .unwrap();

        let children = &report.root_dir().unwrap().children;
        assert_eq!(children.len(), 3);
        for pair in children.windows(2) {
            assert!(pair[0].size() >= pair[1].size());
        }
    }

    #[test]
    fn test_detail_depth_bounds_retained_children() {
        let temp = create_test_tree();
        let root = PathKey::normalize(temp.path()).unwrap();

        let report = Aggregator::new(&config(), IdentityMode::PathOnly)
            .aggregate(&root, CancellationToken::new())
            .unwrap();
        let dir1 = report.root_dir().unwrap().child("dir1").unwrap().as_dir().unwrap();
        assert!(dir1.children.is_empty());
        assert_eq!(dir1.total_size, 21);

        let deep = EngineConfig::builder().detail_depth(2u32).build().unwrap();
        let report = Aggregator::new(&deep, IdentityMode::PathOnly)
            .aggregate(&root, CancellationToken::new())
            .unwrap();
        let dir1 = report.root_dir().unwrap().child("dir1").unwrap().as_dir().unwrap();
        assert_eq!(dir1.children.len(), 2);
    }

    #[test]
    fn test_file_root_is_a_single_leaf() {
        let temp = create_test_tree();
        let file = PathKey::normalize(temp.path().join("file1.txt")).unwrap();

        let report = Aggregator::new(&config(), IdentityMode::PathOnly)
            .aggregate(&file, CancellationToken::new())
            .unwrap();
        assert!(matches!(report.root, Node::File(_)));
        assert_eq!(report.total_size(), 5);
    }

    #[test]
    fn test_step_without_open_directory_is_an_error() {
        let temp = TempDir::new().unwrap();
        let root = PathKey::normalize(temp.path()).unwrap();
        let aggregator = Aggregator::new(&config(), IdentityMode::PathOnly);

        let mut walk = Walk::new(aggregator, root, CancellationToken::new());
        assert!(matches!(walk.step(), Some(Err(ScanError::Other { .. }))));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp = TempDir::new().unwrap();
        let root = PathKey::normalize(temp.path().join("nope")).unwrap();

        let mut stream = Aggregator::new(&config(), IdentityMode::PathOnly)
            .stream(&root, CancellationToken::new());
        assert!(matches!(stream.next(), Some(Err(ScanError::NotFound { .. }))));
        assert!(stream.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let temp = create_test_tree();
        std::os::unix::fs::symlink(temp.path().join("dir1"), temp.path().join("loop")).unwrap();
        std::os::unix::fs::symlink(temp.path().join("gone"), temp.path().join("broken")).unwrap();
        let root = PathKey::normalize(temp.path()).unwrap();

        let report = Aggregator::new(&config(), IdentityMode::PathOnly)
            .aggregate(&root, CancellationToken::new())
            .unwrap();
        assert_eq!(report.total_size(), 43);
        assert!(report.is_exact());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, EntryErrorKind::BrokenSymlink);
    }
}
