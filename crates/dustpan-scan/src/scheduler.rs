//! Background scan scheduling.
//!
//! The [`Scheduler`] runs aggregations on tokio's blocking pool, at most
//! `max_concurrent_scans` at a time. Callers get a [`ScanHandle`] back
//! immediately and receive snapshots and the final outcome either by polling
//! the handle or by draining the [`ScanEvent`] queue.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use dustpan_cache::CacheStore;
use dustpan_core::{DirNode, EngineConfig, IdentityMode, PathKey, ScanError};

use crate::aggregate::{AggregateStep, Aggregator, AggregatorStats, SizeReport};
use crate::listing::{Lister, ListingEntry};
use crate::progress::ScanProgress;

/// Identifier of one scan request. Monotonic across a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a scan ended.
#[derive(Debug)]
pub enum ScanOutcome {
    Complete(SizeReport),
    /// Cancelled before or during the walk. Nothing was cached.
    Cancelled { partial: Option<SizeReport> },
    Failed(ScanError),
}

impl ScanOutcome {
    /// The report, complete or partial, if there is one.
    pub fn report(&self) -> Option<&SizeReport> {
        match self {
            Self::Complete(report) => Some(report),
            Self::Cancelled { partial } => partial.as_ref(),
            Self::Failed(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Where a scan is in its lifecycle.
#[derive(Debug, Clone)]
pub enum ScanStatus {
    /// Waiting for a worker slot.
    Queued,
    Running { snapshot: Option<Arc<DirNode>> },
    Finished(Arc<ScanOutcome>),
}

/// Message delivered on the scheduler's event queue.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Snapshot {
        id: ScanId,
        key: PathKey,
        node: Arc<DirNode>,
    },
    /// Sent exactly once per scan.
    Finished {
        id: ScanId,
        key: PathKey,
        outcome: Arc<ScanOutcome>,
    },
}

impl ScanEvent {
    pub fn id(&self) -> ScanId {
        match self {
            Self::Snapshot { id, .. } | Self::Finished { id, .. } => *id,
        }
    }

    pub fn key(&self) -> &PathKey {
        match self {
            Self::Snapshot { key, .. } | Self::Finished { key, .. } => key,
        }
    }
}

#[derive(Debug)]
struct HandleInner {
    id: ScanId,
    key: PathKey,
    cancel: CancellationToken,
    status: watch::Receiver<ScanStatus>,
    progress: watch::Receiver<ScanProgress>,
}

/// One outstanding or completed scan.
///
/// Cheap to clone; coalesced requests share the same handle.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    inner: Arc<HandleInner>,
}

impl ScanHandle {
    pub fn id(&self) -> ScanId {
        self.inner.id
    }

    pub fn key(&self) -> &PathKey {
        &self.inner.key
    }

    /// Request the scan to stop at its next entry.
    ///
    /// Prefer [`Scheduler::cancel`], which also lets the next request for
    /// the same path start fresh.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn status(&self) -> ScanStatus {
        self.inner.status.borrow().clone()
    }

    /// Latest partial view of the root while running.
    pub fn snapshot(&self) -> Option<Arc<DirNode>> {
        match &*self.inner.status.borrow() {
            ScanStatus::Running { snapshot } => snapshot.clone(),
            _ => None,
        }
    }

    /// The outcome, once finished.
    pub fn outcome(&self) -> Option<Arc<ScanOutcome>> {
        match &*self.inner.status.borrow() {
            ScanStatus::Finished(outcome) => Some(Arc::clone(outcome)),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(&*self.inner.status.borrow(), ScanStatus::Finished(_))
    }

    /// Latest progress counters.
    pub fn progress(&self) -> ScanProgress {
        self.inner.progress.borrow().clone()
    }

    /// Wait for the scan to finish.
    pub async fn wait(&self) -> Arc<ScanOutcome> {
        let mut status = self.inner.status.clone();
        match status
            .wait_for(|s| matches!(s, ScanStatus::Finished(_)))
            .await
        {
            Ok(current) => match &*current {
                ScanStatus::Finished(outcome) => Arc::clone(outcome),
                _ => Arc::new(ScanOutcome::Failed(ScanError::ShutDown)),
            },
            Err(_) => Arc::new(ScanOutcome::Failed(ScanError::ShutDown)),
        }
    }
}

struct Shared {
    aggregator: Aggregator,
    lister: Lister,
    store: Option<Arc<CacheStore>>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    in_flight: DashMap<PathKey, ScanHandle>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<ScanEvent>,
    root_token: CancellationToken,
    tracker: TaskTracker,
    shut_down: AtomicBool,
}

/// Dispatches aggregations to a bounded pool of background workers.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler on the current tokio runtime.
    ///
    /// Returns the scheduler and the receiving end of its event queue.
    pub fn new(
        config: EngineConfig,
        store: Option<Arc<CacheStore>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScanEvent>), ScanError> {
        let runtime = Handle::try_current().map_err(|e| ScanError::Other {
            message: format!("scheduler needs a tokio runtime: {e}"),
        })?;
        Self::with_runtime(config, store, runtime)
    }

    /// Create a scheduler that spawns onto `runtime`.
    pub fn with_runtime(
        config: EngineConfig,
        store: Option<Arc<CacheStore>>,
        runtime: Handle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScanEvent>), ScanError> {
        config.validate()?;

        let mode = IdentityMode::detect(&std::env::temp_dir());
        let mut aggregator = Aggregator::new(&config, mode);
        let mut lister = Lister::new(mode);
        if let Some(store) = &store {
            aggregator = aggregator.with_cache(Arc::clone(store));
            lister = lister.with_cache(Arc::clone(store));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            aggregator,
            lister,
            store,
            runtime,
            permits: Arc::new(Semaphore::new(config.max_concurrent_scans)),
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(0),
            events,
            root_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shut_down: AtomicBool::new(false),
        };

        info!(
            workers = config.max_concurrent_scans,
            identity = %mode,
            "scheduler started"
        );
        Ok((
            Self {
                shared: Arc::new(shared),
            },
            rx,
        ))
    }

    /// Request the size of `path`.
    ///
    /// Returns the in-flight handle if a live scan of the same path exists;
    /// otherwise starts a new one. Never blocks on the walk.
    pub fn request_scan(&self, path: impl AsRef<Path>) -> Result<ScanHandle, ScanError> {
        self.ensure_running()?;
        let key = PathKey::normalize(path)?;
        Ok(self.schedule(key, false))
    }

    /// Request sizes for many paths at once.
    pub fn request_scans<I, P>(&self, paths: I) -> Vec<Result<ScanHandle, ScanError>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths.into_iter().map(|p| self.request_scan(p)).collect()
    }

    /// Start a fresh scan of `path`, cancelling any scan already in flight.
    pub fn rescan(&self, path: impl AsRef<Path>) -> Result<ScanHandle, ScanError> {
        self.ensure_running()?;
        let key = PathKey::normalize(path)?;
        Ok(self.schedule(key, true))
    }

    /// Cancel a scan and detach it so the next request starts fresh.
    pub fn cancel(&self, handle: &ScanHandle) {
        handle.cancel();
        self.shared
            .in_flight
            .remove_if(handle.key(), |_, h| h.id() == handle.id());
        debug!(id = %handle.id(), path = %handle.key(), "scan cancelled");
    }

    /// Immediate children of `path`. Runs inline; does not walk.
    pub fn list_children(&self, path: impl AsRef<Path>) -> Result<Vec<ListingEntry>, ScanError> {
        let key = PathKey::normalize(path)?;
        self.shared.lister.list_children(&key)
    }

    /// Drop cached sizes for `prefix` and everything below it.
    ///
    /// A filesystem root clears the whole cache.
    pub fn clear_cache(&self, prefix: impl AsRef<Path>) -> Result<usize, ScanError> {
        let key = PathKey::normalize(prefix)?;
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };
        if key.is_root() {
            return self.clear_all_cache();
        }
        store.try_invalidate(&key).map_err(|e| ScanError::Other {
            message: e.to_string(),
        })
    }

    /// Forget a path that was removed from disk.
    ///
    /// Drops its own entries and the totals of every ancestor: only the
    /// direct parent's mtime changes on removal, so higher cached totals
    /// would otherwise keep counting the freed bytes.
    pub fn forget_removed(&self, path: impl AsRef<Path>) -> Result<usize, ScanError> {
        let key = PathKey::normalize(path)?;
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };
        let to_error = |e: dustpan_cache::CacheError| ScanError::Other {
            message: e.to_string(),
        };

        let mut removed = store.try_invalidate(&key).map_err(to_error)?;
        let mut ancestor = key.parent();
        while let Some(dir) = ancestor {
            removed += usize::from(store.try_remove(&dir).map_err(to_error)?);
            ancestor = dir.parent();
        }
        debug!(path = %key, removed, "forgot removed path");
        Ok(removed)
    }

    /// Drop every cached size.
    pub fn clear_all_cache(&self) -> Result<usize, ScanError> {
        let Some(store) = &self.shared.store else {
            return Ok(0);
        };
        store.clear().map_err(|e| ScanError::Other {
            message: e.to_string(),
        })
    }

    /// Handles of scans not yet finished or cancelled.
    pub fn in_flight(&self) -> Vec<ScanHandle> {
        self.shared
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.shared.aggregator.stats()
    }

    pub fn identity_mode(&self) -> IdentityMode {
        self.shared.aggregator.identity_mode()
    }

    pub fn store(&self) -> Option<&Arc<CacheStore>> {
        self.shared.store.as_ref()
    }

    /// Stop accepting work, cancel every scan, wait for workers, then close
    /// the cache store.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(in_flight = self.shared.in_flight.len(), "scheduler shutting down");

        self.shared.root_token.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.in_flight.clear();

        if let Some(store) = &self.shared.store {
            store.close();
        }
        info!("scheduler stopped");
    }

    fn ensure_running(&self) -> Result<(), ScanError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            Err(ScanError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn schedule(&self, key: PathKey, supersede: bool) -> ScanHandle {
        match self.shared.in_flight.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if !supersede && !current.is_cancelled() {
                    debug!(id = %current.id(), path = %key, "coalescing scan request");
                    return current.clone();
                }
                current.cancel();
                let handle = self.spawn(key);
                slot.insert(handle.clone());
                handle
            }
            Entry::Vacant(slot) => {
                let handle = self.spawn(key);
                slot.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn(&self, key: PathKey) -> ScanHandle {
        let id = ScanId(self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = self.shared.root_token.child_token();
        let (status_tx, status_rx) = watch::channel(ScanStatus::Queued);
        let (progress_tx, progress_rx) = watch::channel(ScanProgress::new());

        let handle = ScanHandle {
            inner: Arc::new(HandleInner {
                id,
                key: key.clone(),
                cancel: cancel.clone(),
                status: status_rx,
                progress: progress_rx,
            }),
        };

        debug!(%id, path = %key, "scan queued");
        let task = run_scan(
            Arc::clone(&self.shared),
            id,
            key,
            cancel,
            Arc::new(status_tx),
            progress_tx,
        );
        self.shared.tracker.spawn_on(task, &self.shared.runtime);
        handle
    }
}

async fn run_scan(
    shared: Arc<Shared>,
    id: ScanId,
    key: PathKey,
    cancel: CancellationToken,
    status: Arc<watch::Sender<ScanStatus>>,
    progress: watch::Sender<ScanProgress>,
) {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
    };

    let outcome = match permit {
        None => {
            debug!(%id, path = %key, "scan cancelled while queued");
            ScanOutcome::Cancelled { partial: None }
        }
        Some(permit) => {
            status.send_replace(ScanStatus::Running { snapshot: None });

            let aggregator = shared.aggregator.clone();
            let events = shared.events.clone();
            let walk_key = key.clone();
            let walk_status = Arc::clone(&status);
            let walk_cancel = cancel.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                walk(&aggregator, id, &walk_key, walk_cancel, &walk_status, progress, &events)
            })
            .await;

            joined.unwrap_or_else(|e| {
                warn!(%id, path = %key, error = %e, "scan worker failed");
                ScanOutcome::Failed(ScanError::Other {
                    message: e.to_string(),
                })
            })
        }
    };

    let outcome = Arc::new(outcome);
    shared.in_flight.remove_if(&key, |_, h| h.id() == id);
    status.send_replace(ScanStatus::Finished(Arc::clone(&outcome)));
    let _ = shared.events.send(ScanEvent::Finished { id, key, outcome });
}

/// Drive one aggregation on a blocking thread, forwarding snapshots.
fn walk(
    aggregator: &Aggregator,
    id: ScanId,
    key: &PathKey,
    cancel: CancellationToken,
    status: &watch::Sender<ScanStatus>,
    progress: watch::Sender<ScanProgress>,
    events: &mpsc::UnboundedSender<ScanEvent>,
) -> ScanOutcome {
    let stream = aggregator
        .stream(key, cancel.clone())
        .with_progress(progress);

    for step in stream {
        match step {
            Err(e) => return ScanOutcome::Failed(e),
            Ok(AggregateStep::Partial(node)) => {
                let node = Arc::new(node);
                status.send_replace(ScanStatus::Running {
                    snapshot: Some(Arc::clone(&node)),
                });
                let _ = events.send(ScanEvent::Snapshot {
                    id,
                    key: key.clone(),
                    node,
                });
            }
            Ok(AggregateStep::Finished(report)) => {
                return if report.is_partial() {
                    ScanOutcome::Cancelled {
                        partial: Some(report),
                    }
                } else {
                    ScanOutcome::Complete(report)
                };
            }
        }
    }

    ScanOutcome::Failed(ScanError::Other {
        message: "aggregation ended without a result".to_string(),
    })
}

/// What a [`ResultBoard`] currently shows for a path.
#[derive(Debug, Clone)]
pub enum BoardView {
    Partial(Arc<DirNode>),
    Finished(Arc<ScanOutcome>),
}

#[derive(Debug, Clone)]
struct Shown {
    id: ScanId,
    view: BoardView,
}

/// Caller-side view of the latest result per path.
///
/// Applies [`ScanEvent`]s in arrival order and refuses anything older than
/// what it already shows, so a slow superseded scan never overwrites a
/// newer result.
#[derive(Debug, Default)]
pub struct ResultBoard {
    shown: HashMap<PathKey, Shown>,
}

impl ResultBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event. Returns whether the board changed.
    pub fn apply(&mut self, event: &ScanEvent) -> bool {
        let id = event.id();
        let current = self.shown.get(event.key());

        let accept = match (event, current) {
            (_, None) => true,
            (ScanEvent::Snapshot { .. }, Some(shown)) => match shown.view {
                BoardView::Partial(_) => id >= shown.id,
                BoardView::Finished(_) => id > shown.id,
            },
            (ScanEvent::Finished { outcome, .. }, Some(shown)) => {
                let empty_cancel = matches!(&**outcome, ScanOutcome::Cancelled { partial: None });
                id >= shown.id && !empty_cancel
            }
        };

        if !accept {
            debug!(%id, path = %event.key(), "ignoring stale scan event");
            return false;
        }

        let view = match event {
            ScanEvent::Snapshot { node, .. } => BoardView::Partial(Arc::clone(node)),
            ScanEvent::Finished { outcome, .. } => BoardView::Finished(Arc::clone(outcome)),
        };
        self.shown.insert(event.key().clone(), Shown { id, view });
        true
    }

    /// What is shown for `key`.
    pub fn get(&self, key: &PathKey) -> Option<&BoardView> {
        self.shown.get(key).map(|shown| &shown.view)
    }

    /// Total shown for `key`, partial or final.
    pub fn size_of(&self, key: &PathKey) -> Option<u64> {
        match self.get(key)? {
            BoardView::Partial(node) => Some(node.total_size),
            BoardView::Finished(outcome) => outcome.report().map(SizeReport::total_size),
        }
    }

    pub fn remove(&mut self, key: &PathKey) -> Option<BoardView> {
        self.shown.remove(key).map(|shown| shown.view)
    }
}
