//! Scan progress reporting.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Progress information during a scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Number of files counted so far.
    pub files_scanned: u64,
    /// Number of directories listed so far.
    pub dirs_scanned: u64,
    /// Total bytes counted so far.
    pub bytes_scanned: u64,
    /// Directory being listed most recently.
    pub current_path: PathBuf,
    /// Number of per-entry errors encountered.
    pub errors_count: u64,
    /// Subtrees answered from the cache without listing.
    pub cache_hits: u64,
    /// Time elapsed since scan started.
    pub elapsed: Duration,
}

impl ScanProgress {
    /// Create initial progress state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate scan rate in files per second.
    pub fn files_per_second(&self) -> f64 {
        if self.elapsed.as_secs_f64() > 0.0 {
            self.files_scanned as f64 / self.elapsed.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Get total items scanned (files + dirs).
    pub fn total_items(&self) -> u64 {
        self.files_scanned + self.dirs_scanned
    }
}

/// Internal progress tracker with timing.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    start_time: Instant,
    current: ScanProgress,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            current: ScanProgress::new(),
        }
    }

    pub fn record_file(&mut self, size: u64) {
        self.current.files_scanned += 1;
        self.current.bytes_scanned += size;
    }

    pub fn record_dir(&mut self, path: PathBuf) {
        self.current.dirs_scanned += 1;
        self.current.current_path = path;
    }

    pub fn record_error(&mut self) {
        self.current.errors_count += 1;
    }

    pub fn record_cache_hit(&mut self, size: u64) {
        self.current.cache_hits += 1;
        self.current.bytes_scanned += size;
    }

    pub fn files_scanned(&self) -> u64 {
        self.current.files_scanned
    }

    pub fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            elapsed: self.start_time.elapsed(),
            ..self.current.clone()
        }
    }
}
