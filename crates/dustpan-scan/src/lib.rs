//! Directory size engine for dustpan.
//!
//! # Overview
//!
//! `dustpan-scan` computes recursive directory sizes and keeps them warm in
//! a [`CacheStore`](dustpan_cache::CacheStore). Key pieces:
//!
//! - **[`Aggregator`]** walks a tree, reusing fresh cached subtotals and
//!   counting hard-linked files once
//! - **[`Scheduler`]** runs aggregations in the background with bounded
//!   concurrency and coalesces duplicate requests
//! - **[`Lister`]** returns the immediate children of a directory without
//!   walking
//!
//! # Example
//!
//! ```rust,no_run
//! use dustpan_core::EngineConfig;
//! use dustpan_scan::Scheduler;
//!
//! # async fn run() -> Result<(), dustpan_core::ScanError> {
//! let (scheduler, _events) = Scheduler::new(EngineConfig::default(), None)?;
//! let handle = scheduler.request_scan("/var/log")?;
//!
//! if let Some(report) = handle.wait().await.report() {
//!     println!("Total size: {} bytes", report.total_size());
//! }
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Streaming
//!
//! Synchronous callers can drive a walk step by step and render the partial
//! totals as they arrive:
//!
//! ```rust,no_run
//! use dustpan_core::{EngineConfig, IdentityMode, PathKey};
//! use dustpan_scan::{AggregateStep, Aggregator};
//! use tokio_util::sync::CancellationToken;
//!
//! let aggregator = Aggregator::new(&EngineConfig::default(), IdentityMode::Inode);
//! let root = PathKey::normalize("/home").unwrap();
//! for step in aggregator.stream(&root, CancellationToken::new()) {
//!     match step.unwrap() {
//!         AggregateStep::Partial(node) => println!("so far: {}", node.total_size),
//!         AggregateStep::Finished(report) => println!("done: {}", report.total_size()),
//!     }
//! }
//! ```

mod aggregate;
mod inode;
mod listing;
mod progress;
mod scheduler;

pub use aggregate::{AggregateStep, AggregateStream, Aggregator, AggregatorStats, SizeReport};
pub use inode::SeenIdentities;
pub use listing::{Lister, ListingEntry, SortOrder, sort_entries};
pub use progress::ScanProgress;
pub use scheduler::{
    BoardView, ResultBoard, ScanEvent, ScanHandle, ScanId, ScanOutcome, ScanStatus, Scheduler,
};
