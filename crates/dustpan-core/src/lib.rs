//! Core types for dustpan.
//!
//! This crate provides the fundamental data structures shared by the cache
//! store and the scanning engine: normalized path keys, file identity,
//! transient size trees, errors and configuration.

mod config;
mod error;
mod identity;
mod node;
mod path;

pub use config::{APP_DIR, EngineConfig, EngineConfigBuilder, EngineConfigBuilderError};
pub use error::{EntryError, EntryErrorKind, ScanError};
pub use identity::{
    FileIdentity, IdentityMode, InodeInfo, device_of, identity_from_metadata, identity_of,
    inode_of, link_count,
};
pub use node::{DirMtime, DirNode, EntryKind, FileLeaf, Node};
pub use path::{KEY_SEPARATOR, MAX_PATH_LEN, PathKey};
