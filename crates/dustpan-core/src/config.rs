//! Engine configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ScanError;

/// Directory name used under the per-user config and data directories.
pub const APP_DIR: &str = "dustpan";

/// Configuration for the size engine.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct EngineConfig {
    /// Aggregations allowed to run at once.
    #[builder(default = "3")]
    pub max_concurrent_scans: usize,

    /// Cross filesystem boundaries.
    #[builder(default = "false")]
    pub cross_filesystems: bool,

    /// Levels below the root whose directories keep their children.
    #[builder(default = "1")]
    pub detail_depth: u32,

    /// Publish progress every this many files.
    #[builder(default = "100")]
    pub progress_interval: u64,

    /// Minimum time between partial snapshots, in milliseconds.
    #[builder(default = "250")]
    pub snapshot_interval_ms: u64,

    /// Cache database location (None = per-user data directory).
    #[builder(default)]
    pub cache_path: Option<PathBuf>,

    /// Read connections kept open by the cache store.
    #[builder(default = "4")]
    pub read_connections: usize,
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_scans == Some(0) {
            return Err("max_concurrent_scans must be at least 1".to_string());
        }
        if self.progress_interval == Some(0) {
            return Err("progress_interval must be at least 1".to_string());
        }
        if self.read_connections == Some(0) {
            return Err("read_connections must be at least 1".to_string());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Create a new engine config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Minimum time between partial snapshots.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Default location of the cache database.
    pub fn default_cache_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(APP_DIR).join("cache.db"))
    }

    /// Load the per-user config file.
    ///
    /// A missing file yields defaults; so does a malformed one, after a
    /// warning.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring config file");
                Self::default()
            }
        }
    }

    /// Load and validate a config file.
    pub fn load_from(path: &Path) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
        let config: Self = toml::from_str(&content).map_err(|e| ScanError::InvalidConfig {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the same constraints as the builder.
    pub fn validate(&self) -> Result<(), ScanError> {
        let builder = EngineConfigBuilder {
            max_concurrent_scans: Some(self.max_concurrent_scans),
            progress_interval: Some(self.progress_interval),
            read_connections: Some(self.read_connections),
            ..EngineConfigBuilder::default()
        };
        builder
            .validate()
            .map_err(|message| ScanError::InvalidConfig { message })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scans: 3,
            cross_filesystems: false,
            detail_depth: 1,
            progress_interval: 100,
            snapshot_interval_ms: 250,
            cache_path: None,
            read_connections: 4,
        }
    }
}
