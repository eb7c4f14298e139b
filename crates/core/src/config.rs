//! Database configuration.
//!
//! Backends (volume, redo log, deadlock detector) are selected with
//! plain enums and matched at open time; there is no runtime plug-in
//! loading. All fields have defaults so a `Config::default()` opens an
//! in-memory database suitable for tests.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which block-volume backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKind {
    /// Volatile in-memory pages. No durability; for tests and caches.
    #[default]
    Memory,
    /// Single-file volume with a free-page list and clean-shutdown flag.
    File,
}

/// Which redo-log backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    /// In-memory record list. No durability; for tests.
    #[default]
    Memory,
    /// Segmented append-only log files with CRC-framed records.
    File,
}

/// Which deadlock-detection algorithm the lock scheduler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorKind {
    /// Depth-first search over the waits-for graph. Exact: reports a
    /// deadlock only when a real cycle exists.
    #[default]
    WaitForGraph,
    /// Timestamp ordering: a requester younger than any conflicting
    /// holder is declared deadlocked. Costs O(holders) per check but
    /// can report deadlocks that do not exist; callers choosing it
    /// trade accuracy for predictable cost.
    Timestamps,
}

/// Typed configuration for opening a database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Volume backend.
    pub volume: VolumeKind,
    /// Redo-log backend.
    pub redo_log: LogKind,
    /// Deadlock detector for the lock scheduler.
    pub detector: DetectorKind,
    /// Directory holding the volume file and log segments. Required
    /// for the file backends, ignored for the memory ones.
    pub path: Option<PathBuf>,
    /// Page size in bytes. Must leave room for the free-length prefix
    /// and at least one minimal object segment.
    pub page_size: usize,
    /// Cap on volume size in pages. `None` means unbounded.
    pub max_volume_pages: Option<u64>,
    /// Update-cache byte budget. Images that would push the cache past
    /// this are dropped and re-read from the redo log on demand.
    pub update_cache_max_bytes: usize,
    /// Initial capacity of the update-cache hash table.
    pub update_cache_capacity: usize,
    /// Bytes after which the redo log rotates to a new segment.
    pub max_log_size: u64,
    /// How long engine operations wait for a lock before giving up,
    /// in milliseconds. 0 means non-blocking probes; `None` means
    /// wait without bound.
    pub lock_wait_ms: Option<u64>,
    /// A database checkpoint may trigger while up to this many other
    /// transactions are still active (provided the minimum interval
    /// has also elapsed).
    pub checkpoint_active_threshold: usize,
    /// Minimum time between database checkpoints triggered by the
    /// active-count heuristic, in milliseconds.
    pub checkpoint_min_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            volume: VolumeKind::Memory,
            redo_log: LogKind::Memory,
            detector: DetectorKind::WaitForGraph,
            path: None,
            page_size: 4096,
            max_volume_pages: None,
            update_cache_max_bytes: 8 * 1024 * 1024,
            update_cache_capacity: 1024,
            max_log_size: 16 * 1024 * 1024,
            lock_wait_ms: Some(10_000),
            checkpoint_active_threshold: 2,
            checkpoint_min_interval_ms: 30_000,
        }
    }
}

/// Smallest page size the object store can work with: free-length
/// prefix plus one maximal header plus a few payload bytes.
pub const MIN_PAGE_SIZE: usize = 64;

impl Config {
    /// In-memory configuration (the default).
    pub fn in_memory() -> Self {
        Config::default()
    }

    /// File-backed configuration rooted at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Config {
            volume: VolumeKind::File,
            redo_log: LogKind::File,
            path: Some(path.into()),
            ..Config::default()
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check invariants that would otherwise surface as obscure
    /// failures deep in the engine.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "page_size {} below minimum {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if self.page_size > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "page_size {} exceeds the 2-byte free-length field",
                self.page_size
            )));
        }
        if (self.volume == VolumeKind::File || self.redo_log == LogKind::File)
            && self.path.is_none()
        {
            return Err(Error::InvalidConfig(
                "file-backed volume or log requires `path`".to_string(),
            ));
        }
        if self.max_log_size == 0 {
            return Err(Error::InvalidConfig(
                "max_log_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock wait time as a duration. `None` means unbounded.
    pub fn lock_wait(&self) -> Option<Duration> {
        self.lock_wait_ms.map(Duration::from_millis)
    }

    /// Minimum interval between heuristic database checkpoints.
    pub fn checkpoint_min_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_min_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid_in_memory() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.volume, VolumeKind::Memory);
        assert_eq!(config.detector, DetectorKind::WaitForGraph);
    }

    #[test]
    fn parses_toml() {
        let config = Config::from_toml_str(
            r#"
            volume = "file"
            redo_log = "file"
            detector = "timestamps"
            path = "/tmp/orion"
            page_size = 8192
            update_cache_max_bytes = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.volume, VolumeKind::File);
        assert_eq!(config.redo_log, LogKind::File);
        assert_eq!(config.detector, DetectorKind::Timestamps);
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.update_cache_max_bytes, 1048576);
        // Unspecified fields keep their defaults
        assert_eq!(config.checkpoint_active_threshold, 2);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = Config::from_toml_str("bogus_option = 1").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_tiny_pages() {
        let err = Config::from_toml_str("page_size = 16").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_oversized_pages() {
        let err = Config::from_toml_str("page_size = 100000").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn file_backend_requires_path() {
        let err = Config::from_toml_str(r#"volume = "file""#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn lock_wait_conversions() {
        let mut config = Config::default();
        config.lock_wait_ms = Some(0);
        assert_eq!(config.lock_wait(), Some(Duration::ZERO));
        config.lock_wait_ms = None;
        assert_eq!(config.lock_wait(), None);
    }
}
