//! Runtime configuration for the block log.
//!
//! The on-disk format version is a property of each log file's preamble, not
//! of the process; the configuration only decides which version newly reset
//! logs are written in. A process-wide default is kept for harnesses that
//! still drive the version through a global switch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Oldest format version this crate can read.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Newest format version this crate can read and write.
pub const MAX_SUPPORTED_VERSION: u32 = 4;

/// Returns whether `version` is within the supported range.
pub fn is_supported_version(version: u32) -> bool {
    (MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version)
}

static DEFAULT_VERSION: AtomicU32 = AtomicU32::new(MAX_SUPPORTED_VERSION);

/// Sets the process-wide default format version used by
/// [`BlockLogConfig::default`]. Kept for test harnesses; prefer setting
/// [`BlockLogConfig::default_version`] explicitly.
pub fn set_default_version(version: u32) {
    DEFAULT_VERSION.store(version, Ordering::Relaxed);
}

/// Returns the process-wide default format version.
pub fn default_version() -> u32 {
    DEFAULT_VERSION.load(Ordering::Relaxed)
}

/// Configuration surface for a [`BlockLog`](crate::store::BlockLog) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockLogConfig {
    /// Directory holding `blocks.log`, `blocks.index`, and rotated segments.
    pub data_dir: PathBuf,

    /// Where evicted segments are moved when the retention cap is exceeded.
    /// `None` deletes them instead. Relative paths resolve under `data_dir`.
    pub archive_dir: Option<PathBuf>,

    /// Block-count interval at which the live log is rotated into a named
    /// segment. Zero is normalized to "never rotate".
    pub stride: u64,

    /// Maximum number of rotated segments kept in the catalog.
    pub max_retained_files: usize,

    /// Format version written by `reset`. Clamped to the supported range.
    pub default_version: u32,
}

impl Default for BlockLogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./blocks"),
            archive_dir: None,
            stride: u64::MAX,
            max_retained_files: 10,
            default_version: default_version(),
        }
    }
}

impl BlockLogConfig {
    /// Configuration rooted at `data_dir` with the defaults for everything else.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Returns a copy with out-of-range values replaced by usable ones.
    pub fn normalized(mut self) -> Self {
        if self.stride == 0 {
            self.stride = u64::MAX;
        }
        self.default_version = self
            .default_version
            .clamp(MIN_SUPPORTED_VERSION, MAX_SUPPORTED_VERSION);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = BlockLogConfig::default();
        assert!(cfg.stride > 0);
        assert!(is_supported_version(cfg.default_version));
        assert_eq!(cfg.max_retained_files, 10);
        assert!(cfg.archive_dir.is_none());
    }

    #[test]
    fn normalized_fixes_stride_and_version() {
        let cfg = BlockLogConfig {
            stride: 0,
            default_version: 99,
            ..BlockLogConfig::default()
        }
        .normalized();
        assert_eq!(cfg.stride, u64::MAX);
        assert_eq!(cfg.default_version, MAX_SUPPORTED_VERSION);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = BlockLogConfig::new("/tmp/blocks");
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: BlockLogConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn supported_version_range() {
        assert!(!is_supported_version(0));
        assert!(is_supported_version(1));
        assert!(is_supported_version(4));
        assert!(!is_supported_version(5));
    }
}
