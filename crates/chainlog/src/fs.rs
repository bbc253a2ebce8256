//! Filesystem helpers shared by the store, catalog, and maintenance tools.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::Result;

/// File name of the live (mutable) log.
pub const LOG_FILE_NAME: &str = "blocks.log";

/// File name of the live (mutable) index.
pub const INDEX_FILE_NAME: &str = "blocks.index";

/// Extension of log files, live and rotated.
pub const LOG_EXTENSION: &str = "log";

/// Extension of index files, live and rotated.
pub const INDEX_EXTENSION: &str = "index";

/// Creates an empty file at `path` if none exists.
pub fn ensure_file_exists(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Size in bytes of the file at `path`.
pub fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Resizes the file at `path` to exactly `len` bytes and syncs it.
pub fn resize_file(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// Creates (or truncates) a file of exactly `len` bytes, returning a handle
/// suitable for memory mapping.
pub fn create_fixed_size_file(path: &Path, len: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)?;
    Ok(file)
}

/// Flushes directory metadata so renames and deletions survive a crash.
#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Parsed form of a rotated segment file name, `blocks-<first>-<last>.log`.
///
/// Parsing is only a directory-scan filter; the authoritative block range of
/// a segment comes from its preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFileName {
    pub first_block_num: u32,
    pub last_block_num: u32,
}

impl SegmentFileName {
    /// Parses `blocks-<first>-<last>.log`; returns `None` for anything else.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".log")?;
        let rest = stem.strip_prefix("blocks-")?;
        let (first, last) = rest.split_once('-')?;
        if first.is_empty() || !first.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if last.is_empty() || !last.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            first_block_num: first.parse().ok()?,
            last_block_num: last.parse().ok()?,
        })
    }

    /// Extension-less base name for a segment covering `[first, last]`.
    pub fn base(first: u32, last: u32) -> String {
        format!("blocks-{first}-{last}")
    }
}

/// Timestamp suffix used for backup directories and bad-tail spill files.
pub fn timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segment_file_names() {
        let parsed = SegmentFileName::parse("blocks-1-100.log").expect("should parse");
        assert_eq!(parsed.first_block_num, 1);
        assert_eq!(parsed.last_block_num, 100);
    }

    #[test]
    fn rejects_non_segment_names() {
        assert!(SegmentFileName::parse("blocks.log").is_none());
        assert!(SegmentFileName::parse("blocks-1-100.index").is_none());
        assert!(SegmentFileName::parse("blocks-1-.log").is_none());
        assert!(SegmentFileName::parse("blocks--100.log").is_none());
        assert!(SegmentFileName::parse("blocks-1-2-3.log").is_none());
        assert!(SegmentFileName::parse("blocks-bad-tail-2024.log").is_none());
        assert!(SegmentFileName::parse("blocks-a-b.log").is_none());
    }

    #[test]
    fn base_name_round_trips() {
        let base = SegmentFileName::base(7, 42);
        let parsed = SegmentFileName::parse(&format!("{base}.log")).expect("should parse");
        assert_eq!(parsed.first_block_num, 7);
        assert_eq!(parsed.last_block_num, 42);
    }

    #[test]
    fn ensure_file_exists_touches_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blocks.log");
        ensure_file_exists(&path).expect("touch");
        std::fs::write(&path, b"data").expect("write");
        ensure_file_exists(&path).expect("no-op");
        assert_eq!(std::fs::read(&path).expect("read"), b"data");
    }
}
