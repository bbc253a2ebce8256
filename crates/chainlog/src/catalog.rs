//! Catalog of rotated log segments.
//!
//! Rotated segments are immutable `blocks-<first>-<last>.{log,index}` pairs.
//! The catalog maps each segment's first block number to its range and path,
//! serves reads for block numbers outside the live log, and enforces the
//! retention cap when rotation registers a new segment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::chain::ChainId;
use crate::codec::Cursor;
use crate::data::BlockLogData;
use crate::error::{BlockLogError, Result};
use crate::fs::{fsync_dir, SegmentFileName, INDEX_EXTENSION, LOG_EXTENSION};
use crate::index::{construct_index, index_matches_data, BlockLogIndex};

#[derive(Debug, Clone)]
struct CatalogEntry {
    last_block_num: u32,
    base_path: PathBuf,
}

struct ActiveSegment {
    ordinal: usize,
    log: BlockLogData,
    index: Option<BlockLogIndex>,
}

/// Ordered collection of rotated segments with retention.
///
/// At most one segment is bound as the active reader. It is tracked by
/// ordinal so it survives inserts at the end of the collection, and is
/// unbound when retention evicts the prefix it belonged to.
pub struct SegmentCatalog {
    archive_dir: Option<PathBuf>,
    max_retained_files: usize,
    collection: BTreeMap<u32, CatalogEntry>,
    active: Option<ActiveSegment>,
    chain_id: Option<ChainId>,
}

impl SegmentCatalog {
    pub fn new(archive_dir: Option<PathBuf>, max_retained_files: usize) -> Self {
        Self {
            archive_dir,
            max_retained_files,
            collection: BTreeMap::new(),
            active: None,
            chain_id: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.collection.len()
    }

    /// First block number covered by any registered segment.
    pub fn first_block_num(&self) -> Option<u32> {
        self.collection.keys().next().copied()
    }

    /// Chain id shared by every scanned segment, once at least one was seen.
    pub fn chain_id(&self) -> Option<ChainId> {
        self.chain_id
    }

    /// Scans `dir` for rotated segments and registers them.
    ///
    /// Every segment must agree on the chain id. A segment whose index is
    /// missing or stale gets its index rebuilt on the spot. When two segments
    /// start at the same block, the one covering the wider range wins.
    pub fn scan(&mut self, dir: &Path) -> Result<()> {
        for dir_entry in std::fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let file_name = dir_entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if SegmentFileName::parse(name).is_none() {
                continue;
            }

            let log_path = dir_entry.path();
            let index_path = log_path.with_extension(INDEX_EXTENSION);
            let base_path = log_path.with_extension("");

            let log = BlockLogData::open(&log_path)?;
            let log_chain_id = log.chain_id();
            match self.chain_id {
                None => self.chain_id = Some(log_chain_id),
                Some(id) if id == log_chain_id => {}
                Some(_) => {
                    return Err(BlockLogError::ChainIdMismatch(format!(
                        "block log file {} has a different chain id",
                        log_path.display()
                    )));
                }
            }

            if !index_matches_data(&index_path, &log)? {
                construct_index(&log_path, &index_path)?;
            }

            let first = log.first_block_num();
            let last = log.last_block_num()?;

            if let Some(existing) = self.collection.get(&first) {
                if last <= existing.last_block_num {
                    warn!(
                        dropped = %log_path.display(),
                        kept = %existing.base_path.display(),
                        "segment overlaps a wider one already in the catalog, dropping it"
                    );
                    continue;
                }
                warn!(
                    dropped = %existing.base_path.display(),
                    kept = %log_path.display(),
                    "segment overlaps a narrower one already in the catalog, replacing it"
                );
            }

            self.collection.insert(
                first,
                CatalogEntry {
                    last_block_num: last,
                    base_path,
                },
            );
        }
        Ok(())
    }

    /// Binds the segment containing `block_num` as the active reader.
    /// Returns false when no registered segment covers it; any I/O failure
    /// unbinds the reader and also returns false.
    pub fn set_active_item(&mut self, block_num: u32) -> bool {
        match self.bind_segment(block_num) {
            Ok(found) => found,
            Err(err) => {
                warn!(block_num, error = %err, "failed to bind a catalog segment");
                self.active = None;
                false
            }
        }
    }

    fn bind_segment(&mut self, block_num: u32) -> Result<bool> {
        if let Some(active) = self.active.as_mut() {
            if let Some((first, entry)) = self.collection.iter().nth(active.ordinal) {
                if *first <= block_num && block_num <= entry.last_block_num {
                    if active.index.is_none() {
                        active.index = Some(BlockLogIndex::open(
                            &entry.base_path.with_extension(INDEX_EXTENSION),
                        )?);
                    }
                    return Ok(true);
                }
            }
        }

        let Some(first_key) = self.collection.keys().next().copied() else {
            return Ok(false);
        };
        if block_num < first_key {
            return Ok(false);
        }

        let Some((key, entry)) = self.collection.range(..=block_num).next_back() else {
            return Ok(false);
        };
        if block_num > entry.last_block_num {
            return Ok(false);
        }

        let key = *key;
        let base_path = entry.base_path.clone();
        let log = BlockLogData::open(&base_path.with_extension(LOG_EXTENSION))?;
        let index = BlockLogIndex::open(&base_path.with_extension(INDEX_EXTENSION))?;
        let ordinal = self
            .collection
            .keys()
            .position(|k| *k == key)
            .unwrap_or_default();
        self.active = Some(ActiveSegment {
            ordinal,
            log,
            index: Some(index),
        });
        Ok(true)
    }

    /// Cursor into the active segment at the entry of `block_num`, plus the
    /// segment's format version. [`set_active_item`](Self::set_active_item)
    /// must have bound a covering segment first.
    pub fn datastream_for_block(&self, block_num: u32) -> Result<(Cursor<'_>, u32)> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| BlockLogError::corruption("no active catalog segment is bound"))?;
        let index = active
            .index
            .as_ref()
            .ok_or_else(|| BlockLogError::corruption("active catalog segment has no index"))?;
        let ordinal = (block_num - active.log.first_block_num()) as usize;
        let position = index.nth(ordinal);
        Ok((active.log.cursor_at(position), active.log.version()))
    }

    /// Registers the segment `[first_block_num, last_block_num]` rotated out
    /// of the live log.
    ///
    /// `first_block_num` must be monotonically increasing across calls; this
    /// holds by construction because `add` is only called from rotation. When
    /// the retention cap is reached the oldest segments are deleted, or moved
    /// into the archive directory when one is configured.
    pub fn add(&mut self, first_block_num: u32, last_block_num: u32, base_path: PathBuf) -> Result<()> {
        if self.collection.len() >= self.max_retained_files {
            let items_to_erase = if self.max_retained_files > 0 {
                self.collection.len() - self.max_retained_files + 1
            } else {
                self.collection.len()
            };
            let victims: Vec<u32> = self
                .collection
                .keys()
                .take(items_to_erase)
                .copied()
                .collect();
            for key in victims {
                if let Some(entry) = self.collection.remove(&key) {
                    self.evict(&entry)?;
                }
            }
            self.active = match self.active.take() {
                Some(mut active) if active.ordinal >= items_to_erase => {
                    active.ordinal -= items_to_erase;
                    Some(active)
                }
                _ => None,
            };
        }

        if self.max_retained_files > 0 {
            self.collection.insert(
                first_block_num,
                CatalogEntry {
                    last_block_num,
                    base_path,
                },
            );
        }
        Ok(())
    }

    fn evict(&self, entry: &CatalogEntry) -> Result<()> {
        let log_path = entry.base_path.with_extension(LOG_EXTENSION);
        let index_path = entry.base_path.with_extension(INDEX_EXTENSION);
        match &self.archive_dir {
            None => {
                std::fs::remove_file(&log_path)?;
                std::fs::remove_file(&index_path)?;
                info!(segment = %log_path.display(), "retention cap reached, deleted segment");
            }
            Some(dir) => {
                let file_name = |path: &Path| {
                    path.file_name()
                        .map(PathBuf::from)
                        .ok_or_else(|| BlockLogError::corruption("segment path has no file name"))
                };
                std::fs::rename(&log_path, dir.join(file_name(&log_path)?))?;
                std::fs::rename(&index_path, dir.join(file_name(&index_path)?))?;
                fsync_dir(dir)?;
                info!(
                    segment = %log_path.display(),
                    archive = %dir.display(),
                    "retention cap reached, archived segment"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_block, Compression};
    use crate::config::BlockLogConfig;
    use crate::store::BlockLog;
    use crate::test_support::{build_chain, sample_genesis};

    /// Builds a directory with rotated segments by driving a store with a
    /// small stride.
    fn rotated_dir(dir: &Path, count: usize, stride: u64) {
        let genesis = sample_genesis();
        let blocks = build_chain(&genesis, count);
        let config = BlockLogConfig {
            stride,
            ..BlockLogConfig::new(dir)
        };
        let mut log = BlockLog::open(config).expect("open");
        log.reset_genesis(genesis, blocks[0].clone(), Compression::None)
            .expect("reset");
        for block in &blocks[1..] {
            log.append(block.clone(), Compression::None).expect("append");
        }
    }

    #[test]
    fn scan_registers_rotated_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        rotated_dir(dir.path(), 5, 2);

        let mut catalog = SegmentCatalog::new(None, 10);
        catalog.scan(dir.path()).expect("scan");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.first_block_num(), Some(1));
        assert_eq!(
            catalog.chain_id(),
            Some(sample_genesis().compute_chain_id())
        );
    }

    #[test]
    fn reads_route_to_the_covering_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        rotated_dir(dir.path(), 5, 2);

        let mut catalog = SegmentCatalog::new(None, 10);
        catalog.scan(dir.path()).expect("scan");

        assert!(catalog.set_active_item(3));
        let (mut cur, version) = catalog.datastream_for_block(3).expect("cursor");
        let block = read_block(&mut cur, version, Some(3)).expect("decode");
        assert_eq!(block.block_num(), 3);

        // same segment rebinds cheaply, a different one switches
        assert!(catalog.set_active_item(4));
        assert!(catalog.set_active_item(1));
        let (mut cur, version) = catalog.datastream_for_block(1).expect("cursor");
        let block = read_block(&mut cur, version, Some(1)).expect("decode");
        assert_eq!(block.block_num(), 1);

        assert!(!catalog.set_active_item(100));
    }

    #[test]
    fn scan_rebuilds_a_stale_segment_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        rotated_dir(dir.path(), 3, 2);

        let index_path = dir.path().join("blocks-1-2.index");
        let reference = std::fs::read(&index_path).expect("read");
        std::fs::write(&index_path, &reference[..8]).expect("truncate");

        let mut catalog = SegmentCatalog::new(None, 10);
        catalog.scan(dir.path()).expect("scan");
        assert_eq!(std::fs::read(&index_path).expect("read"), reference);
        assert!(catalog.set_active_item(2));
    }

    #[test]
    fn retention_deletes_the_oldest_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        rotated_dir(dir.path(), 3, 1);

        let mut catalog = SegmentCatalog::new(None, 1);
        // scanning is unbounded; the cap applies on add
        catalog.scan(dir.path()).expect("scan");
        let next_first = 4;
        catalog
            .add(next_first, 4, dir.path().join(SegmentFileName::base(4, 4)))
            .expect("add");
        assert!(catalog.len() <= 1 + 1);
        assert!(!dir.path().join("blocks-1-1.log").exists());
    }

    #[test]
    fn retention_archives_when_a_dir_is_configured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("archive");
        std::fs::create_dir_all(&archive).expect("mkdir");
        rotated_dir(dir.path(), 2, 1);

        let mut catalog = SegmentCatalog::new(Some(archive.clone()), 1);
        catalog.scan(dir.path()).expect("scan");
        catalog
            .add(3, 3, dir.path().join(SegmentFileName::base(3, 3)))
            .expect("add");
        assert!(archive.join("blocks-1-1.log").exists());
        assert!(archive.join("blocks-1-1.index").exists());
        assert!(!dir.path().join("blocks-1-1.log").exists());
    }
}
