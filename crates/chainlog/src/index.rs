//! The block position index: a packed `[u64]` table mapping block ordinals to
//! entry offsets in the paired log file.

use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapMut};
use tracing::info;

use crate::codec::NPOS;
use crate::data::{BlockLogData, ReverseEntryPositions};
use crate::error::{BlockLogError, Result};
use crate::fs::create_fixed_size_file;

/// Read-only, memory-mapped view of a `blocks.index` file. An empty index
/// file is represented without a mapping, since zero-length maps are not a
/// thing.
pub struct BlockLogIndex {
    _file: File,
    mmap: Option<Mmap>,
}

impl BlockLogIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len % 8 != 0 {
            return Err(BlockLogError::corruption(format!(
                "the size of {} is not a multiple of 8",
                path.display()
            )));
        }
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { _file: file, mmap })
    }

    fn as_bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Number of positions in the index.
    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len() / 8
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Position of the nth block, zero-based. Callers must keep `n < len()`.
    pub fn nth(&self, n: usize) -> u64 {
        let start = n * 8;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.as_bytes()[start..start + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Position of the last block. Callers must keep the index nonempty.
    pub fn back(&self) -> u64 {
        self.nth(self.len() - 1)
    }

    /// Iterates positions in block-number order.
    pub fn positions(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).map(move |n| self.nth(n))
    }
}

/// Writes an index file back-to-front into a preallocated mapping, the order
/// the reverse back-pointer walk produces positions in.
pub struct IndexBuilder {
    mmap: MmapMut,
    write_offset: usize,
}

impl IndexBuilder {
    /// Creates `path` at exactly `num_blocks * 8` bytes and maps it for
    /// writing.
    pub fn create(path: &Path, num_blocks: u64) -> Result<Self> {
        let file = create_fixed_size_file(path, num_blocks * 8)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            write_offset: mmap.len(),
            mmap,
        })
    }

    /// Records the next position, filling the table from the back.
    pub fn push(&mut self, position: u64) {
        debug_assert!(self.write_offset >= 8, "index builder overfilled");
        self.write_offset -= 8;
        self.mmap[self.write_offset..self.write_offset + 8]
            .copy_from_slice(&position.to_le_bytes());
    }

    /// Flushes and unmaps the sink so readers can open the file.
    pub fn finish(self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Rebuilds `index_path` from the back-pointer chain of `log_path`.
///
/// The chain is authoritative: it steps over padding and pruning artifacts
/// without deserializing any block body, in one O(n) pass.
pub fn construct_index(log_path: &Path, index_path: &Path) -> Result<()> {
    info!(
        log = %log_path.display(),
        index = %index_path.display(),
        "constructing block index from log"
    );

    let log = BlockLogData::open(log_path)?;
    let num_blocks = log.num_blocks()?;
    info!(version = log.version(), num_blocks, "scanned block log");

    if num_blocks == 0 {
        create_fixed_size_file(index_path, 0)?;
        return Ok(());
    }

    info!(
        first_block_num = log.first_block_num(),
        last_block_num = log.last_block_num()?,
        "writing index"
    );

    let mut builder = IndexBuilder::create(index_path, num_blocks as u64)?;
    let mut walker = ReverseEntryPositions::new(log.data(), log.first_block_position());
    let mut blocks_found = 0u32;

    while blocks_found < num_blocks {
        let position = walker.value();
        if position == NPOS {
            break;
        }
        builder.push(position);
        walker.advance()?;
        blocks_found += 1;
    }

    if blocks_found != num_blocks {
        return Err(BlockLogError::malformed_entry(format!(
            "block log at '{}' claims {} blocks but the back pointer chain yielded {}",
            log_path.display(),
            num_blocks,
            blocks_found
        )));
    }

    builder.finish()
}

/// True when the index at `index_path` is consistent with `log`: it exists,
/// holds one position per block, and its last entry names the log's last
/// block position.
pub fn index_matches_data(index_path: &Path, log: &BlockLogData) -> Result<bool> {
    if !index_path.exists() {
        return Ok(false);
    }
    let size = crate::fs::file_size(index_path)?;
    if size % 8 != 0 || size / 8 != log.num_blocks()? as u64 {
        return Ok(false);
    }
    if size == 0 {
        return Ok(true);
    }
    let bytes = {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = File::open(index_path)?;
        file.seek(SeekFrom::End(-8))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        buf
    };
    Ok(u64::from_le_bytes(bytes) == log.last_block_position()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::config::BlockLogConfig;
    use crate::store::BlockLog;
    use crate::test_support::{build_chain, sample_genesis};

    fn populate(dir: &Path, count: usize) {
        let genesis = sample_genesis();
        let blocks = build_chain(&genesis, count);
        let mut log = BlockLog::open(BlockLogConfig::new(dir)).expect("open");
        log.reset_genesis(genesis, blocks[0].clone(), Compression::None)
            .expect("reset");
        for block in &blocks[1..] {
            log.append(block.clone(), Compression::None).expect("append");
        }
    }

    #[test]
    fn construct_index_matches_the_live_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        populate(dir.path(), 4);
        let log_path = dir.path().join("blocks.log");
        let index_path = dir.path().join("blocks.index");
        let rebuilt_path = dir.path().join("rebuilt.index");

        construct_index(&log_path, &rebuilt_path).expect("construct");
        let live = std::fs::read(&index_path).expect("read live");
        let rebuilt = std::fs::read(&rebuilt_path).expect("read rebuilt");
        assert_eq!(live, rebuilt);
        assert_eq!(rebuilt.len(), 4 * 8);
    }

    #[test]
    fn construct_index_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        populate(dir.path(), 6);
        let log_path = dir.path().join("blocks.log");
        let once = dir.path().join("once.index");
        let twice = dir.path().join("twice.index");

        construct_index(&log_path, &once).expect("first pass");
        construct_index(&log_path, &twice).expect("second pass");
        assert_eq!(
            std::fs::read(&once).expect("read"),
            std::fs::read(&twice).expect("read")
        );
    }

    #[test]
    fn index_view_reads_positions_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        populate(dir.path(), 3);
        let index = BlockLogIndex::open(&dir.path().join("blocks.index")).expect("open");
        assert_eq!(index.len(), 3);
        let positions: Vec<u64> = index.positions().collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(index.back(), positions[2]);
        assert_eq!(index.nth(0), positions[0]);
    }

    #[test]
    fn index_view_rejects_misaligned_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.index");
        std::fs::write(&path, [0u8; 12]).expect("write");
        assert!(BlockLogIndex::open(&path).is_err());
    }

    #[test]
    fn index_matches_data_detects_staleness() {
        let dir = tempfile::tempdir().expect("tempdir");
        populate(dir.path(), 3);
        let log = BlockLogData::open(&dir.path().join("blocks.log")).expect("open log");
        let index_path = dir.path().join("blocks.index");

        assert!(index_matches_data(&index_path, &log).expect("fresh"));

        // drop the last position: entry count no longer matches
        let bytes = std::fs::read(&index_path).expect("read");
        std::fs::write(&index_path, &bytes[..bytes.len() - 8]).expect("truncate");
        assert!(!index_matches_data(&index_path, &log).expect("stale"));

        assert!(!index_matches_data(&dir.path().join("missing.index"), &log).expect("missing"));
    }
}
