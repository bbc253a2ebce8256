//! Read-only, memory-mapped view of one block log file.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use crate::chain::{BlockId, ChainId, GenesisState};
use crate::codec::{self, offset_to_block_start, Cursor, LogEntry, Preamble, NPOS};
use crate::error::{BlockLogError, Result};

pub(crate) fn read_u32_le(data: &[u8], pos: u64) -> Result<u32> {
    let pos = pos as usize;
    if pos + 4 > data.len() {
        return Err(BlockLogError::malformed_entry(format!(
            "read of 4 bytes at position {pos} is outside the log ({} bytes)",
            data.len()
        )));
    }
    Ok(u32::from_le_bytes([
        data[pos],
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
    ]))
}

pub(crate) fn read_u64_le(data: &[u8], pos: u64) -> Result<u64> {
    let pos = pos as usize;
    if pos + 8 > data.len() {
        return Err(BlockLogError::malformed_entry(format!(
            "read of 8 bytes at position {pos} is outside the log ({} bytes)",
            data.len()
        )));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    Ok(u64::from_le_bytes(bytes))
}

/// A block log file opened for reading: the whole file is mapped, the
/// preamble parsed once, and block boundaries derived on demand from the
/// entry framing and the trailing back-pointer chain.
pub struct BlockLogData {
    _file: File,
    mmap: Mmap,
    preamble: Preamble,
    first_block_pos: u64,
}

impl BlockLogData {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let mut cur = Cursor::new(&mmap);
        let preamble = Preamble::decode(&mut cur)?;
        let first_block_pos = cur.tellp();
        Ok(Self {
            _file: file,
            mmap,
            preamble,
            first_block_pos,
        })
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    #[inline]
    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.preamble.version
    }

    #[inline]
    pub fn first_block_num(&self) -> u32 {
        self.preamble.first_block_num
    }

    pub fn chain_id(&self) -> ChainId {
        self.preamble.chain_id()
    }

    pub fn genesis_state(&self) -> Option<&GenesisState> {
        self.preamble.genesis_state()
    }

    /// Offset of the first entry (right past the preamble).
    #[inline]
    pub fn first_block_position(&self) -> u64 {
        self.first_block_pos
    }

    /// Offset of the last entry, read from the back pointer that ends the
    /// file. For an entry-less log this is the totem, i.e. [`NPOS`].
    pub fn last_block_position(&self) -> Result<u64> {
        read_u64_le(self.data(), self.size() - 8)
    }

    pub fn last_block_num(&self) -> Result<u32> {
        self.block_num_at(self.last_block_position()?)
    }

    pub fn num_blocks(&self) -> Result<u32> {
        if self.first_block_pos == self.size() {
            return Ok(0);
        }
        Ok(self.last_block_num()? - self.first_block_num() + 1)
    }

    /// Number of the block whose entry starts at `position`, derived without
    /// deserializing anything: the packed header stores the previous block's
    /// number big-endian at offset 14.
    pub fn block_num_at(&self, position: u64) -> Result<u32> {
        if position > self.size() {
            return Err(BlockLogError::malformed_entry(format!(
                "invalid block position {position}"
            )));
        }
        let blknum_offset = position + 14 + offset_to_block_start(self.version());
        let pos = blknum_offset as usize;
        if pos + 4 > self.data().len() {
            return Err(BlockLogError::malformed_entry(format!(
                "block entry at position {position} is truncated"
            )));
        }
        let prev = u32::from_be_bytes([
            self.data()[pos],
            self.data()[pos + 1],
            self.data()[pos + 2],
            self.data()[pos + 3],
        ]);
        Ok(prev + 1)
    }

    /// Cursor over the file contents starting at `pos`. Positions reported
    /// by the cursor are relative to `pos`; a position past the end yields an
    /// empty cursor, so a stale index surfaces as a decode error.
    pub fn cursor_at(&self, pos: u64) -> Cursor<'_> {
        let start = (pos as usize).min(self.data().len());
        Cursor::new(&self.data()[start..])
    }

    /// Cursor over the whole file, positioned on the first entry, reporting
    /// absolute file offsets.
    pub fn entries_cursor(&self) -> Result<Cursor<'_>> {
        let mut cur = Cursor::new(self.data());
        cur.skip(self.first_block_pos as usize)?;
        Ok(cur)
    }

    /// Checks the entry at `pos` without deserializing the block: the derived
    /// block number must match, and on v4 the trailing back pointer must
    /// point back at `pos`.
    pub fn light_validate(&self, pos: u64, expected_block_num: u32) -> Result<()> {
        let actual = self.block_num_at(pos)?;
        if actual != expected_block_num {
            return Err(BlockLogError::malformed_entry(format!(
                "at position {pos} expected block {expected_block_num} but found {actual}"
            )));
        }
        if self.version() >= 4 {
            let entry_size = read_u32_le(self.data(), pos)?;
            let back = read_u64_le(self.data(), pos + entry_size as u64 - 8)?;
            if back != pos {
                return Err(BlockLogError::malformed_entry(format!(
                    "the entry of block {actual} does not end with its own position \
                     (found {back}, expected {pos})"
                )));
            }
        }
        Ok(())
    }
}

/// Fully decodes the entry under the cursor and checks its framing.
///
/// Non-contiguous numbers and broken `previous` links are logged but
/// tolerated; a decode failure surfaces as [`BlockLogError::BadBlock`], and a
/// back pointer that does not match the entry start is a hard error. The
/// cursor must report absolute file offsets.
pub fn full_validate_entry(
    cur: &mut Cursor<'_>,
    version: u32,
    previous_block_num: u32,
    previous_block_id: &BlockId,
) -> Result<(u32, BlockId)> {
    let pos = cur.tellp();

    let entry: LogEntry =
        codec::read_entry(cur, version).map_err(BlockLogError::bad_block)?;

    let header = entry.header();
    let id = header.calculate_id();
    let block_num = id.num_from_id();

    if block_num != previous_block_num + 1 {
        warn!(
            block_num,
            previous_block_num,
            block_id = %id,
            "block skips numbers relative to the previous block in the log"
        );
    }

    if *previous_block_id != BlockId::default() && *previous_block_id != header.previous {
        warn!(
            block_num,
            expected = %previous_block_id,
            actual = %header.previous,
            "block does not link back to the previous block"
        );
    }

    let mut trailing = NPOS;
    if cur.remaining() >= 8 {
        trailing = cur.read_u64()?;
    }
    if trailing != pos {
        return Err(BlockLogError::malformed_entry(format!(
            "the back pointer of block {block_num} is {trailing}, expected {pos}"
        )));
    }

    Ok((block_num, id))
}

/// Walks the trailing back-pointer chain of a log from the last entry toward
/// the first. [`value`](Self::value) yields [`NPOS`] once the walk passes the
/// first entry.
pub struct ReverseEntryPositions<'a> {
    data: &'a [u8],
    begin_position: u64,
    current_position: u64,
}

impl<'a> ReverseEntryPositions<'a> {
    /// Starts a walk at the back pointer that ends the file. `data` must be a
    /// whole log file; `first_block_pos` its first entry offset.
    pub fn new(data: &'a [u8], first_block_pos: u64) -> Self {
        debug_assert!(first_block_pos >= 8 && data.len() as u64 >= first_block_pos);
        Self {
            data,
            begin_position: first_block_pos - 8,
            current_position: data.len() as u64 - 8,
        }
    }

    /// Position stored in the back pointer under the walk, or [`NPOS`] once
    /// the walk has passed the first entry.
    pub fn value(&self) -> u64 {
        if self.current_position <= self.begin_position {
            return NPOS;
        }
        let pos = self.current_position as usize;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[pos..pos + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Steps to the previous entry's back pointer.
    pub fn advance(&mut self) -> Result<()> {
        if self.current_position <= self.begin_position
            || self.current_position >= self.data.len() as u64
        {
            return Err(BlockLogError::malformed_entry(format!(
                "back pointer walk at position {} is outside the range ({}, {})",
                self.current_position,
                self.begin_position,
                self.data.len()
            )));
        }
        let next = self.value().wrapping_sub(8);
        if next > self.begin_position && next + 8 > self.data.len() as u64 {
            return Err(BlockLogError::malformed_entry(format!(
                "back pointer chain leads to position {} outside the range ({}, {})",
                next,
                self.begin_position,
                self.data.len()
            )));
        }
        self.current_position = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::config::BlockLogConfig;
    use crate::store::BlockLog;
    use crate::test_support::{build_chain, sample_genesis};

    fn populated_log(dir: &Path, count: usize) -> Vec<crate::chain::SignedBlock> {
        let genesis = sample_genesis();
        let blocks = build_chain(&genesis, count);
        let mut log = BlockLog::open(BlockLogConfig::new(dir)).expect("open");
        log.reset_genesis(genesis, blocks[0].clone(), Compression::None)
            .expect("reset");
        for block in &blocks[1..] {
            log.append(block.clone(), Compression::None).expect("append");
        }
        blocks
    }

    #[test]
    fn view_reports_block_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        populated_log(dir.path(), 3);
        let data = BlockLogData::open(&dir.path().join("blocks.log")).expect("open view");

        assert_eq!(data.version(), 4);
        assert_eq!(data.first_block_num(), 1);
        assert_eq!(data.last_block_num().expect("last"), 3);
        assert_eq!(data.num_blocks().expect("num"), 3);
        assert_eq!(data.chain_id(), sample_genesis().compute_chain_id());
        assert!(data.genesis_state().is_some());
    }

    #[test]
    fn reverse_walk_visits_every_entry_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        populated_log(dir.path(), 5);
        let data = BlockLogData::open(&dir.path().join("blocks.log")).expect("open view");

        let mut walker = ReverseEntryPositions::new(data.data(), data.first_block_position());
        let mut positions = Vec::new();
        while walker.value() != NPOS {
            positions.push(walker.value());
            walker.advance().expect("advance");
        }

        assert_eq!(positions.len(), 5);
        assert!(positions.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(positions[0], data.last_block_position().expect("last"));
        assert_eq!(*positions.last().expect("first"), data.first_block_position());
        for (i, pos) in positions.iter().rev().enumerate() {
            assert_eq!(data.block_num_at(*pos).expect("num"), i as u32 + 1);
        }
    }

    #[test]
    fn light_validate_catches_wrong_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        populated_log(dir.path(), 2);
        let data = BlockLogData::open(&dir.path().join("blocks.log")).expect("open view");
        let first = data.first_block_position();
        data.light_validate(first, 1).expect("valid");
        assert!(data.light_validate(first, 2).is_err());
    }

    #[test]
    fn full_validate_walks_the_whole_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocks = populated_log(dir.path(), 4);
        let data = BlockLogData::open(&dir.path().join("blocks.log")).expect("open view");

        let mut cur = data.entries_cursor().expect("cursor");
        let mut block_num = data.first_block_num() - 1;
        let mut block_id = BlockId::default();
        while cur.remaining() > 0 {
            let (num, id) =
                full_validate_entry(&mut cur, data.version(), block_num, &block_id).expect("entry");
            block_num = num;
            block_id = id;
        }
        assert_eq!(block_num, 4);
        assert_eq!(block_id, blocks[3].calculate_id());
    }
}
