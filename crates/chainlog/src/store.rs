//! The block log facade.
//!
//! Owns the live `blocks.log` / `blocks.index` pair, serves random reads
//! across the live log and rotated segments, and rotates the live log into
//! the catalog when the head reaches a stride boundary. Single writer,
//! single thread: callers serialize externally.
//!
//! The live files are driven with positional I/O only. Read-only memory maps
//! are used for startup inspection and for rotated segments, never for the
//! file currently being written.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::chain::{BlockId, ChainId, GenesisState, SignedBlock, TransactionId};
use crate::codec::{
    self, offset_to_block_start, ChainContext, Compression, Cursor, Preamble, NPOS,
};
use crate::config::{BlockLogConfig, MAX_SUPPORTED_VERSION};
use crate::data::{read_u32_le, BlockLogData};
use crate::error::{BlockLogError, Result};
use crate::fs::{
    ensure_file_exists, file_size, fsync_dir, resize_file, SegmentFileName, INDEX_EXTENSION,
    INDEX_FILE_NAME, LOG_EXTENSION, LOG_FILE_NAME,
};
use crate::index::{construct_index, BlockLogIndex};
use crate::catalog::SegmentCatalog;

/// Append-only, versioned block log with a dense position index.
pub struct BlockLog {
    data_dir: PathBuf,
    log_path: PathBuf,
    index_path: PathBuf,
    log_file: File,
    index_file: File,
    catalog: SegmentCatalog,
    preamble: Option<Preamble>,
    head: Option<SignedBlock>,
    genesis_written: bool,
    stride: u64,
    default_version: u32,
}

impl BlockLog {
    /// Opens (or creates) the block log rooted at `data_dir`.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        archive_dir: Option<PathBuf>,
        stride: u64,
        max_retained_files: usize,
    ) -> Result<Self> {
        Self::open(BlockLogConfig {
            data_dir: data_dir.into(),
            archive_dir,
            stride,
            max_retained_files,
            ..BlockLogConfig::default()
        })
    }

    /// Opens (or creates) the block log described by `config`, running the
    /// startup consistency checks between the log and index files.
    pub fn open(config: BlockLogConfig) -> Result<Self> {
        let config = config.normalized();
        let data_dir = config.data_dir.clone();

        let fresh_dir = !data_dir.is_dir();
        if fresh_dir {
            std::fs::create_dir_all(&data_dir)?;
        }

        let archive_dir = match &config.archive_dir {
            Some(dir) if dir.is_relative() => Some(data_dir.join(dir)),
            other => other.clone(),
        };
        if let Some(dir) = &archive_dir {
            if !dir.is_dir() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let mut catalog = SegmentCatalog::new(archive_dir, config.max_retained_files);
        if !fresh_dir {
            catalog.scan(&data_dir)?;
        }

        let log_path = data_dir.join(LOG_FILE_NAME);
        let index_path = data_dir.join(INDEX_FILE_NAME);
        ensure_file_exists(&log_path)?;
        ensure_file_exists(&index_path)?;
        let log_size = file_size(&log_path)?;
        let index_size = file_size(&index_path)?;

        let mut preamble = None;
        let mut genesis_written = false;

        if log_size > 0 {
            info!("block log is nonempty");
            // scope the mapped views so they are gone before the live files
            // are resized or reopened for writing
            {
                let log_data = BlockLogData::open(&log_path)?;
                preamble = Some(log_data.preamble().clone());
                if let Some(chain_id) = catalog.chain_id() {
                    if chain_id != log_data.chain_id() {
                        return Err(BlockLogError::ChainIdMismatch(format!(
                            "block log file {} has a different chain id than the catalog",
                            log_path.display()
                        )));
                    }
                }
                genesis_written = true;

                if index_size > 0 {
                    info!("block index is nonempty");
                    let index = BlockLogIndex::open(&index_path)?;
                    if log_data.last_block_position()? != index.back() {
                        if !Self::recover_from_incomplete_head(&log_path, &log_data, &index)? {
                            info!(
                                "the last block positions in the log and index disagree, \
                                 reconstructing the index"
                            );
                            drop(index);
                            construct_index(&log_path, &index_path)?;
                        }
                    }
                } else {
                    info!("block index is empty, reconstructing it");
                    construct_index(&log_path, &index_path)?;
                }
            }
        } else if index_size > 0 {
            info!("block log is empty while the index is not, discarding the index");
            resize_file(&index_path, 0)?;
        }

        let log_file = OpenOptions::new().read(true).write(true).open(&log_path)?;
        let index_file = OpenOptions::new().read(true).write(true).open(&index_path)?;

        let mut store = Self {
            data_dir,
            log_path,
            index_path,
            log_file,
            index_file,
            catalog,
            preamble,
            head: None,
            genesis_written,
            stride: config.stride,
            default_version: config.default_version,
        };
        if file_size(&store.log_path)? > 0 {
            store.read_head()?;
        }
        Ok(store)
    }

    /// Trims a partial final entry left by a crash between the entry write
    /// and the index write. Returns true when the log was truncated to the
    /// end of the last indexed entry.
    fn recover_from_incomplete_head(
        log_path: &Path,
        log: &BlockLogData,
        index: &BlockLogIndex,
    ) -> Result<bool> {
        if log.version() < 4 {
            return Ok(false);
        }
        let back = index.back();
        if log.size() <= back + 4 {
            return Ok(false);
        }
        let Ok(entry_size) = read_u32_le(log.data(), back) else {
            return Ok(false);
        };
        let trimmed_size = back + entry_size as u64;
        if log.size() <= trimmed_size {
            return Ok(false);
        }
        let expected_block_num = log.first_block_num() + index.len() as u32 - 1;
        match log.light_validate(back, expected_block_num) {
            Ok(()) => {
                info!(
                    trimmed_size,
                    "the last block in the log is incomplete, trimming it"
                );
                resize_file(log_path, trimmed_size)?;
                Ok(true)
            }
            Err(err) => {
                warn!(error = %err, "could not trim the incomplete head");
                Ok(false)
            }
        }
    }

    /// The last appended block, if any block is in the live log.
    pub fn head(&self) -> Option<&SignedBlock> {
        self.head.as_ref()
    }

    /// Format version of the live log, once one has been written.
    pub fn version(&self) -> Option<u32> {
        self.preamble.as_ref().map(|p| p.version)
    }

    /// First block number retrievable from this log set: the catalog's
    /// lowest first block when rotated segments exist, the live preamble's
    /// otherwise.
    pub fn first_block_num(&self) -> u32 {
        if let Some(first) = self.catalog.first_block_num() {
            return first;
        }
        self.preamble
            .as_ref()
            .map(|p| p.first_block_num)
            .unwrap_or(1)
    }

    /// Chain id of the log set, once a preamble exists.
    pub fn chain_id(&self) -> Option<ChainId> {
        self.preamble
            .as_ref()
            .map(Preamble::chain_id)
            .or_else(|| self.catalog.chain_id())
    }

    /// Appends a finalized block, writes its position to the index, flushes
    /// both files, and rotates the live log when the block number lands on a
    /// stride boundary. Returns the entry's starting offset.
    pub fn append(&mut self, block: SignedBlock, compression: Compression) -> Result<u64> {
        if !self.genesis_written {
            return Err(BlockLogError::AppendBeforeReset);
        }
        let (version, first_block_num) = {
            let preamble = self.preamble.as_ref().ok_or(BlockLogError::AppendBeforeReset)?;
            (preamble.version, preamble.first_block_num)
        };

        let block_num = block.block_num();
        let pos = self.log_file.seek(SeekFrom::End(0))?;
        let index_pos = self.index_file.seek(SeekFrom::End(0))?;
        let expected = block_num
            .checked_sub(first_block_num)
            .map(|delta| 8 * delta as u64)
            .unwrap_or(u64::MAX);
        if index_pos != expected {
            return Err(BlockLogError::IndexDesync {
                expected,
                actual: index_pos,
            });
        }

        let buffer = if version >= 4 {
            codec::encode_entry_v4(&block, compression)?
        } else {
            if compression != Compression::None {
                return Err(BlockLogError::malformed_entry(
                    "legacy block log entries do not support compression",
                ));
            }
            codec::encode_entry_legacy(&block)
        };
        self.log_file.write_all(&buffer)?;
        self.log_file.write_all(&pos.to_le_bytes())?;
        self.index_file.write_all(&pos.to_le_bytes())?;
        self.flush()?;

        self.head = Some(block);
        if block_num as u64 % self.stride == 0 {
            self.split()?;
        }
        Ok(pos)
    }

    /// Truncates the log set and writes a fresh genesis preamble, then
    /// appends `first_block` as block 1.
    pub fn reset_genesis(
        &mut self,
        genesis: GenesisState,
        first_block: SignedBlock,
        compression: Compression,
    ) -> Result<u64> {
        self.write_reset(1, ChainContext::Genesis(genesis))?;
        self.append(first_block, compression)
    }

    /// Truncates the log set and writes a preamble carrying only the chain
    /// id, for logs that start past block 1 (snapshot provisioning).
    pub fn reset_chain_id(&mut self, chain_id: ChainId, first_block_num: u32) -> Result<()> {
        if first_block_num <= 1 {
            return Err(BlockLogError::invalid_args(
                "a block log starting from block 1 must be created from a genesis state",
            ));
        }
        if let Some(existing) = self.catalog.chain_id() {
            if existing != chain_id {
                return Err(BlockLogError::invalid_args(
                    "cannot reset the block log to a different chain id",
                ));
            }
        }
        self.write_reset(first_block_num, ChainContext::Id(chain_id))?;
        self.head = None;
        Ok(())
    }

    fn write_reset(&mut self, first_block_num: u32, chain_context: ChainContext) -> Result<()> {
        let version = self.default_version;
        if matches!(chain_context, ChainContext::Id(_)) && version < 3 {
            return Err(BlockLogError::invalid_args(format!(
                "block log version {version} cannot carry a bare chain id"
            )));
        }

        self.log_file.set_len(0)?;
        self.log_file.seek(SeekFrom::Start(0))?;
        self.index_file.set_len(0)?;
        self.index_file.seek(SeekFrom::Start(0))?;

        let preamble = Preamble {
            version,
            first_block_num,
            chain_context,
        };
        self.log_file.write_all(&preamble.encode())?;
        self.flush()?;
        self.preamble = Some(preamble);
        self.genesis_written = true;
        Ok(())
    }

    /// Reads the block numbered `block_num` from the live log or, failing
    /// that, from the catalog. `None` when no segment covers it.
    pub fn read_block_by_num(&mut self, block_num: u32) -> Result<Option<SignedBlock>> {
        let pos = self.block_position(block_num)?;
        if pos != NPOS {
            let version = self.live_version()?;
            let span = self.live_entry_span(block_num, pos)?;
            let mut cur = Cursor::new(&span);
            return Ok(Some(codec::read_block(&mut cur, version, Some(block_num))?));
        }
        if self.catalog.set_active_item(block_num) {
            let (mut cur, version) = self.catalog.datastream_for_block(block_num)?;
            return Ok(Some(codec::read_block(&mut cur, version, Some(block_num))?));
        }
        Ok(None)
    }

    /// Reads only the id of block `block_num`, decoding just its header.
    pub fn read_block_id_by_num(&mut self, block_num: u32) -> Result<Option<BlockId>> {
        let pos = self.block_position(block_num)?;
        if pos != NPOS {
            let version = self.live_version()?;
            let span = self.live_entry_span(block_num, pos)?;
            let mut cur = Cursor::new(&span);
            return Ok(Some(codec::read_block_id(&mut cur, version, block_num)?));
        }
        if self.catalog.set_active_item(block_num) {
            let (mut cur, version) = self.catalog.datastream_for_block(block_num)?;
            return Ok(Some(codec::read_block_id(&mut cur, version, block_num)?));
        }
        Ok(None)
    }

    /// Censors the context-free data of the listed transactions in block
    /// `block_num`, rewriting the block payload in place. Entry size,
    /// compression tag, back pointer, and all index positions are preserved.
    /// Returns how many transactions were actually pruned; ids that were
    /// pruned are removed from `ids`.
    pub fn prune_transactions(
        &mut self,
        block_num: u32,
        ids: &mut Vec<TransactionId>,
    ) -> Result<usize> {
        let version = self.live_version()?;
        if version < 4 {
            return Err(BlockLogError::UnsupportedVersion { version });
        }
        let pos = self.block_position(block_num)?;
        if pos == NPOS {
            return Err(BlockLogError::BlockNotFound(block_num));
        }

        let span = self.live_entry_span(block_num, pos)?;
        let mut cur = Cursor::new(&span);
        let (meta, mut block) = codec::read_entry_v4(&mut cur)?;
        if block.block_num() != block_num {
            return Err(BlockLogError::malformed_entry(
                "wrong block was read from the block log",
            ));
        }

        let mut num_pruned = 0usize;
        for trx in &mut block.transactions {
            if let Some(slot) = ids.iter().position(|id| *id == trx.id) {
                if trx.prune_all() {
                    ids.remove(slot);
                    num_pruned += 1;
                }
            }
        }

        if num_pruned > 0 {
            let block_offset = offset_to_block_start(version);
            let region_len = meta.size as u64 - block_offset - 8;
            let mut region = vec![0u8; region_len as usize];
            let mut packed = Vec::with_capacity(region.len());
            block.pack(&mut packed);
            if packed.len() > region.len() {
                return Err(BlockLogError::malformed_entry(
                    "pruned block does not fit its entry",
                ));
            }
            region[..packed.len()].copy_from_slice(&packed);
            self.log_file.seek(SeekFrom::Start(pos + block_offset))?;
            self.log_file.write_all(&region)?;
            self.log_file.sync_data()?;
        }
        Ok(num_pruned)
    }

    /// Position of `block_num` in the live log, or [`NPOS`] when the live
    /// range does not cover it.
    fn block_position(&mut self, block_num: u32) -> Result<u64> {
        let (head_num, first_block_num) = match (&self.head, &self.preamble) {
            (Some(head), Some(preamble)) => (head.block_num(), preamble.first_block_num),
            _ => return Ok(NPOS),
        };
        if block_num < first_block_num || block_num > head_num {
            return Ok(NPOS);
        }
        self.index_file
            .seek(SeekFrom::Start(8 * (block_num - first_block_num) as u64))?;
        let mut bytes = [0u8; 8];
        self.index_file.read_exact(&mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn live_version(&self) -> Result<u32> {
        self.preamble
            .as_ref()
            .map(|p| p.version)
            .ok_or(BlockLogError::AppendBeforeReset)
    }

    /// Reads the full byte span of the live entry holding `block_num`,
    /// trailing back pointer included. The span end is the next block's
    /// indexed position, or the file end for the head.
    fn live_entry_span(&mut self, block_num: u32, pos: u64) -> Result<Vec<u8>> {
        let (head_num, first_block_num) = match (&self.head, &self.preamble) {
            (Some(head), Some(preamble)) => (head.block_num(), preamble.first_block_num),
            _ => return Err(BlockLogError::BlockNotFound(block_num)),
        };
        let end = if block_num < head_num {
            self.index_file
                .seek(SeekFrom::Start(8 * (block_num + 1 - first_block_num) as u64))?;
            let mut bytes = [0u8; 8];
            self.index_file.read_exact(&mut bytes)?;
            u64::from_le_bytes(bytes)
        } else {
            self.log_file.seek(SeekFrom::End(0))?
        };
        self.read_span(pos, end)
    }

    fn read_span(&mut self, start: u64, end: u64) -> Result<Vec<u8>> {
        if end < start {
            return Err(BlockLogError::corruption(format!(
                "entry span [{start}, {end}) is inverted"
            )));
        }
        let mut buffer = vec![0u8; (end - start) as usize];
        self.log_file.seek(SeekFrom::Start(start))?;
        self.log_file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Decodes the head block by following the back pointer that ends the
    /// log file.
    fn read_head(&mut self) -> Result<()> {
        let size = self.log_file.seek(SeekFrom::End(0))?;
        self.log_file.seek(SeekFrom::Start(size - 8))?;
        let mut bytes = [0u8; 8];
        self.log_file.read_exact(&mut bytes)?;
        let pos = u64::from_le_bytes(bytes);
        if pos == NPOS {
            self.head = None;
            return Ok(());
        }
        let version = self.live_version()?;
        let span = self.read_span(pos, size)?;
        let mut cur = Cursor::new(&span);
        self.head = Some(codec::read_block(&mut cur, version, None)?);
        Ok(())
    }

    /// Rotates the live log and index into a `blocks-<first>-<last>` segment,
    /// registers it in the catalog, and starts a fresh live log whose
    /// preamble carries only the chain id.
    fn split(&mut self) -> Result<()> {
        let (first_block_num, chain_id) = {
            let preamble = self.preamble.as_ref().ok_or(BlockLogError::AppendBeforeReset)?;
            (preamble.first_block_num, preamble.chain_id())
        };
        let head_num = self
            .head
            .as_ref()
            .map(SignedBlock::block_num)
            .ok_or_else(|| BlockLogError::corruption("cannot split an empty block log"))?;

        info!(
            first_block_num,
            last_block_num = head_num,
            "splitting the block log"
        );

        let base_path = self.data_dir.join(SegmentFileName::base(first_block_num, head_num));
        self.catalog.add(first_block_num, head_num, base_path.clone())?;
        std::fs::rename(&self.log_path, base_path.with_extension(LOG_EXTENSION))?;
        std::fs::rename(&self.index_path, base_path.with_extension(INDEX_EXTENSION))?;
        fsync_dir(&self.data_dir)?;

        self.log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.log_path)?;
        self.index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.index_path)?;

        let preamble = Preamble {
            version: MAX_SUPPORTED_VERSION,
            first_block_num: head_num + 1,
            chain_context: ChainContext::Id(chain_id),
        };
        self.log_file.write_all(&preamble.encode())?;
        self.preamble = Some(preamble);
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.log_file.sync_data()?;
        self.index_file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_chain, sample_genesis};

    fn open_store(dir: &Path) -> BlockLog {
        BlockLog::open(BlockLogConfig::new(dir)).expect("open store")
    }

    #[test]
    fn append_requires_a_reset_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = open_store(dir.path());
        let blocks = build_chain(&sample_genesis(), 1);
        let err = log.append(blocks[0].clone(), Compression::None).unwrap_err();
        assert!(matches!(err, BlockLogError::AppendBeforeReset));
    }

    #[test]
    fn reset_then_append_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = sample_genesis();
        let blocks = build_chain(&genesis, 3);
        let mut log = open_store(dir.path());
        log.reset_genesis(genesis, blocks[0].clone(), Compression::None)
            .expect("reset");
        for block in &blocks[1..] {
            log.append(block.clone(), Compression::None).expect("append");
        }

        assert_eq!(log.head().map(SignedBlock::block_num), Some(3));
        assert_eq!(log.first_block_num(), 1);
        assert_eq!(log.version(), Some(MAX_SUPPORTED_VERSION));
        for block in &blocks {
            let read = log
                .read_block_by_num(block.block_num())
                .expect("read")
                .expect("present");
            assert_eq!(&read, block);
            let id = log
                .read_block_id_by_num(block.block_num())
                .expect("read id")
                .expect("present");
            assert_eq!(id, block.calculate_id());
        }
        assert_eq!(log.read_block_by_num(4).expect("read"), None);
    }

    #[test]
    fn out_of_order_append_is_an_index_desync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = sample_genesis();
        let blocks = build_chain(&genesis, 3);
        let mut log = open_store(dir.path());
        log.reset_genesis(genesis, blocks[0].clone(), Compression::None)
            .expect("reset");
        let err = log.append(blocks[2].clone(), Compression::None).unwrap_err();
        assert!(matches!(err, BlockLogError::IndexDesync { .. }));
    }

    #[test]
    fn reset_chain_id_rejects_block_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = open_store(dir.path());
        let err = log
            .reset_chain_id(sample_genesis().compute_chain_id(), 1)
            .unwrap_err();
        assert!(matches!(err, BlockLogError::InvalidTrimArgs(_)));
    }

    #[test]
    fn reset_chain_id_starts_a_partial_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = sample_genesis();
        let mut log = open_store(dir.path());
        log.reset_chain_id(genesis.compute_chain_id(), 100)
            .expect("reset");
        assert!(log.head().is_none());
        assert_eq!(log.first_block_num(), 100);
        assert_eq!(log.chain_id(), Some(genesis.compute_chain_id()));
    }

    #[test]
    fn reopen_restores_the_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let genesis = sample_genesis();
        let blocks = build_chain(&genesis, 2);
        {
            let mut log = open_store(dir.path());
            log.reset_genesis(genesis, blocks[0].clone(), Compression::None)
                .expect("reset");
            log.append(blocks[1].clone(), Compression::None).expect("append");
        }
        let mut log = open_store(dir.path());
        assert_eq!(log.head().map(SignedBlock::block_num), Some(2));
        assert_eq!(
            log.read_block_by_num(1).expect("read").expect("present"),
            blocks[0]
        );
    }
}
