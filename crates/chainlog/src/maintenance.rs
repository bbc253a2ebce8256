//! Offline tools for a block log directory: index reconstruction, tail
//! repair, head and tail trimming, spot validation, and extraction of the
//! embedded chain identity.
//!
//! Everything here operates on closed log sets. Nothing may hold the live
//! files open while these run.

use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, info};

use crate::chain::{BlockId, ChainId, GenesisState};
use crate::codec::{ChainContext, Preamble, PREAMBLE_CHAIN_ID_BYTES};
use crate::config::MAX_SUPPORTED_VERSION;
use crate::data::{full_validate_entry, BlockLogData};
use crate::error::{BlockLogError, Result};
use crate::fs::{
    create_fixed_size_file, fsync_dir, resize_file, timestamp_suffix, SegmentFileName,
    INDEX_FILE_NAME, LOG_FILE_NAME,
};
use crate::index::{BlockLogIndex, IndexBuilder};

pub use crate::index::construct_index;

/// Paired read-only view of a directory's `blocks.log` and `blocks.index`.
struct LogPair {
    log_path: PathBuf,
    index_path: PathBuf,
    data: BlockLogData,
    index: BlockLogIndex,
}

impl LogPair {
    fn open(block_dir: &Path) -> Result<Self> {
        let log_path = block_dir.join(LOG_FILE_NAME);
        let index_path = block_dir.join(INDEX_FILE_NAME);
        let data = BlockLogData::open(&log_path)?;
        let index = BlockLogIndex::open(&index_path)?;

        let log_num_blocks = data.num_blocks()?;
        let index_num_blocks = index.len() as u32;
        if log_num_blocks != index_num_blocks {
            return Err(BlockLogError::corruption(format!(
                "{} says it has {log_num_blocks} blocks which disagrees with the \
                 {index_num_blocks} indicated by {}",
                log_path.display(),
                index_path.display()
            )));
        }
        Ok(Self {
            log_path,
            index_path,
            data,
            index,
        })
    }
}

/// True when `data_dir` holds a complete log set.
pub fn exists(data_dir: &Path) -> bool {
    data_dir.join(LOG_FILE_NAME).exists() && data_dir.join(INDEX_FILE_NAME).exists()
}

/// Salvages the readable prefix of a damaged log.
///
/// The whole directory is moved aside to `<data_dir>-<timestamp>` and a fresh
/// one is rebuilt from the backup by re-validating every entry. When a block
/// body fails to decode, the unreadable tail is spilled to
/// `blocks-bad-tail-<timestamp>.log` for inspection and the prefix up to the
/// last good entry is kept. Returns the backup directory.
pub fn repair_log(data_dir: &Path, truncate_at_block: u32) -> Result<PathBuf> {
    info!(dir = %data_dir.display(), "recovering block log");
    if !data_dir.is_dir() || !data_dir.join(LOG_FILE_NAME).is_file() {
        return Err(BlockLogError::LogNotFound(data_dir.to_path_buf()));
    }
    let truncate_at_block = if truncate_at_block == 0 {
        u32::MAX
    } else {
        truncate_at_block
    };

    let now = timestamp_suffix();
    let blocks_dir = data_dir.canonicalize()?;
    let dir_name = blocks_dir
        .file_name()
        .ok_or_else(|| BlockLogError::invalid_args("cannot repair the filesystem root"))?
        .to_string_lossy()
        .into_owned();
    let parent = blocks_dir
        .parent()
        .ok_or_else(|| BlockLogError::invalid_args("cannot repair the filesystem root"))?;
    let backup_dir = parent.join(format!("{dir_name}-{now}"));
    if backup_dir.exists() {
        return Err(BlockLogError::BackupDirExists(backup_dir));
    }

    std::fs::rename(&blocks_dir, &backup_dir)?;
    info!(backup = %backup_dir.display(), "moved existing blocks directory to backup location");
    std::fs::create_dir_all(&blocks_dir)?;

    let log = BlockLogData::open(&backup_dir.join(LOG_FILE_NAME))?;
    let mut cur = log.entries_cursor()?;
    let mut pos = cur.tellp();
    let mut block_num = log.first_block_num() - 1;
    let mut block_id = BlockId::default();
    let mut error_msg: Option<String> = None;

    while cur.remaining() > 0 && block_num < truncate_at_block {
        match full_validate_entry(&mut cur, log.version(), block_num, &block_id) {
            Ok((num, id)) => {
                block_num = num;
                block_id = id;
                if block_num % 1000 == 0 {
                    info!(block_num, "verified block");
                }
                pos = cur.tellp();
            }
            Err(BlockLogError::BadBlock { inner }) => {
                write_bad_tail(&blocks_dir, &now, block_num, &log.data()[pos as usize..])?;
                error_msg = Some(inner.to_string());
                break;
            }
            Err(err) => {
                error_msg = Some(err.to_string());
                break;
            }
        }
    }

    std::fs::write(blocks_dir.join(LOG_FILE_NAME), &log.data()[..pos as usize])?;
    fsync_dir(&blocks_dir)?;

    if let Some(msg) = &error_msg {
        info!(
            block_num,
            next_block_num = block_num + 1,
            error = %msg,
            "recovered only a prefix of the block log"
        );
    } else if block_num == truncate_at_block && pos < log.size() {
        info!(truncate_at_block, "stopped recovery early at the requested block");
    } else {
        info!(block_num, "existing block log was undamaged, recovered all blocks");
    }
    Ok(backup_dir)
}

fn write_bad_tail(blocks_dir: &Path, now: &str, block_num: u32, bytes: &[u8]) -> Result<()> {
    let tail_path = blocks_dir.join(format!("blocks-bad-tail-{now}.log"));
    std::fs::write(&tail_path, bytes)?;
    info!(
        block_num = block_num + 1,
        path = %tail_path.display(),
        "wrote the unreadable tail of the block log"
    );
    Ok(())
}

/// Drops every block before `truncate_at_block`, rewriting the log under a
/// chain-id preamble with all back pointers and index positions shifted.
///
/// The replacement files are built in `temp_dir` and swapped in by renames;
/// the originals end up as `old.log` / `old.index` in `temp_dir`. Returns
/// false when there is nothing to trim (`truncate_at_block` at or before the
/// first block, or past the last).
pub fn trim_front(block_dir: &Path, temp_dir: &Path, truncate_at_block: u32) -> Result<bool> {
    if block_dir == temp_dir {
        return Err(BlockLogError::invalid_args(
            "block_dir and temp_dir must be different directories",
        ));
    }
    info!(
        dir = %block_dir.display(),
        truncate_at_block,
        "trimming all blocks before the requested number"
    );

    let pair = LogPair::open(block_dir)?;
    let first_block_num = pair.data.first_block_num();
    let last_block_num = pair.data.last_block_num()?;
    if truncate_at_block <= first_block_num {
        debug!(truncate_at_block, "there are no blocks to trim");
        return Ok(false);
    }
    if truncate_at_block > last_block_num {
        debug!(truncate_at_block, "trimming would drop every block");
        return Ok(false);
    }

    std::fs::create_dir_all(temp_dir)?;

    // v1-v3 entries keep their framing, so those logs can only be carried up
    // to the v3 preamble; v4 logs are rewritten at the current version
    let version = if pair.data.version() < 4 {
        3
    } else {
        MAX_SUPPORTED_VERSION
    };
    let preamble = Preamble {
        version,
        first_block_num: truncate_at_block,
        chain_context: ChainContext::Id(pair.data.chain_id()),
    };
    let preamble_bytes = preamble.encode();
    debug_assert_eq!(preamble_bytes.len() as u64, PREAMBLE_CHAIN_ID_BYTES);

    let num_blocks_to_trim = truncate_at_block - first_block_num;
    let first_kept_block_pos = pair.index.nth(num_blocks_to_trim as usize);
    let nbytes_to_trim = first_kept_block_pos - PREAMBLE_CHAIN_ID_BYTES;
    let new_size = pair.data.size() - nbytes_to_trim;

    let new_log_path = temp_dir.join(LOG_FILE_NAME);
    let new_log_file = create_fixed_size_file(&new_log_path, new_size)?;
    let mut new_log = unsafe { MmapMut::map_mut(&new_log_file)? };
    new_log[..preamble_bytes.len()].copy_from_slice(&preamble_bytes);
    new_log[preamble_bytes.len()..]
        .copy_from_slice(&pair.data.data()[first_kept_block_pos as usize..]);

    let new_index_path = temp_dir.join(INDEX_FILE_NAME);
    let blocks_kept = pair.index.len() as u64 - num_blocks_to_trim as u64;
    let mut index = IndexBuilder::create(&new_index_path, blocks_kept)?;

    // walk the copied entries back to front, shifting every back pointer into
    // the new file's coordinates and emitting the shifted positions
    let begin_position = PREAMBLE_CHAIN_ID_BYTES - 8;
    let mut current = new_size - 8;
    let mut filled = 0u64;
    while current > begin_position {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&new_log[current as usize..current as usize + 8]);
        let old_pos = u64::from_le_bytes(bytes);
        if old_pos < first_kept_block_pos || old_pos >= pair.data.size() {
            return Err(BlockLogError::malformed_entry(format!(
                "back pointer {old_pos} is outside the trimmed log"
            )));
        }
        if filled == blocks_kept {
            return Err(BlockLogError::malformed_entry(
                "back pointer chain yields more blocks than the index",
            ));
        }
        let new_pos = old_pos - nbytes_to_trim;
        index.push(new_pos);
        filled += 1;
        new_log[current as usize..current as usize + 8].copy_from_slice(&new_pos.to_le_bytes());
        current = new_pos - 8;
    }
    if filled != blocks_kept {
        return Err(BlockLogError::malformed_entry(format!(
            "back pointer chain ended after {filled} of {blocks_kept} kept blocks"
        )));
    }

    new_log.flush()?;
    drop(new_log);
    drop(new_log_file);
    index.finish()?;

    std::fs::rename(&pair.log_path, temp_dir.join("old.log"))?;
    std::fs::rename(&new_log_path, &pair.log_path)?;
    std::fs::rename(&pair.index_path, temp_dir.join("old.index"))?;
    std::fs::rename(&new_index_path, &pair.index_path)?;
    fsync_dir(block_dir)?;
    fsync_dir(temp_dir)?;

    Ok(true)
}

/// Drops every block after `n` by resizing the log and index in place.
/// Returns 0 on success, 1 when `n` precedes the first block (the trim would
/// delete everything), 2 when `n` is past the last block (nothing to do).
pub fn trim_end(block_dir: &Path, n: u32) -> Result<i32> {
    let pair = LogPair::open(block_dir)?;
    info!(
        dir = %block_dir.display(),
        n,
        "trimming all blocks after the requested number"
    );

    let first_block_num = pair.data.first_block_num();
    let last_block_num = pair.data.last_block_num()?;
    if n < first_block_num {
        debug!(n, "every block is after the requested number, doing nothing");
        return Ok(1);
    }
    if n > last_block_num {
        debug!(n, "there are no blocks after the requested number, doing nothing");
        return Ok(2);
    }

    let to_trim_block_index = (n + 1 - first_block_num) as usize;
    let to_trim_block_position = if to_trim_block_index == pair.index.len() {
        pair.data.size()
    } else {
        pair.index.nth(to_trim_block_index)
    };
    let index_file_size = to_trim_block_index as u64 * 8;

    let (log_path, index_path) = (pair.log_path.clone(), pair.index_path.clone());
    drop(pair);

    resize_file(&log_path, to_trim_block_position)?;
    resize_file(&index_path, index_file_size)?;
    info!(index_file_size, "trimmed the block log and index");
    Ok(0)
}

/// Cross-checks the log and index block counts, then spot-validates the
/// entry framing every `interval` blocks. `interval` zero picks roughly an
/// eighth of the log.
pub fn smoke_test(block_dir: &Path, interval: u32) -> Result<()> {
    let pair = LogPair::open(block_dir)?;
    info!("blocks.log and blocks.index agree on the number of blocks");

    let num_blocks = pair.index.len() as u32;
    let interval = if interval == 0 {
        ((num_blocks + 7) >> 3).max(1)
    } else {
        interval
    };

    let mut expected_block_num = pair.data.first_block_num();
    let mut ordinal = 0usize;
    while ordinal < pair.index.len() {
        pair.data
            .light_validate(pair.index.nth(ordinal), expected_block_num)?;
        ordinal += interval as usize;
        expected_block_num = expected_block_num.wrapping_add(interval);
    }
    Ok(())
}

/// Pulls the genesis state out of a log directory. After a split the live
/// log no longer embeds it, so a rotated segment starting at block 1 is
/// preferred over `blocks.log`.
pub fn extract_genesis_state(block_dir: &Path) -> Result<Option<GenesisState>> {
    let mut path = block_dir.join(LOG_FILE_NAME);
    for dir_entry in std::fs::read_dir(block_dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(parsed) = SegmentFileName::parse(name) {
            if parsed.first_block_num == 1 {
                path = dir_entry.path();
            }
        }
    }
    Ok(BlockLogData::open(&path)?.genesis_state().cloned())
}

/// Chain id of the live log in `data_dir`.
pub fn extract_chain_id(data_dir: &Path) -> Result<ChainId> {
    Ok(BlockLogData::open(&data_dir.join(LOG_FILE_NAME))?.chain_id())
}
