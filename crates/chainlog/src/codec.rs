//! Binary framing for the block log: the preamble that heads every log file
//! and the per-block entry formats.
//!
//! Format history:
//! * Version 1: complete log from genesis; entries are bare serialized blocks.
//! * Version 2: adds an optional partial log in the form of a
//!   `first_block_num` written right after the version, and the totem
//!   separator between preamble and entries.
//! * Version 3: logs not starting at block 1 carry a bare chain id instead of
//!   the full genesis state.
//! * Version 4: entries gain a size prefix and compression tag, and block
//!   payloads may be padded so they can be rewritten in place after pruning.
//!
//! Every entry, in every version, ends with a `u64` equal to its own starting
//! offset. That trailing back pointer gives O(1) reverse traversal and is
//! what the index is rebuilt from.

use serde::{Deserialize, Serialize};

use crate::chain::{BlockHeader, BlockId, ChainId, GenesisState, SignedBlock};
use crate::config::is_supported_version;
use crate::error::{BlockLogError, Result};

/// Sentinel for "no position"; also the totem separating preamble from
/// entries in v2+ log files.
pub const NPOS: u64 = u64::MAX;

/// Byte length of a preamble that embeds a chain id (the v3/v4 layout):
/// version, first block number, chain id, totem.
pub const PREAMBLE_CHAIN_ID_BYTES: u64 = 4 + 4 + 32 + 8;

/// Bytes from the start of a v4 entry to the start of the block payload
/// (size prefix plus compression tag).
pub(crate) const ENTRY_HEADER_BYTES: usize = 5;

/// Offset from the start of a serialized entry to the block bytes.
#[inline]
pub fn offset_to_block_start(version: u32) -> u64 {
    if version >= 4 {
        ENTRY_HEADER_BYTES as u64
    } else {
        0
    }
}

/// True when a preamble with this version and first block embeds the full
/// genesis state.
#[inline]
pub fn contains_genesis_state(version: u32, first_block_num: u32) -> bool {
    version < 3 || first_block_num == 1
}

/// True when a preamble with this version and first block carries a bare
/// chain id.
#[inline]
pub fn contains_chain_id(version: u32, first_block_num: u32) -> bool {
    version >= 3 && first_block_num > 1
}

/// Read-only cursor over a byte slice with `tellp`-style positions.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position in bytes from the start of the underlying slice.
    #[inline]
    pub fn tellp(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(BlockLogError::malformed_entry(format!(
                "unexpected end of data: need {len} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }
}

/// Compression applied to a v4 entry payload. Only `None` is supported; the
/// other tags are recognized so they can be rejected with a useful error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::None
    }
}

/// Either an embedded genesis state or a bare chain id, depending on version
/// and first block number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainContext {
    Genesis(GenesisState),
    Id(ChainId),
}

impl ChainContext {
    pub fn chain_id(&self) -> ChainId {
        match self {
            Self::Genesis(state) => state.compute_chain_id(),
            Self::Id(id) => *id,
        }
    }
}

/// Header of a log file: version, first block number, and chain context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub version: u32,
    pub first_block_num: u32,
    pub chain_context: ChainContext,
}

impl Preamble {
    pub fn chain_id(&self) -> ChainId {
        self.chain_context.chain_id()
    }

    pub fn genesis_state(&self) -> Option<&GenesisState> {
        match &self.chain_context {
            ChainContext::Genesis(state) => Some(state),
            ChainContext::Id(_) => None,
        }
    }

    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let version = cur.read_u32()?;
        if !is_supported_version(version) {
            return Err(BlockLogError::UnsupportedVersion { version });
        }

        let first_block_num = if version == 1 { 1 } else { cur.read_u32()? };

        let chain_context = if contains_genesis_state(version, first_block_num) {
            ChainContext::Genesis(GenesisState::unpack(cur)?)
        } else if contains_chain_id(version, first_block_num) {
            ChainContext::Id(ChainId(cur.read_array()?))
        } else {
            return Err(BlockLogError::malformed_preamble(format!(
                "version {version} with first_block_num {first_block_num} carries neither \
                 a genesis state nor a chain id"
            )));
        };

        if version != 1 {
            let totem = cur.read_u64()?;
            if totem != NPOS {
                return Err(BlockLogError::malformed_preamble(format!(
                    "expected separator {NPOS:#x} between preamble and entries, found {totem:#x}"
                )));
            }
        }

        Ok(Self {
            version,
            first_block_num,
            chain_context,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        if self.version == 1 {
            debug_assert!(
                matches!(&self.chain_context, ChainContext::Genesis(_)),
                "v1 preambles embed a genesis state"
            );
            match &self.chain_context {
                ChainContext::Genesis(state) => state.pack(&mut out),
                ChainContext::Id(id) => out.extend_from_slice(&id.0),
            }
            return out;
        }
        out.extend_from_slice(&self.first_block_num.to_le_bytes());
        match &self.chain_context {
            ChainContext::Genesis(state) => state.pack(&mut out),
            ChainContext::Id(id) => out.extend_from_slice(&id.0),
        }
        out.extend_from_slice(&NPOS.to_le_bytes());
        out
    }
}

/// Framing metadata of a v4 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// Bytes from the entry start to the start of the next entry, inclusive
    /// of the trailing back pointer.
    pub size: u32,
    pub compression: Compression,
}

/// A decoded entry, tagged by framing generation. The public API always
/// yields the canonical [`SignedBlock`]; this variant only surfaces in
/// validation and repair paths.
#[derive(Debug, Clone)]
pub enum LogEntry {
    Legacy(SignedBlock),
    V4(EntryMeta, SignedBlock),
}

impl LogEntry {
    pub fn block(&self) -> &SignedBlock {
        match self {
            Self::Legacy(block) | Self::V4(_, block) => block,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.block().header
    }
}

/// Decodes a v4 entry, leaving the cursor on the trailing back pointer.
///
/// The payload may be shorter than the declared region when transactions
/// were pruned after the entry was written; the remainder is padding and is
/// skipped using `size` as the authority.
pub fn read_entry_v4(cur: &mut Cursor<'_>) -> Result<(EntryMeta, SignedBlock)> {
    let start = cur.tellp();
    let size = cur.read_u32()?;
    let tag = cur.read_u8()?;
    let compression = Compression::from_tag(tag)
        .ok_or_else(|| BlockLogError::malformed_entry(format!("unknown compression tag {tag}")))?;
    if compression != Compression::None {
        return Err(BlockLogError::malformed_entry(
            "only \"none\" compression is supported",
        ));
    }
    let block = SignedBlock::unpack(cur)?;
    let consumed = cur.tellp() - start;
    let bytes_to_skip = size as i64 - 8 - consumed as i64;
    if bytes_to_skip < 0 {
        return Err(BlockLogError::malformed_entry(format!(
            "entry size {size} is smaller than its serialized block"
        )));
    }
    cur.skip(bytes_to_skip as usize)?;
    Ok((
        EntryMeta {
            size,
            compression,
        },
        block,
    ))
}

/// Decodes a legacy (v1-v3) entry, leaving the cursor on the trailing back
/// pointer.
pub fn read_entry_legacy(cur: &mut Cursor<'_>) -> Result<SignedBlock> {
    SignedBlock::unpack(cur)
}

/// Decodes one entry in the framing of `version`.
pub fn read_entry(cur: &mut Cursor<'_>, version: u32) -> Result<LogEntry> {
    if version >= 4 {
        let (meta, block) = read_entry_v4(cur)?;
        Ok(LogEntry::V4(meta, block))
    } else {
        Ok(LogEntry::Legacy(read_entry_legacy(cur)?))
    }
}

/// Encodes a v4 entry without its trailing back pointer: size, compression
/// tag, then the block padded out to its maximum pruned pack size. The
/// writer appends the starting position afterwards.
pub fn encode_entry_v4(block: &SignedBlock, compression: Compression) -> Result<Vec<u8>> {
    if compression != Compression::None {
        return Err(BlockLogError::malformed_entry(
            "only \"none\" compression is supported",
        ));
    }
    let padded_len = ENTRY_HEADER_BYTES + block.max_pruned_pack_size();
    let mut out = Vec::with_capacity(padded_len);
    let size = (padded_len + 8) as u32;
    out.extend_from_slice(&size.to_le_bytes());
    out.push(compression.tag());
    block.pack(&mut out);
    debug_assert!(out.len() <= padded_len);
    out.resize(padded_len, 0);
    Ok(out)
}

/// Encodes a legacy entry without its trailing back pointer.
pub fn encode_entry_legacy(block: &SignedBlock) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.pack_size());
    block.pack(&mut out);
    out
}

/// Decodes the block starting at the cursor, in the framing of `version`.
/// When `expect_block_num` is given, the decoded number must match.
pub fn read_block(
    cur: &mut Cursor<'_>,
    version: u32,
    expect_block_num: Option<u32>,
) -> Result<SignedBlock> {
    let block = if version >= 4 {
        read_entry_v4(cur)?.1
    } else {
        read_entry_legacy(cur)?
    };
    if let Some(expected) = expect_block_num {
        if block.block_num() != expected {
            return Err(BlockLogError::malformed_entry(format!(
                "wrong block read from the block log: expected {expected}, found {}",
                block.block_num()
            )));
        }
    }
    Ok(block)
}

/// Decodes only the header of the block starting at the cursor and returns
/// its id. Cheaper than [`read_block`] when only the id is wanted.
pub fn read_block_id(cur: &mut Cursor<'_>, version: u32, expect_block_num: u32) -> Result<BlockId> {
    if version >= 4 {
        let _size = cur.read_u32()?;
        let tag = cur.read_u8()?;
        if tag != Compression::None.tag() {
            return Err(BlockLogError::malformed_entry(
                "only \"none\" compression is supported",
            ));
        }
    }
    let header = BlockHeader::unpack(cur)?;
    if header.block_num() != expect_block_num {
        return Err(BlockLogError::malformed_entry(format!(
            "wrong block header read from the block log: expected {expect_block_num}, found {}",
            header.block_num()
        )));
    }
    Ok(header.calculate_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{genesis_block, next_block, sample_genesis, sample_transaction};

    fn preamble_round_trip(preamble: Preamble) {
        let encoded = preamble.encode();
        let mut cur = Cursor::new(&encoded);
        let decoded = Preamble::decode(&mut cur).expect("decode");
        assert_eq!(decoded, preamble);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn preamble_v1_round_trip() {
        preamble_round_trip(Preamble {
            version: 1,
            first_block_num: 1,
            chain_context: ChainContext::Genesis(sample_genesis()),
        });
    }

    #[test]
    fn preamble_v2_round_trip() {
        preamble_round_trip(Preamble {
            version: 2,
            first_block_num: 1,
            chain_context: ChainContext::Genesis(sample_genesis()),
        });
    }

    #[test]
    fn preamble_v3_and_v4_round_trip() {
        let chain_id = sample_genesis().compute_chain_id();
        for version in [3, 4] {
            preamble_round_trip(Preamble {
                version,
                first_block_num: 100,
                chain_context: ChainContext::Id(chain_id),
            });
        }
    }

    #[test]
    fn chain_id_preamble_has_fixed_size() {
        let preamble = Preamble {
            version: 4,
            first_block_num: 100,
            chain_context: ChainContext::Id(sample_genesis().compute_chain_id()),
        };
        assert_eq!(preamble.encode().len() as u64, PREAMBLE_CHAIN_ID_BYTES);
    }

    #[test]
    fn preamble_rejects_unsupported_version() {
        let mut bytes = Preamble {
            version: 4,
            first_block_num: 100,
            chain_context: ChainContext::Id(ChainId::default()),
        }
        .encode();
        bytes[0..4].copy_from_slice(&9u32.to_le_bytes());
        let err = Preamble::decode(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::BlockLogError::UnsupportedVersion { version: 9 }
        ));
    }

    #[test]
    fn preamble_rejects_totem_mismatch() {
        let mut bytes = Preamble {
            version: 4,
            first_block_num: 100,
            chain_context: ChainContext::Id(ChainId::default()),
        }
        .encode();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&0u64.to_le_bytes());
        let err = Preamble::decode(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::BlockLogError::MalformedPreamble(_)
        ));
    }

    #[test]
    fn entry_v4_round_trip_with_padding() {
        let b1 = genesis_block(&sample_genesis());
        let mut block = next_block(&b1);
        block.transactions = vec![sample_transaction(9, Some(b"context free bytes"))];

        let mut encoded = encode_entry_v4(&block, Compression::None).expect("encode");
        let declared_size = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(declared_size as usize, encoded.len() + 8);
        encoded.extend_from_slice(&0u64.to_le_bytes());

        let mut cur = Cursor::new(&encoded);
        let (meta, decoded) = read_entry_v4(&mut cur).expect("decode");
        assert_eq!(meta.size, declared_size);
        assert_eq!(decoded, block);
        // cursor must now sit on the trailing back pointer
        assert_eq!(cur.tellp(), meta.size as u64 - 8);
    }

    #[test]
    fn entry_v4_skips_padding_left_by_pruning() {
        let b1 = genesis_block(&sample_genesis());
        let mut block = next_block(&b1);
        block.transactions = vec![sample_transaction(3, Some(b"to be pruned"))];

        let mut encoded = encode_entry_v4(&block, Compression::None).expect("encode");
        // rewrite the payload region in place with the pruned form
        let mut pruned = block.clone();
        assert!(pruned.transactions[0].prune_all());
        let mut payload = Vec::new();
        pruned.pack(&mut payload);
        let region = &mut encoded[ENTRY_HEADER_BYTES..];
        assert!(payload.len() <= region.len());
        region.fill(0);
        region[..payload.len()].copy_from_slice(&payload);
        encoded.extend_from_slice(&0u64.to_le_bytes());

        let mut cur = Cursor::new(&encoded);
        let (meta, decoded) = read_entry_v4(&mut cur).expect("decode");
        assert_eq!(decoded, pruned);
        assert_eq!(cur.tellp(), meta.size as u64 - 8);
    }

    #[test]
    fn entry_v4_rejects_unsupported_compression() {
        let b1 = genesis_block(&sample_genesis());
        let block = next_block(&b1);
        assert!(encode_entry_v4(&block, Compression::Lz4).is_err());

        let mut encoded = encode_entry_v4(&block, Compression::None).expect("encode");
        encoded[4] = Compression::Zstd.tag();
        let err = read_entry_v4(&mut Cursor::new(&encoded)).unwrap_err();
        assert!(matches!(err, crate::error::BlockLogError::MalformedEntry(_)));
    }

    #[test]
    fn entry_v4_rejects_undersized_frame() {
        let b1 = genesis_block(&sample_genesis());
        let block = next_block(&b1);
        let mut encoded = encode_entry_v4(&block, Compression::None).expect("encode");
        // declare a size smaller than the serialized block
        encoded[0..4].copy_from_slice(&9u32.to_le_bytes());
        let err = read_entry_v4(&mut Cursor::new(&encoded)).unwrap_err();
        assert!(matches!(err, crate::error::BlockLogError::MalformedEntry(_)));
    }

    #[test]
    fn legacy_entry_round_trip() {
        let b1 = genesis_block(&sample_genesis());
        let encoded = encode_entry_legacy(&b1);
        let decoded = read_entry_legacy(&mut Cursor::new(&encoded)).expect("decode");
        assert_eq!(decoded, b1);
    }

    #[test]
    fn read_block_checks_expected_number() {
        let b1 = genesis_block(&sample_genesis());
        let mut encoded = encode_entry_v4(&b1, Compression::None).expect("encode");
        encoded.extend_from_slice(&0u64.to_le_bytes());
        let err = read_block(&mut Cursor::new(&encoded), 4, Some(7)).unwrap_err();
        assert!(matches!(err, crate::error::BlockLogError::MalformedEntry(_)));
    }

    #[test]
    fn read_block_id_matches_full_decode() {
        let b1 = genesis_block(&sample_genesis());
        let mut block = next_block(&b1);
        block.transactions = vec![sample_transaction(5, Some(b"cfd"))];
        let mut encoded = encode_entry_v4(&block, Compression::None).expect("encode");
        encoded.extend_from_slice(&0u64.to_le_bytes());
        let id = read_block_id(&mut Cursor::new(&encoded), 4, block.block_num()).expect("id");
        assert_eq!(id, block.calculate_id());
    }
}
