//! Chain-layer value types stored in the block log.
//!
//! The log only needs blocks to be serializable values that know their own
//! number and id, but the framing code depends on one fixed fact about the
//! layout: bytes `[14, 18)` of a packed header are the big-endian number of
//! the previous block (the leading bytes of its id). That is what lets the
//! log derive a block number from raw bytes without deserializing anything.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::Cursor;
use crate::error::{BlockLogError, Result};

/// Packed byte length of a [`BlockHeader`].
pub const BLOCK_HEADER_PACKED_SIZE: usize = 114;

/// Byte length of a producer signature.
pub const SIGNATURE_SIZE: usize = 64;

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Identity of a chain: the digest of its genesis state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChainId(pub [u8; 32]);

impl ChainId {
    #[inline]
    pub const fn new(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Identity of a block. The first four bytes are the big-endian block number;
/// the remainder comes from the header digest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    #[inline]
    pub const fn new(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Block number embedded in the id.
    #[inline]
    pub fn num_from_id(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Identity of a transaction. Computed by the chain layer over the
/// non-prunable fields only, so pruning context-free data never changes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransactionId(pub [u8; 32]);

impl TransactionId {
    #[inline]
    pub const fn new(raw: [u8; 32]) -> Self {
        Self(raw)
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Half-second slot counter since the chain epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockTimestamp(pub u32);

/// Header of a block, with a fixed packed layout.
///
/// Layout (little-endian unless noted):
/// `timestamp[0..4) producer[4..12) confirmed[12..14) previous[14..46)
/// transaction_mroot[46..78) action_mroot[78..110) schedule_version[110..114)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub timestamp: BlockTimestamp,
    pub producer: u64,
    pub confirmed: u16,
    pub previous: BlockId,
    pub transaction_mroot: [u8; 32],
    pub action_mroot: [u8; 32],
    pub schedule_version: u32,
}

impl BlockHeader {
    /// Number of this block: one past the number embedded in `previous`.
    #[inline]
    pub fn block_num(&self) -> u32 {
        self.previous.num_from_id() + 1
    }

    /// Id of this block: the header digest with the block number spliced into
    /// the first four bytes, big-endian.
    pub fn calculate_id(&self) -> BlockId {
        let mut packed = [0u8; BLOCK_HEADER_PACKED_SIZE];
        self.pack_into(&mut packed);
        let digest = Sha256::digest(packed);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        id[0..4].copy_from_slice(&self.block_num().to_be_bytes());
        BlockId(id)
    }

    fn pack_into(&self, out: &mut [u8; BLOCK_HEADER_PACKED_SIZE]) {
        out[0..4].copy_from_slice(&self.timestamp.0.to_le_bytes());
        out[4..12].copy_from_slice(&self.producer.to_le_bytes());
        out[12..14].copy_from_slice(&self.confirmed.to_le_bytes());
        out[14..46].copy_from_slice(&self.previous.0);
        out[46..78].copy_from_slice(&self.transaction_mroot);
        out[78..110].copy_from_slice(&self.action_mroot);
        out[110..114].copy_from_slice(&self.schedule_version.to_le_bytes());
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        let mut packed = [0u8; BLOCK_HEADER_PACKED_SIZE];
        self.pack_into(&mut packed);
        out.extend_from_slice(&packed);
    }

    pub fn unpack(cur: &mut Cursor<'_>) -> Result<Self> {
        let timestamp = BlockTimestamp(cur.read_u32()?);
        let producer = cur.read_u64()?;
        let confirmed = cur.read_u16()?;
        let previous = BlockId(cur.read_array()?);
        let transaction_mroot = cur.read_array()?;
        let action_mroot = cur.read_array()?;
        let schedule_version = cur.read_u32()?;
        Ok(Self {
            timestamp,
            producer,
            confirmed,
            previous,
            transaction_mroot,
            action_mroot,
            schedule_version,
        })
    }
}

/// Packed size of the pruned context-free form: the tag byte plus the digest
/// of the removed bytes.
const PRUNED_CFD_PACKED_SIZE: usize = 1 + 32;

/// Context-free data attached to a transaction. The only part of a block the
/// log is ever allowed to rewrite in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextFreeData {
    /// Data present in full. Packed as a tag byte `1`, a `u32` length, and
    /// the bytes.
    Full(Vec<u8>),
    /// Data censored by pruning: a null digest representation that keeps the
    /// hash of the removed bytes. Packed as the tag byte `0` followed by the
    /// 32-byte digest.
    Pruned { digest: [u8; 32] },
}

impl ContextFreeData {
    fn packed_size(&self) -> usize {
        match self {
            Self::Full(bytes) => 1 + 4 + bytes.len(),
            Self::Pruned { .. } => PRUNED_CFD_PACKED_SIZE,
        }
    }

    /// Largest packed size this data can take across pruning states. `Full`
    /// data shorter than the digest grows when pruned.
    fn max_pruned_packed_size(&self) -> usize {
        self.packed_size().max(PRUNED_CFD_PACKED_SIZE)
    }

    fn pack(&self, out: &mut Vec<u8>) {
        match self {
            Self::Full(bytes) => {
                out.push(1);
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Self::Pruned { digest } => {
                out.push(0);
                out.extend_from_slice(digest);
            }
        }
    }

    fn unpack(cur: &mut Cursor<'_>) -> Result<Self> {
        match cur.read_u8()? {
            0 => Ok(Self::Pruned {
                digest: cur.read_array()?,
            }),
            1 => {
                let len = cur.read_u32()? as usize;
                Ok(Self::Full(cur.read_bytes(len)?.to_vec()))
            }
            tag => Err(BlockLogError::malformed_entry(format!(
                "unknown context-free data tag {tag}"
            ))),
        }
    }
}

/// A transaction as carried by a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub expiration: u32,
    pub payload: Vec<u8>,
    pub context_free_data: ContextFreeData,
}

impl Transaction {
    /// Replaces the context-free data with the digest of its bytes while
    /// keeping the id stable. Returns whether anything was actually removed.
    pub fn prune_all(&mut self) -> bool {
        match &self.context_free_data {
            ContextFreeData::Full(bytes) => {
                let hashed = Sha256::digest(bytes);
                let mut digest = [0u8; 32];
                digest.copy_from_slice(&hashed);
                self.context_free_data = ContextFreeData::Pruned { digest };
                true
            }
            ContextFreeData::Pruned { .. } => false,
        }
    }

    pub fn packed_size(&self) -> usize {
        32 + 4 + 4 + self.payload.len() + self.context_free_data.packed_size()
    }

    /// Largest packed size this transaction can take across pruning states.
    pub fn max_pruned_packed_size(&self) -> usize {
        32 + 4 + 4 + self.payload.len() + self.context_free_data.max_pruned_packed_size()
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.0);
        out.extend_from_slice(&self.expiration.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        self.context_free_data.pack(out);
    }

    pub fn unpack(cur: &mut Cursor<'_>) -> Result<Self> {
        let id = TransactionId(cur.read_array()?);
        let expiration = cur.read_u32()?;
        let payload_len = cur.read_u32()? as usize;
        let payload = cur.read_bytes(payload_len)?.to_vec();
        let context_free_data = ContextFreeData::unpack(cur)?;
        Ok(Self {
            id,
            expiration,
            payload,
            context_free_data,
        })
    }
}

/// A finalized block as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub header: BlockHeader,
    pub producer_signature: [u8; SIGNATURE_SIZE],
    pub transactions: Vec<Transaction>,
}

impl SignedBlock {
    #[inline]
    pub fn block_num(&self) -> u32 {
        self.header.block_num()
    }

    #[inline]
    pub fn calculate_id(&self) -> BlockId {
        self.header.calculate_id()
    }

    /// Packed size of the block in its current pruning state.
    pub fn pack_size(&self) -> usize {
        BLOCK_HEADER_PACKED_SIZE
            + SIGNATURE_SIZE
            + 4
            + self
                .transactions
                .iter()
                .map(Transaction::packed_size)
                .sum::<usize>()
    }

    /// Upper bound on the packed size across all pruning states: every
    /// transaction is counted at the larger of its current form and the
    /// pruned tag-plus-digest form. The v4 entry writer reserves this much,
    /// so pruning can always rewrite the payload in place.
    pub fn max_pruned_pack_size(&self) -> usize {
        BLOCK_HEADER_PACKED_SIZE
            + SIGNATURE_SIZE
            + 4
            + self
                .transactions
                .iter()
                .map(Transaction::max_pruned_packed_size)
                .sum::<usize>()
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        self.header.pack(out);
        out.extend_from_slice(&self.producer_signature);
        out.extend_from_slice(&(self.transactions.len() as u32).to_le_bytes());
        for trx in &self.transactions {
            trx.pack(out);
        }
    }

    pub fn unpack(cur: &mut Cursor<'_>) -> Result<Self> {
        let header = BlockHeader::unpack(cur)?;
        let producer_signature = cur.read_array()?;
        let count = cur.read_u32()?;
        let mut transactions = Vec::new();
        for _ in 0..count {
            transactions.push(Transaction::unpack(cur)?);
        }
        Ok(Self {
            header,
            producer_signature,
            transactions,
        })
    }
}

/// The state a chain is born from. Embedded verbatim in logs that start at
/// block 1; everywhere else only its digest (the chain id) is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisState {
    pub chain_name: String,
    pub initial_timestamp: BlockTimestamp,
    pub initial_key: [u8; 33],
}

impl GenesisState {
    pub fn compute_chain_id(&self) -> ChainId {
        let mut packed = Vec::new();
        self.pack(&mut packed);
        let digest = Sha256::digest(&packed);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        ChainId(id)
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.chain_name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.chain_name.as_bytes());
        out.extend_from_slice(&self.initial_timestamp.0.to_le_bytes());
        out.extend_from_slice(&self.initial_key);
    }

    pub fn unpack(cur: &mut Cursor<'_>) -> Result<Self> {
        let name_len = cur.read_u32()? as usize;
        let name_bytes = cur.read_bytes(name_len)?;
        let chain_name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| BlockLogError::malformed_preamble("genesis chain name is not UTF-8"))?;
        let initial_timestamp = BlockTimestamp(cur.read_u32()?);
        let initial_key = cur.read_array()?;
        Ok(Self {
            chain_name,
            initial_timestamp,
            initial_key,
        })
    }
}
