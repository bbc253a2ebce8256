//! Durable, versioned, append-only block log for a blockchain node.
//!
//! The log stores an ordered sequence of finalized blocks in a `blocks.log`
//! file paired with a dense `blocks.index` position table, supporting random
//! reads by block number, crash-safe appends, self-recovery on startup, log
//! rotation into immutable segments, head/tail trimming, and selective
//! transaction pruning that censors context-free data while preserving block
//! ids.
//!
//! ## Key components
//!
//! - [`BlockLog`]: the facade. Owns the live log and index, appends blocks,
//!   serves reads, and rotates at stride boundaries.
//! - [`BlockLogData`] / [`BlockLogIndex`]: read-only memory-mapped views of a
//!   log and index file.
//! - [`SegmentCatalog`]: tracks rotated `blocks-<first>-<last>.{log,index}`
//!   segments, routes reads outside the live range, and enforces retention.
//! - [`maintenance`]: offline tools: [`construct_index`], [`repair_log`],
//!   [`trim_front`](maintenance::trim_front),
//!   [`trim_end`](maintenance::trim_end),
//!   [`smoke_test`](maintenance::smoke_test), and the chain-identity
//!   extractors.
//!
//! ## On-disk format
//!
//! Every log file begins with a preamble (version, first block number, and
//! either an embedded genesis state or a bare chain id) and, from version 2
//! on, the totem separator [`NPOS`]. Every entry ends with a `u64` back
//! pointer equal to its own starting offset; the index is derivable from the
//! log alone by walking that chain in reverse.
//!
//! ## Concurrency
//!
//! Single writer, single thread. The core takes no locks and assumes no
//! other process mutates its files; callers serialize externally. Rotated
//! segments are immutable once registered.

pub mod catalog;
pub mod chain;
pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod fs;
pub mod index;
pub mod maintenance;
pub mod store;
pub mod test_support;

pub use catalog::SegmentCatalog;
pub use chain::{
    BlockHeader, BlockId, BlockTimestamp, ChainId, ContextFreeData, GenesisState, SignedBlock,
    Transaction, TransactionId,
};
pub use codec::{
    contains_chain_id, contains_genesis_state, ChainContext, Compression, Preamble, NPOS,
};
pub use config::{
    default_version, is_supported_version, set_default_version, BlockLogConfig,
    MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION,
};
pub use data::BlockLogData;
pub use error::{BlockLogError, Result};
pub use index::{construct_index, BlockLogIndex, IndexBuilder};
pub use maintenance::{
    exists, extract_chain_id, extract_genesis_state, repair_log, smoke_test, trim_end, trim_front,
};
pub use store::BlockLog;
