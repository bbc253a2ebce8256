use std::fmt::Display;
use std::path::PathBuf;

use crate::config::{MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION};

/// A specialized error type for block log operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum BlockLogError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// `repair_log` was pointed at a directory without a `blocks.log`.
    #[error("block log not found in '{0}'")]
    LogNotFound(PathBuf),
    /// The preamble carries a version outside the supported range.
    #[error("unsupported block log version {version}, supported range is [{min}, {max}]",
            min = MIN_SUPPORTED_VERSION, max = MAX_SUPPORTED_VERSION)]
    UnsupportedVersion { version: u32 },
    /// The preamble bytes do not decode to a valid header.
    #[error("malformed preamble: {0}")]
    MalformedPreamble(String),
    /// Entry framing is inconsistent (back pointer, size, or compression tag).
    #[error("malformed entry: {0}")]
    MalformedEntry(String),
    /// A block body failed to deserialize during full validation.
    #[error("bad block: {inner}")]
    BadBlock {
        #[source]
        inner: Box<BlockLogError>,
    },
    /// A log file disagrees with the established chain id.
    #[error("chain id mismatch: {0}")]
    ChainIdMismatch(String),
    /// `append` was called before the log was reset with a genesis or chain id.
    #[error("cannot append to the block log until the genesis is first written")]
    AppendBeforeReset,
    /// The index write offset disagrees with the expected block position.
    #[error("append to the block index at offset {actual}, expected {expected}")]
    IndexDesync { expected: u64, actual: u64 },
    /// Invalid arguments to a reset or trim operation.
    #[error("invalid arguments: {0}")]
    InvalidTrimArgs(String),
    /// `repair_log` refused to overwrite an existing backup directory.
    #[error("backup directory '{0}' already exists")]
    BackupDirExists(PathBuf),
    /// The requested block is not present in the live log.
    #[error("block {0} does not exist in the block log")]
    BlockNotFound(u32),
    /// File-level corruption with no local recovery path.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl BlockLogError {
    /// Create a malformed-entry error from a displayable value.
    pub fn malformed_entry<T: Display>(msg: T) -> Self {
        Self::MalformedEntry(msg.to_string())
    }

    /// Create a malformed-preamble error from a displayable value.
    pub fn malformed_preamble<T: Display>(msg: T) -> Self {
        Self::MalformedPreamble(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T: Display>(msg: T) -> Self {
        Self::Corruption(msg.to_string())
    }

    /// Create an invalid-arguments error from a displayable value.
    pub fn invalid_args<T: Display>(msg: T) -> Self {
        Self::InvalidTrimArgs(msg.to_string())
    }

    /// Wrap a decode failure so repair can tell framing damage from a bad body.
    pub fn bad_block(inner: BlockLogError) -> Self {
        Self::BadBlock {
            inner: Box::new(inner),
        }
    }
}

/// A Result type alias for block log operations.
pub type Result<T> = std::result::Result<T, BlockLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_entry_helper() {
        let err = BlockLogError::malformed_entry("bad back pointer");
        assert!(matches!(err, BlockLogError::MalformedEntry(msg) if msg == "bad back pointer"));
    }

    #[test]
    fn bad_block_preserves_inner_message() {
        let err = BlockLogError::bad_block(BlockLogError::malformed_entry("truncated"));
        assert_eq!(err.to_string(), "bad block: malformed entry: truncated");
    }
}
