//! Helpers for building deterministic chains in tests.

use crate::chain::{
    BlockHeader, BlockId, BlockTimestamp, ContextFreeData, GenesisState, SignedBlock, Transaction,
    TransactionId,
};

/// A fixed genesis state shared by the test suites.
pub fn sample_genesis() -> GenesisState {
    GenesisState {
        chain_name: "chainlog-test-chain".to_string(),
        initial_timestamp: BlockTimestamp(1000),
        initial_key: [7u8; 33],
    }
}

/// Block 1 of a chain born from `genesis`.
pub fn genesis_block(genesis: &GenesisState) -> SignedBlock {
    let chain_id = genesis.compute_chain_id();
    let mut action_mroot = [0u8; 32];
    action_mroot.copy_from_slice(chain_id.as_bytes());
    SignedBlock {
        header: BlockHeader {
            timestamp: BlockTimestamp(genesis.initial_timestamp.0 + 1),
            producer: 1,
            confirmed: 0,
            previous: BlockId::default(),
            transaction_mroot: [0u8; 32],
            action_mroot,
            schedule_version: 0,
        },
        producer_signature: [1u8; 64],
        transactions: Vec::new(),
    }
}

/// The block following `prev`, linked through its id.
pub fn next_block(prev: &SignedBlock) -> SignedBlock {
    SignedBlock {
        header: BlockHeader {
            timestamp: BlockTimestamp(prev.header.timestamp.0 + 1),
            producer: prev.header.producer,
            confirmed: 0,
            previous: prev.calculate_id(),
            transaction_mroot: [0u8; 32],
            action_mroot: [0u8; 32],
            schedule_version: 0,
        },
        producer_signature: prev.producer_signature,
        transactions: Vec::new(),
    }
}

/// A chain of `count` linked blocks starting at block 1.
pub fn build_chain(genesis: &GenesisState, count: usize) -> Vec<SignedBlock> {
    let mut blocks = Vec::with_capacity(count);
    if count == 0 {
        return blocks;
    }
    blocks.push(genesis_block(genesis));
    while blocks.len() < count {
        let next = next_block(&blocks[blocks.len() - 1]);
        blocks.push(next);
    }
    blocks
}

/// A chain of `count` linked blocks starting at `first_block_num`, for
/// exercising partial logs that begin past the genesis.
pub fn build_chain_from(first_block_num: u32, count: usize) -> Vec<SignedBlock> {
    let mut blocks = Vec::with_capacity(count);
    if count == 0 {
        return blocks;
    }
    let mut previous = BlockId([0xAA; 32]);
    previous.0[0..4].copy_from_slice(&(first_block_num - 1).to_be_bytes());
    blocks.push(SignedBlock {
        header: BlockHeader {
            timestamp: BlockTimestamp(5000),
            producer: 2,
            confirmed: 0,
            previous,
            transaction_mroot: [0u8; 32],
            action_mroot: [0u8; 32],
            schedule_version: 0,
        },
        producer_signature: [2u8; 64],
        transactions: Vec::new(),
    });
    while blocks.len() < count {
        let next = next_block(&blocks[blocks.len() - 1]);
        blocks.push(next);
    }
    blocks
}

/// A transaction whose id is derived from `tag` alone, with optional
/// context-free data. The id never depends on the context-free bytes, the
/// same way real transaction ids only cover non-prunable fields.
pub fn sample_transaction(tag: u8, context_free: Option<&[u8]>) -> Transaction {
    Transaction {
        id: TransactionId([tag; 32]),
        expiration: 1000 + tag as u32,
        payload: vec![tag; 16],
        context_free_data: match context_free {
            Some(bytes) => ContextFreeData::Full(bytes.to_vec()),
            None => ContextFreeData::Full(Vec::new()),
        },
    }
}

/// Replaces the transactions of `block`, returning it for chaining.
pub fn with_transactions(mut block: SignedBlock, transactions: Vec<Transaction>) -> SignedBlock {
    block.transactions = transactions;
    block
}
