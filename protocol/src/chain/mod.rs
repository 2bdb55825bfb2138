//! # Chain Model
//!
//! Blocks, transactions and the in-memory views derived from the finalized
//! chain.
//!
//! ```text
//! transaction.rs  Transaction, OutPoint, TxOutput, addresses
//! block.rs        BlockCandidate, FinalizedBlock, genesis, hashing
//! state.rs        ChainState: ordered blocks + hash index
//! utxo.rs         UtxoSet and the per-batch ValidationContext
//! ```
//!
//! `ChainState` and `UtxoSet` are only mutated by the sync engine.

pub mod block;
pub mod state;
pub mod transaction;
pub mod utxo;

pub use block::{meets_difficulty, BlockCandidate, BlockError, FinalizedBlock};
pub use state::{ChainError, ChainState};
pub use transaction::{address_of, Address, KeyBinding, OutPoint, Transaction, TxOutput};
pub use utxo::{UtxoSet, ValidationContext};
