//! # Transactions
//!
//! A UTXO-style transfer signed by its sender's Ed25519 key.
//!
//! ```text
//! Transaction
//! ├── inputs: Vec<OutPoint>        (tx id + output index being spent)
//! ├── outputs: Vec<TxOutput>       (address + amount)
//! ├── sender_pubkey: [u8; 32]      (owner of every input)
//! ├── timestamp: u64               (unix ms)
//! └── signature                    (Ed25519 over the signing bytes)
//! ```
//!
//! A transaction with no inputs is a reward (coinbase) transaction. Block
//! validation allows at most one, and only as the first transaction.
//!
//! The id is a domain-separated BLAKE3 over the signing bytes, so it does
//! not change when a signature is re-encoded.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{domain_separated_hash, Hash32};
use crate::crypto::keys::{NodeKeypair, NodePublicKey, NodeSignature};

/// An account address: BLAKE3 of the owner's public key.
pub type Address = Hash32;

/// Reward paid to the proposer of each block.
pub const BLOCK_REWARD: u64 = 50;

const TX_ID_CONTEXT: &str = "kestrel v1 transaction id";
const ADDRESS_CONTEXT: &str = "kestrel v1 address";

/// Derive the address owned by `pubkey`.
pub fn address_of(pubkey: &[u8; 32]) -> Address {
    domain_separated_hash(ADDRESS_CONTEXT, pubkey)
}

/// Reference to a single output of an earlier transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: Hash32,
    pub output: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: u64,
}

/// A public key seen signing a valid transaction, with the address it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyBinding {
    pub pubkey: [u8; 32],
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    pub sender_pubkey: [u8; 32],
    pub timestamp: u64,
    pub signature: NodeSignature,
}

impl Transaction {
    /// Build and sign a transfer.
    pub fn new_signed(
        keypair: &NodeKeypair,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOutput>,
        timestamp: u64,
    ) -> Self {
        let mut tx = Self {
            inputs,
            outputs,
            sender_pubkey: keypair.public_key_bytes(),
            timestamp,
            signature: NodeSignature::from_bytes(Vec::new()),
        };
        tx.signature = keypair.sign(&tx.signing_bytes());
        tx
    }

    /// Build and sign the block reward paying `address`.
    pub fn reward(keypair: &NodeKeypair, address: Address, amount: u64, timestamp: u64) -> Self {
        Self::new_signed(
            keypair,
            Vec::new(),
            vec![TxOutput { address, amount }],
            timestamp,
        )
    }

    /// Canonical bytes covered by the signature and the id.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(16 + self.inputs.len() * 36 + self.outputs.len() * 40 + 40);
        buf.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            buf.extend_from_slice(&input.tx_id);
            buf.extend_from_slice(&input.output.to_be_bytes());
        }
        buf.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(&output.address);
            buf.extend_from_slice(&output.amount.to_be_bytes());
        }
        buf.extend_from_slice(&self.sender_pubkey);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    pub fn id(&self) -> Hash32 {
        domain_separated_hash(TX_ID_CONTEXT, &self.signing_bytes())
    }

    pub fn is_reward(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn sender_address(&self) -> Address {
        address_of(&self.sender_pubkey)
    }

    pub fn verify_signature(&self) -> bool {
        NodePublicKey::from_bytes(self.sender_pubkey).verify(&self.signing_bytes(), &self.signature)
    }

    /// Sum of output amounts, `None` on overflow.
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    pub fn binding(&self) -> KeyBinding {
        KeyBinding {
            pubkey: self.sender_pubkey,
            address: self.sender_address(),
        }
    }
}
