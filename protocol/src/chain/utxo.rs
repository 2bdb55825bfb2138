//! Unspent output set and known key bindings, derived from the applied chain.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::block::FinalizedBlock;
use super::transaction::{Address, KeyBinding, OutPoint, TxOutput};

/// Inputs a validation worker needs to check one batch: the outputs the
/// batch tries to spend and the key bindings already known to the chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationContext {
    pub utxos: BTreeMap<OutPoint, TxOutput>,
    pub known_bindings: BTreeMap<Address, [u8; 32]>,
}

#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    unspent: HashMap<OutPoint, TxOutput>,
    bindings: HashMap<Address, [u8; 32]>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `blocks` from scratch. Used at startup and after a reorg.
    pub fn rebuild<'a>(blocks: impl IntoIterator<Item = &'a FinalizedBlock>) -> Self {
        let mut set = Self::new();
        for block in blocks {
            set.apply_block(block);
        }
        set
    }

    /// Spend the inputs and record the outputs of every transaction in
    /// `block`. The block must already have passed validation.
    pub fn apply_block(&mut self, block: &FinalizedBlock) {
        for tx in &block.transactions {
            for input in &tx.inputs {
                self.unspent.remove(input);
            }
            let id = tx.id();
            for (output, out) in tx.outputs.iter().enumerate() {
                self.unspent.insert(
                    OutPoint {
                        tx_id: id,
                        output: output as u32,
                    },
                    out.clone(),
                );
            }
            let binding = tx.binding();
            self.bindings.insert(binding.address, binding.pubkey);
        }
    }

    /// Record bindings reported by the validator.
    pub fn record_bindings(&mut self, bindings: &[KeyBinding]) {
        for binding in bindings {
            self.bindings.insert(binding.address, binding.pubkey);
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        self.unspent.get(outpoint)
    }

    pub fn len(&self) -> usize {
        self.unspent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unspent.is_empty()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.unspent
            .values()
            .filter(|out| &out.address == address)
            .map(|out| out.amount)
            .sum()
    }

    /// Unspent outputs owned by `address`.
    pub fn outputs_of(&self, address: &Address) -> Vec<(OutPoint, TxOutput)> {
        let mut found: Vec<_> = self
            .unspent
            .iter()
            .filter(|(_, out)| &out.address == address)
            .map(|(point, out)| (*point, out.clone()))
            .collect();
        found.sort_by_key(|(point, _)| *point);
        found
    }

    /// Slice of the set a validator needs for `block`.
    pub fn context_for(&self, block: &FinalizedBlock) -> ValidationContext {
        let utxos = block
            .transactions
            .iter()
            .flat_map(|tx| tx.inputs.iter())
            .filter_map(|input| self.unspent.get(input).map(|out| (*input, out.clone())))
            .collect();
        let known_bindings = block
            .transactions
            .iter()
            .filter_map(|tx| {
                let address = tx.sender_address();
                self.bindings.get(&address).map(|pk| (address, *pk))
            })
            .collect();
        ValidationContext {
            utxos,
            known_bindings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::BlockCandidate;
    use crate::chain::transaction::{address_of, Transaction};
    use crate::crypto::keys::NodeKeypair;

    fn block_with(parent: &FinalizedBlock, kp: &NodeKeypair, txs: Vec<Transaction>) -> FinalizedBlock {
        BlockCandidate {
            index: parent.index + 1,
            prev_hash: parent.hash,
            timestamp: 10,
            proposer: kp.peer_id(),
            transactions: txs,
            nonce: 0,
            difficulty: 0,
        }
        .seal(0)
    }

    #[test]
    fn apply_reward_then_spend() {
        let kp = NodeKeypair::generate();
        let me = address_of(&kp.public_key_bytes());
        let other = [7u8; 32];

        let reward = Transaction::reward(&kp, me, 50, 1);
        let b1 = block_with(&FinalizedBlock::genesis(), &kp, vec![reward.clone()]);

        let mut set = UtxoSet::new();
        set.apply_block(&b1);
        assert_eq!(set.balance(&me), 50);
        assert_eq!(set.binding_count(), 1);

        let spend = Transaction::new_signed(
            &kp,
            vec![OutPoint {
                tx_id: reward.id(),
                output: 0,
            }],
            vec![
                TxOutput {
                    address: other,
                    amount: 20,
                },
                TxOutput {
                    address: me,
                    amount: 30,
                },
            ],
            2,
        );
        let b2 = block_with(&b1, &kp, vec![spend]);
        let ctx = set.context_for(&b2);
        assert_eq!(ctx.utxos.len(), 1);
        assert_eq!(ctx.known_bindings.get(&me), Some(&kp.public_key_bytes()));

        set.apply_block(&b2);
        assert_eq!(set.balance(&me), 30);
        assert_eq!(set.balance(&other), 20);
        assert_eq!(set.outputs_of(&me).len(), 1);
    }

    #[test]
    fn rebuild_matches_incremental() {
        let kp = NodeKeypair::generate();
        let me = address_of(&kp.public_key_bytes());
        let genesis = FinalizedBlock::genesis();
        let b1 = block_with(&genesis, &kp, vec![Transaction::reward(&kp, me, 50, 1)]);
        let b2 = block_with(&b1, &kp, vec![Transaction::reward(&kp, me, 50, 2)]);

        let rebuilt = UtxoSet::rebuild([&genesis, &b1, &b2]);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.balance(&me), 100);
    }
}
