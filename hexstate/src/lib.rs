#![doc = include_str!("../README.md")]

pub mod account;
pub mod constant;
pub mod error;
pub mod mem_db;
pub mod state;
pub mod traits;
pub mod trie;

pub use account::Account;
pub use error::{Result, StateError};
pub use mem_db::MemDb;
pub use state::{
    BlockProof, DbStateWriter, NoopWriter, StateReader, StateWriter, Stateless, TrieDbState,
    TrieStateWriter,
};
pub use traits::{Bucket, Database, DbBatch};
pub use trie::{NullObserver, Trie, TrieContinuation, TrieObserver};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::EMPTY_ROOT;
    use alloy_primitives::{Address, U256};

    /// A simple end-to-end test demonstrating the complete workflow: a
    /// full node commits blocks, produces a witness, a stateless verifier
    /// replays the block, and the chain unwinds back.
    #[test]
    fn basic_integration_test() -> Result<()> {
        let mut state = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);

        // Block 1: two fresh accounts, persisted through both writers.
        state.set_block_nr(1);
        for (address, balance) in [(alice, 100u64), (bob, 50)] {
            let account = Account {
                nonce: 0,
                balance: U256::from(balance),
                ..Default::default()
            };
            let original = state.read_account_data(address)?;
            state
                .trie_state_writer()
                .update_account_data(address, original.as_ref(), &account)?;
            state
                .db_state_writer()
                .update_account_data(address, original.as_ref(), &account)?;
        }
        let root_1 = state.trie_root()?;

        // Block 2, with witness recording on: alice pays bob.
        state.set_resolve_reads(true);
        state.set_block_nr(2);
        let mut payment = Vec::new();
        for (address, balance) in [(alice, 75u64), (bob, 75)] {
            let original = state.read_account_data(address)?;
            let account = Account {
                balance: U256::from(balance),
                ..original.clone().unwrap_or_default()
            };
            state
                .trie_state_writer()
                .update_account_data(address, original.as_ref(), &account)?;
            state
                .db_state_writer()
                .update_account_data(address, original.as_ref(), &account)?;
            payment.push((address, original, account));
        }
        let root_2 = state.trie_root()?;
        let proof = state.extract_proofs()?;

        // A verifier holding no state replays block 2 from the proof.
        let mut verifier = Stateless::new(root_1, &proof, 2)?;
        assert_eq!(
            verifier.read_account_data(alice)?.unwrap().balance,
            U256::from(100u64)
        );
        for (address, original, account) in &payment {
            verifier.update_account_data(*address, original.as_ref(), account)?;
        }
        verifier.check_root(root_2)?;

        // The full node can rewind block 2 away again.
        state.unwind_to(1)?;
        assert_eq!(
            state.read_account_data(alice)?.unwrap().balance,
            U256::from(100u64)
        );
        assert_eq!(
            state.read_account_data(bob)?.unwrap().balance,
            U256::from(50u64)
        );
        Ok(())
    }
}
