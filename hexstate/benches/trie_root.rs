//! State-commit benchmarks.
//!
//! Measures root computation through the full commit pipeline (buffered
//! updates, resolve loop, hashing, hash side-table export) at several
//! batch sizes, plus the side-table rebuild of the upper account-trie
//! levels.
//!
//! ```bash
//! cargo bench --package hexstate --bench trie_root
//! ```
use criterion::{criterion_group, criterion_main, Criterion};
use hexstate::{
    constant::EMPTY_ROOT,
    trie::rebuild_from_hashes,
    Account, MemDb, StateReader, StateWriter, TrieDbState,
};
use alloy_primitives::{Address, U256};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::hint::black_box;

/// Random fresh accounts for one block.
fn gen_accounts(n: usize, rng: &mut StdRng) -> Vec<(Address, Account)> {
    (0..n)
        .map(|_| {
            let address = Address::from(rng.gen::<[u8; 20]>());
            let account = Account {
                nonce: rng.gen_range(0..100),
                balance: U256::from(rng.gen_range(1..1_000_000u64)),
                ..Default::default()
            };
            (address, account)
        })
        .collect()
}

fn commit_block(state: &mut TrieDbState<MemDb>, block: u64, accounts: &[(Address, Account)]) {
    state.set_block_nr(block);
    for (address, account) in accounts {
        let original = state.read_account_data(*address).unwrap();
        state
            .trie_state_writer()
            .update_account_data(*address, original.as_ref(), account)
            .unwrap();
        state
            .db_state_writer()
            .update_account_data(*address, original.as_ref(), account)
            .unwrap();
    }
    black_box(state.trie_root().unwrap());
}

fn benchmark_commit(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);

    // One large batch: state sync and import workloads.
    c.bench_function("commit 10k fresh accounts", |b| {
        b.iter_batched(
            || gen_accounts(10_000, &mut rng),
            |accounts| {
                let mut state = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
                commit_block(&mut state, 1, &accounts);
            },
            criterion::BatchSize::SmallInput,
        );
    });

    // Typical block cadence: small updates against a warm trie.
    c.bench_function("commit 10 blocks of 100 updates", |b| {
        b.iter_batched(
            || {
                let mut state = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
                let base = gen_accounts(5_000, &mut rng);
                commit_block(&mut state, 1, &base);
                let blocks: Vec<Vec<(Address, Account)>> = (0..10)
                    .map(|_| {
                        base.iter()
                            .take(100)
                            .map(|(address, account)| {
                                let mut account = account.clone();
                                account.balance += U256::from(1u64);
                                (*address, account)
                            })
                            .collect()
                    })
                    .collect();
                (state, blocks)
            },
            |(mut state, blocks)| {
                for (i, accounts) in blocks.iter().enumerate() {
                    commit_block(&mut state, 2 + i as u64, accounts);
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn benchmark_rebuild(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    for size in [10_000usize, 100_000] {
        // Seed once; the measured operation reads only the side table.
        let mut state = TrieDbState::new(EMPTY_ROOT, MemDb::new(), 0);
        let accounts = gen_accounts(size, &mut rng);
        commit_block(&mut state, 1, &accounts);

        c.bench_function(&format!("rebuild upper levels, {size} accounts"), |b| {
            b.iter(|| black_box(rebuild_from_hashes(state.database()).unwrap()));
        });
    }
}

criterion_group!(benches, benchmark_commit, benchmark_rebuild);
criterion_main!(benches);
