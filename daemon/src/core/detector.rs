use std::collections::HashSet;

use alloy_primitives::B256;
use guardian_common::crypto::BlsPublicKey;

use super::{
    cache::{DepositEventCache, DepositLocator},
    chain::ChainClient,
};

/// An unused registry key that already appears on the deposit contract.
/// Evidence for a front-run; one entry per matching deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub pubkey: BlsPublicKey,
    pub block_number: u64,
    pub log_index: u32,
}

// A deposit only incriminates a key when it was made with the protocol's
// withdrawal credentials and is no newer than the registry snapshot
fn matching_deposits<'a>(
    key: &'a BlsPublicKey,
    locators: &'a [DepositLocator],
    withdrawal_credentials: B256,
    max_block: u64,
) -> impl Iterator<Item = Conflict> + 'a {
    locators
        .iter()
        .filter(move |l| l.wc == withdrawal_credentials && l.block_number <= max_block)
        .map(move |l| Conflict {
            pubkey: *key,
            block_number: l.block_number,
            log_index: l.log_index,
        })
}

/// Exact intersection of a module's unused keys against the cached deposit
/// history. No probabilistic structure stands between this and the pause
/// decision: the index lookup is verified per-deposit against the recorded
/// withdrawal credentials and block height.
pub async fn scan<C: ChainClient>(
    cache: &DepositEventCache<C>,
    unused: &HashSet<BlsPublicKey>,
    withdrawal_credentials: B256,
    max_block: u64,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for key in unused {
        let locators = cache.deposits_of(key).await;
        conflicts.extend(matching_deposits(
            key,
            &locators,
            withdrawal_credentials,
            max_block,
        ));
    }
    conflicts.sort_by_key(|c| (c.block_number, c.log_index, c.pubkey));
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> BlsPublicKey {
        let mut bytes = [0u8; 48];
        bytes[0] = byte;
        BlsPublicKey::new(bytes)
    }

    fn locator(block_number: u64, wc_byte: u8) -> DepositLocator {
        DepositLocator {
            block_number,
            log_index: 0,
            wc: B256::with_last_byte(wc_byte),
            amount: 32_000_000_000,
        }
    }

    #[test]
    fn ignores_foreign_withdrawal_credentials() {
        let k = key(1);
        let locators = vec![locator(10, 9)];
        let conflicts: Vec<_> =
            matching_deposits(&k, &locators, B256::with_last_byte(1), 100).collect();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn ignores_deposits_newer_than_snapshot() {
        let k = key(1);
        let locators = vec![locator(101, 1), locator(99, 1)];
        let conflicts: Vec<_> =
            matching_deposits(&k, &locators, B256::with_last_byte(1), 100).collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].block_number, 99);
    }

    #[test]
    fn reports_every_matching_deposit() {
        let k = key(2);
        let locators = vec![locator(5, 1), locator(7, 1)];
        let conflicts: Vec<_> =
            matching_deposits(&k, &locators, B256::with_last_byte(1), 100).collect();
        assert_eq!(conflicts.len(), 2);
    }
}
