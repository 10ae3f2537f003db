/*
[INPUT]:  Fetched token sets and deletion requests
[OUTPUT]: Live token sets, spendable proofs and balances per mint
[POS]:    Wallet layer - liveness view over the append-only ledger
[UPDATE]: When supersession rules change
*/

use std::collections::{BTreeMap, HashSet};

use crate::http::{GatewayError, Result};
use crate::types::{DeleteTombstone, EventId, Kind, Proof, Stored, TokenSet, total_amount};

/// Live view of the wallet.
///
/// A token set is live unless a newer set lists it in `del` or a deletion
/// request targeting kind 7375 names it.
#[derive(Debug, Clone, Default)]
pub struct WalletState {
    live: Vec<Stored<TokenSet>>,
    retired: HashSet<EventId>,
}

impl WalletState {
    pub fn from_events(token_sets: Vec<Stored<TokenSet>>, tombstones: &[DeleteTombstone]) -> Self {
        let mut retired: HashSet<EventId> = token_sets
            .iter()
            .flat_map(|stored| stored.record.supersedes.iter().copied())
            .collect();
        retired.extend(
            tombstones
                .iter()
                .filter(|tombstone| tombstone.target_kind == Kind::TOKEN_SET)
                .flat_map(|tombstone| tombstone.target_ids.iter().copied()),
        );

        let mut live: Vec<Stored<TokenSet>> = token_sets
            .into_iter()
            .filter(|stored| !retired.contains(&stored.event_id))
            .collect();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Self { live, retired }
    }

    pub fn live_sets(&self) -> &[Stored<TokenSet>] {
        &self.live
    }

    pub fn is_live(&self, id: &EventId) -> bool {
        self.live.iter().any(|stored| stored.event_id == *id)
    }

    pub fn is_retired(&self, id: &EventId) -> bool {
        self.retired.contains(id)
    }

    pub fn live_sets_for<'a>(&'a self, mint: &'a str) -> impl Iterator<Item = &'a Stored<TokenSet>> + 'a {
        self.live.iter().filter(move |stored| stored.record.mint == mint)
    }

    /// Ids to pass as `consumed_ids` when spending from `mint`
    pub fn live_ids(&self, mint: &str) -> Vec<EventId> {
        self.live_sets_for(mint).map(|stored| stored.event_id).collect()
    }

    pub fn mints(&self) -> Vec<String> {
        let mut mints: Vec<String> = self.live.iter().map(|stored| stored.record.mint.clone()).collect();
        mints.sort();
        mints.dedup();
        mints
    }

    /// Spendable proofs at `mint`, one per secret
    pub fn proofs(&self, mint: &str) -> Vec<Proof> {
        let mut seen = HashSet::new();
        self.live_sets_for(mint)
            .flat_map(|stored| stored.record.proofs.iter())
            .filter(|proof| seen.insert(proof.secret.clone()))
            .cloned()
            .collect()
    }

    pub fn balance(&self, mint: &str) -> Result<u64> {
        total_amount(&self.proofs(mint))
    }

    pub fn balances(&self) -> Result<BTreeMap<String, u64>> {
        self.mints()
            .into_iter()
            .map(|mint| {
                let balance = self.balance(&mint)?;
                Ok((mint, balance))
            })
            .collect()
    }

    pub fn total_balance(&self) -> Result<u64> {
        self.balances()?.values().try_fold(0u64, |acc, balance| {
            acc.checked_add(*balance)
                .ok_or_else(|| GatewayError::InvalidProof("wallet balance overflows".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "https://mint.example";

    fn stored(byte: u8, created_at: u64, set: TokenSet) -> Stored<TokenSet> {
        Stored {
            event_id: EventId::from_bytes([byte; 32]),
            created_at,
            record: set,
        }
    }

    fn proof(amount: u64, secret: &str) -> Proof {
        Proof::new("009a1f293253e41e", amount, secret, "02c0ffee")
    }

    #[test]
    fn test_superseded_sets_are_not_live() {
        let old = stored(1, 10, TokenSet::new(MINT, vec![proof(60, "a"), proof(40, "b")], vec![]));
        let new = stored(
            2,
            20,
            TokenSet::new(MINT, vec![proof(10, "c")], vec![EventId::from_bytes([1; 32])]),
        );
        let state = WalletState::from_events(vec![old, new], &[]);

        assert_eq!(state.live_sets().len(), 1);
        assert!(state.is_retired(&EventId::from_bytes([1; 32])));
        assert_eq!(state.balance(MINT).unwrap(), 10);
    }

    #[test]
    fn test_tombstoned_sets_are_not_live() {
        let set = stored(1, 10, TokenSet::new(MINT, vec![proof(5, "a")], vec![]));
        let tombstone = DeleteTombstone::token_sets(vec![EventId::from_bytes([1; 32])]);
        let state = WalletState::from_events(vec![set], &[tombstone]);
        assert_eq!(state.total_balance().unwrap(), 0);
    }

    #[test]
    fn test_tombstone_for_other_kind_is_ignored() {
        let set = stored(1, 10, TokenSet::new(MINT, vec![proof(5, "a")], vec![]));
        let tombstone = DeleteTombstone {
            target_kind: Kind::SPENDING_HISTORY,
            target_ids: vec![EventId::from_bytes([1; 32])],
        };
        let state = WalletState::from_events(vec![set], &[tombstone]);
        assert_eq!(state.total_balance().unwrap(), 5);
    }

    #[test]
    fn test_balances_per_mint_and_duplicate_secrets() {
        let a = stored(1, 10, TokenSet::new(MINT, vec![proof(8, "x")], vec![]));
        let b = stored(2, 11, TokenSet::new(MINT, vec![proof(8, "x"), proof(2, "y")], vec![]));
        let c = stored(3, 12, TokenSet::new("https://other.example", vec![proof(7, "z")], vec![]));
        let state = WalletState::from_events(vec![a, b, c], &[]);

        assert_eq!(state.balance(MINT).unwrap(), 10);
        assert_eq!(state.balances().unwrap().len(), 2);
        assert_eq!(state.total_balance().unwrap(), 17);
        assert_eq!(state.live_ids(MINT).len(), 2);
    }
}
