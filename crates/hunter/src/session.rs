//! Analysis session state.
//!
//! Owns everything the extractor accumulates over one run: the per-user
//! token ledger, the related-address graph, action records, address
//! participation counts, and the role/common-address marks derived from
//! them. Threading the session through calls replaces the module-level
//! collectors the analysis would otherwise need.

use ethereum_types::Address;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::types::{ActionInfo, RelatedGraph, TokenTx, TokenTxLedger};

/// An address counts as infrastructure once it participates in more than
/// this share of all observed actions.
pub const COMMON_ADDRESS_SHARE: f64 = 0.3;

/// The common-address filter only activates past this many actions.
pub const COMMON_ADDRESS_FLOOR: usize = 100;

/// A user with more related addresses than this is a common related user.
pub const COMMON_RELATED_LIMIT: usize = 50;

#[derive(Debug, Default)]
pub struct AnalysisSession {
    /// user → token → time-ordered token movements.
    pub ledger: TokenTxLedger,
    /// user → related address → earliest linking block.
    pub related: RelatedGraph,
    /// Distinct per-action participation counts, fed to the common filter.
    pub address_counts: FxHashMap<Address, usize>,
    /// Every observed outer user→proxy invocation.
    pub actions: Vec<ActionInfo>,
    /// Addresses holding the `manager` role.
    pub managers: FxHashSet<Address>,
    /// token → number of classified movements it appeared in.
    pub related_token: FxHashMap<Address, usize>,
    /// Infrastructure addresses excluded from per-user scans.
    pub common_addresses: FxHashSet<Address>,
    /// Users linked to implausibly many related addresses.
    pub common_related_users: FxHashSet<Address>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        AnalysisSession::default()
    }

    /// Link `related` into `main`'s related set at `block`, keeping the
    /// minimum block across repeated links. Self-links are dropped.
    pub fn relate(&mut self, main: Address, related: Address, block: u64) {
        if main == related {
            return;
        }
        let entry = self
            .related
            .entry(main)
            .or_default()
            .entry(related)
            .or_insert(block);
        if *entry > block {
            *entry = block;
        }
    }

    /// Append a classified movement to the owning user's ledger.
    pub fn push_token_tx(&mut self, user: Address, tx: TokenTx) {
        self.ledger
            .entry(user)
            .or_default()
            .entry(tx.token)
            .or_default()
            .push(tx);
    }

    pub fn is_common(&self, address: Address) -> bool {
        self.common_addresses.contains(&address)
    }

    pub fn is_manager(&self, address: Address) -> bool {
        self.managers.contains(&address)
    }

    /// Recompute the common-address set from the accumulated action counts.
    ///
    /// Proxies are always common; other addresses qualify once they appear
    /// in more than `COMMON_ADDRESS_SHARE` of actions, gated on having seen
    /// more than `COMMON_ADDRESS_FLOOR` actions. Idempotent.
    pub fn update_common_addresses(&mut self, proxies: &FxHashSet<Address>) {
        self.common_addresses.clear();
        self.common_addresses.extend(proxies.iter().copied());
        let total = self.actions.len();
        if total <= COMMON_ADDRESS_FLOOR {
            return;
        }
        let threshold = total as f64 * COMMON_ADDRESS_SHARE;
        for (address, count) in &self.address_counts {
            if *count as f64 > threshold {
                info!(
                    address = %format!("{address:#x}"),
                    count,
                    actions = total,
                    "marking common address"
                );
                self.common_addresses.insert(*address);
            }
        }
    }

    /// Mark users whose related set outgrew `COMMON_RELATED_LIMIT`.
    pub fn update_common_related_users(&mut self) {
        for (user, links) in &self.related {
            if links.len() > COMMON_RELATED_LIMIT {
                self.common_related_users.insert(*user);
            }
        }
        if !self.common_related_users.is_empty() {
            debug!(count = self.common_related_users.len(), "common related users");
        }
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;

    use super::*;
    use crate::types::TokenAction;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn dummy_tx(token: Address) -> TokenTx {
        TokenTx {
            block: 1,
            tx_index: 0,
            transfer_index: 0,
            sender: addr(1),
            recipient: addr(2),
            amount: U256::from(5u64),
            token,
            action: TokenAction::Deposit,
        }
    }

    #[test]
    fn relate_keeps_minimum_block_and_forbids_self_links() {
        let mut session = AnalysisSession::new();
        session.relate(addr(1), addr(2), 100);
        session.relate(addr(1), addr(2), 50);
        session.relate(addr(1), addr(2), 70);
        assert_eq!(session.related[&addr(1)][&addr(2)], 50);

        session.relate(addr(3), addr(3), 10);
        assert!(!session.related.contains_key(&addr(3)));
    }

    #[test]
    fn common_addresses_need_floor_and_share() {
        let mut session = AnalysisSession::new();
        let proxies: FxHashSet<Address> = [addr(0xff)].into_iter().collect();
        // below the floor nothing but proxies qualifies
        session.address_counts.insert(addr(9), 1_000);
        session.update_common_addresses(&proxies);
        assert!(!session.is_common(addr(9)));

        for i in 0..101 {
            session.actions.push(ActionInfo {
                function: "none".into(),
                initiator: addr(1),
                block: i,
                tx_index: 0,
                token_txs: vec![dummy_tx(addr(7))],
                user_supplied: FxHashSet::default(),
                proxy_related: FxHashSet::default(),
            });
        }
        session.address_counts.insert(addr(8), 30); // 30 <= 0.3 * 101
        session.update_common_addresses(&proxies);
        assert!(session.is_common(addr(9)));
        assert!(!session.is_common(addr(8)));
    }

    #[test]
    fn common_related_users_over_limit() {
        let mut session = AnalysisSession::new();
        for i in 0..=COMMON_RELATED_LIMIT as u64 {
            session.relate(addr(1), addr(100 + i), 5);
        }
        session.update_common_related_users();
        assert!(session.common_related_users.contains(&addr(1)));
    }
}
