//! Per-user token-flow construction.
//!
//! Folds each user's ledger into time-ordered flows with running deposit and
//! withdraw totals: one flow per real token, one per stablecoin anchor, a
//! mixed flow in the common numéraire (per transfer and per transaction),
//! plus the single-token shortcut and the unsupported-token sentinel.

use ethereum_types::Address;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::price::{DAI, PriceOracle, StableToken, WBTC, WETH};
use crate::registry::ApplicationInfo;
use crate::session::AnalysisSession;
use crate::types::{
    Anchor, FlowAction, FlowSlot, TokenAction, TokenFlow, TokenTx, UserFlowMap, u256_to_f64,
};

pub struct FlowBuilder<'a> {
    session: &'a AnalysisSession,
    app: &'a ApplicationInfo,
    stable_tokens: &'a FxHashMap<Address, StableToken>,
    oracle: &'a PriceOracle,
}

/// Flow-builder output: the per-user flow map plus every token that had to
/// be treated as unsupported (and how often it came up).
pub struct FlowOutput {
    pub flows: UserFlowMap,
    pub unsupported_tokens: FxHashMap<Address, usize>,
}

impl<'a> FlowBuilder<'a> {
    pub fn new(
        session: &'a AnalysisSession,
        app: &'a ApplicationInfo,
        stable_tokens: &'a FxHashMap<Address, StableToken>,
        oracle: &'a PriceOracle,
    ) -> Self {
        FlowBuilder {
            session,
            app,
            stable_tokens,
            oracle,
        }
    }

    pub fn build(&self) -> FlowOutput {
        let mut flows = UserFlowMap::default();
        let mut unsupported_tokens: FxHashMap<Address, usize> = FxHashMap::default();

        for (user, token_map) in &self.session.ledger {
            let mut slots: FxHashMap<FlowSlot, Vec<TokenFlow>> = FxHashMap::default();
            let mut merged: Vec<TokenTx> = Vec::new();
            let mut per_anchor: FxHashMap<Anchor, Vec<TokenTx>> = FxHashMap::default();
            let tokens: Vec<Address> = token_map.keys().copied().collect();

            for (token, txs) in token_map {
                merged.extend(txs.iter().cloned());
                if let Some(stable) = self.stable_tokens.get(token) {
                    per_anchor
                        .entry(stable.anchor)
                        .or_default()
                        .extend(txs.iter().cloned());
                } else if self.app.is_lp_token(*token) {
                    continue;
                }
                slots.insert(FlowSlot::for_token(*token), token_flow(txs));
            }

            for (anchor, txs) in per_anchor {
                slots.insert(
                    FlowSlot::Anchor(anchor),
                    self.anchor_flow(txs),
                );
            }

            let (mixed, mixed_per_tx, saw_unsupported) =
                self.mixed_flows(merged, &mut unsupported_tokens);
            slots.insert(FlowSlot::Mixed, mixed);
            slots.insert(FlowSlot::MixedPerTx, mixed_per_tx);

            if let [only] = tokens.as_slice() {
                let shortcut = slots
                    .get(&FlowSlot::for_token(*only))
                    .cloned()
                    .unwrap_or_default();
                slots.insert(FlowSlot::SingleShortcut, shortcut);
            } else if saw_unsupported {
                slots.insert(FlowSlot::Unsupported, Vec::new());
            }

            flows.insert(*user, slots);
        }

        if !unsupported_tokens.is_empty() {
            debug!(tokens = unsupported_tokens.len(), "unsupported tokens seen");
        }
        FlowOutput {
            flows,
            unsupported_tokens,
        }
    }

    /// Stablecoin amounts folded onto their anchor at the fixed rate,
    /// normalised to 18 decimals. Only plain deposits and withdrawals move
    /// the totals.
    fn anchor_flow(&self, mut txs: Vec<TokenTx>) -> Vec<TokenFlow> {
        txs.sort_by_key(TokenTx::sort_key);
        let mut flows = vec![TokenFlow::sentinel()];
        let (mut deposit, mut withdraw) = (0.0f64, 0.0f64);
        for tx in &txs {
            if tx.amount.is_zero() {
                continue;
            }
            let Some(stable) = self.stable_tokens.get(&tx.token) else {
                continue;
            };
            let rate = stable.rate_to_anchor as f64
                * 10f64.powi(18 - stable.decimals as i32);
            let amount = u256_to_f64(tx.amount) * rate;
            match tx.action {
                TokenAction::Deposit => deposit += amount,
                TokenAction::Withdraw => withdraw += amount,
                _ => {}
            }
            flows.push(TokenFlow {
                block: tx.block,
                tx_index: tx.tx_index,
                transfer_index: tx.transfer_index,
                action: FlowAction::Single(tx.action),
                amount,
                total_deposit: deposit,
                total_withdraw: withdraw,
                balance: (deposit - withdraw).max(0.0),
            });
        }
        flows
    }

    /// The mixed flows: every transfer converted to the common numéraire
    /// (per-transfer), and the same entries collapsed to one record per
    /// (block, tx-index) with a set-valued action label (per-transaction).
    fn mixed_flows(
        &self,
        mut merged: Vec<TokenTx>,
        unsupported_tokens: &mut FxHashMap<Address, usize>,
    ) -> (Vec<TokenFlow>, Vec<TokenFlow>, bool) {
        merged.sort_by_key(TokenTx::sort_key);
        let mut per_transfer = vec![TokenFlow::sentinel()];
        let mut per_tx: Vec<TokenFlow> = Vec::new();
        let mut current = TokenFlow::sentinel();
        let (mut deposit, mut withdraw) = (0.0f64, 0.0f64);
        let mut saw_unsupported = false;

        for tx in &merged {
            if (tx.block, tx.tx_index) != (current.block, current.tx_index) {
                per_tx.push(current.clone());
                current = TokenFlow {
                    block: tx.block,
                    tx_index: tx.tx_index,
                    transfer_index: 0,
                    action: FlowAction::Merged {
                        deposit: false,
                        withdraw: false,
                    },
                    amount: 0.0,
                    total_deposit: deposit,
                    total_withdraw: withdraw,
                    balance: (deposit - withdraw).max(0.0),
                };
            }
            if tx.amount.is_zero() {
                continue;
            }
            let Some(amount) = self.convert(tx) else {
                *unsupported_tokens.entry(tx.token).or_default() += 1;
                saw_unsupported = true;
                continue;
            };

            let mut is_deposit = false;
            let mut is_withdraw = false;
            match tx.action {
                TokenAction::Deposit => {
                    is_deposit = true;
                    deposit += amount;
                    current.amount += amount;
                }
                TokenAction::Withdraw => {
                    is_withdraw = true;
                    withdraw += amount;
                    current.amount -= amount;
                }
                _ => {}
            }
            let balance = (deposit - withdraw).max(0.0);
            per_transfer.push(TokenFlow {
                block: tx.block,
                tx_index: tx.tx_index,
                transfer_index: tx.transfer_index,
                action: FlowAction::Single(tx.action),
                amount,
                total_deposit: deposit,
                total_withdraw: withdraw,
                balance,
            });
            if let FlowAction::Merged {
                deposit: seen_deposit,
                withdraw: seen_withdraw,
            } = &mut current.action
            {
                *seen_deposit |= is_deposit;
                *seen_withdraw |= is_withdraw;
            }
            current.total_deposit = deposit;
            current.total_withdraw = withdraw;
            current.balance = balance;
        }
        per_tx.push(current);
        (per_transfer, per_tx, saw_unsupported)
    }

    /// Convert one transfer's raw amount into the common numéraire.
    ///
    /// Native coin and WETH are the numéraire itself; USD stables route via
    /// the DAI table, BTC stables via WBTC, ETH stables fold at their fixed
    /// anchor rate; everything else needs its own price table at the
    /// transfer's bucketed block. `None` means the token is unsupported at
    /// this point.
    fn convert(&self, tx: &TokenTx) -> Option<f64> {
        let amount = u256_to_f64(tx.amount);
        if tx.token.is_zero() || tx.token == WETH {
            return Some(amount);
        }
        if let Some(stable) = self.stable_tokens.get(&tx.token) {
            return match stable.anchor {
                Anchor::Usd => {
                    let scaled = amount * 10f64.powi(18 - stable.decimals as i32);
                    self.route_rate(DAI, tx.block).map(|rate| scaled * rate)
                }
                Anchor::Btc => {
                    let scaled = amount * 10f64.powi(8 - stable.decimals as i32);
                    self.route_rate(WBTC, tx.block).map(|rate| scaled * rate)
                }
                Anchor::Eth => Some(
                    amount
                        * stable.rate_to_anchor as f64
                        * 10f64.powi(18 - stable.decimals as i32),
                ),
            };
        }
        self.route_rate(tx.token, tx.block)
            .map(|rate| amount * rate)
    }

    fn route_rate(&self, token: Address, block: u64) -> Option<f64> {
        self.oracle.rate(token, block).filter(|rate| *rate > 0.0)
    }
}

/// Running flow for one real token; all seven action kinds move the totals.
fn token_flow(txs: &[TokenTx]) -> Vec<TokenFlow> {
    let mut sorted = txs.to_vec();
    sorted.sort_by_key(TokenTx::sort_key);
    let mut flows = vec![TokenFlow::sentinel()];
    let (mut deposit, mut withdraw) = (0.0f64, 0.0f64);
    for tx in &sorted {
        if tx.amount.is_zero() {
            continue;
        }
        let amount = u256_to_f64(tx.amount);
        if tx.action.is_inflow() {
            deposit += amount;
        } else if tx.action.is_outflow() {
            withdraw += amount;
        }
        flows.push(TokenFlow {
            block: tx.block,
            tx_index: tx.tx_index,
            transfer_index: tx.transfer_index,
            action: FlowAction::Single(tx.action),
            amount,
            total_deposit: deposit,
            total_withdraw: withdraw,
            balance: (deposit - withdraw).max(0.0),
        });
    }
    flows
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;

    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn tx(block: u64, transfer_index: u32, amount: u64, action: TokenAction) -> TokenTx {
        TokenTx {
            block,
            tx_index: 0,
            transfer_index,
            sender: addr(1),
            recipient: addr(2),
            amount: U256::from(amount),
            token: addr(0x70),
            action,
        }
    }

    #[test]
    fn token_flow_prepends_sentinel_and_clamps_balance() {
        let txs = vec![
            tx(100, 0, 1_000, TokenAction::Deposit),
            tx(200, 0, 1_500, TokenAction::Withdraw),
        ];
        let flows = token_flow(&txs);
        assert_eq!(flows.len(), 3);
        assert_eq!(flows[0].block, 0);
        assert_eq!(flows[1].total_deposit, 1_000.0);
        assert_eq!(flows[1].balance, 1_000.0);
        assert_eq!(flows[2].total_withdraw, 1_500.0);
        // balance never goes negative
        assert_eq!(flows[2].balance, 0.0);
    }

    #[test]
    fn token_flow_drops_zero_amounts_and_sorts() {
        let txs = vec![
            tx(200, 1, 50, TokenAction::Withdraw),
            tx(100, 0, 0, TokenAction::Deposit),
            tx(100, 1, 80, TokenAction::Deposit),
        ];
        let flows = token_flow(&txs);
        assert_eq!(flows.len(), 3); // sentinel + two non-zero
        assert_eq!(flows[1].block, 100);
        assert_eq!(flows[2].block, 200);
    }

    #[test]
    fn borrow_and_swap_legs_move_the_totals() {
        let txs = vec![
            tx(100, 0, 10, TokenAction::BorrowIn),
            tx(110, 0, 20, TokenAction::SwapOut),
        ];
        let flows = token_flow(&txs);
        assert_eq!(flows[1].total_deposit, 10.0);
        assert_eq!(flows[2].total_withdraw, 20.0);
        // but neither leg is a literal deposit or withdraw for the scanner
        assert!(!flows[1].action.contains_deposit());
        assert!(!flows[2].action.contains_withdraw());
    }

    #[test]
    fn monotone_running_totals() {
        let actions = [
            TokenAction::Deposit,
            TokenAction::Withdraw,
            TokenAction::Deposit,
            TokenAction::BorrowOut,
            TokenAction::SwapIn,
            TokenAction::Withdraw,
        ];
        let txs: Vec<TokenTx> = actions
            .iter()
            .enumerate()
            .map(|(i, action)| tx(100 + i as u64, i as u32, 7 + i as u64, *action))
            .collect();
        let flows = token_flow(&txs);
        for pair in flows.windows(2) {
            assert!(pair[1].total_deposit >= pair[0].total_deposit);
            assert!(pair[1].total_withdraw >= pair[0].total_withdraw);
            let expect =
                (pair[1].total_deposit - pair[1].total_withdraw).max(0.0);
            assert_eq!(pair[1].balance, expect);
        }
    }
}
