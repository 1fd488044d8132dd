//! Transaction extractor.
//!
//! Walks a recorded call tree, partitions the addresses it meets into
//! user-supplied and proxy-related sets, synthesises token movements from
//! native-value calls and ERC-20 Transfer events, and — once extraction has
//! finished — classifies each action's movements as deposits or withdrawals
//! into the per-user ledger while growing the related-address graph.

use ethereum_types::{Address, H256};
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::abi::{AbiFunction, AbiStore, SEL_TRANSFER, SEL_TRANSFER_FROM};
use crate::registry::ApplicationInfo;
use crate::session::AnalysisSession;
use crate::types::{
    ActionInfo, CallKind, Event, ExternalTx, InternalCall, TRANSFER_TOPIC, TokenAction, TokenTx,
};

/// Stateless over the application under analysis; all accumulation goes
/// through the [`AnalysisSession`].
pub struct Extractor<'a> {
    app: &'a ApplicationInfo,
    abis: &'a AbiStore,
}

/// Evolving per-transaction walk state.
struct WalkState {
    user_supplied: FxHashSet<Address>,
    proxy_related: FxHashSet<Address>,
    transfer_index: u32,
    /// Action boundaries met during the walk; materialised into
    /// [`ActionInfo`]s with the final partitions once the tree completes.
    pending: Vec<PendingAction>,
}

struct PendingAction {
    function: String,
    initiator: Address,
    token_txs: Vec<TokenTx>,
}

impl<'a> Extractor<'a> {
    pub fn new(app: &'a ApplicationInfo, abis: &'a AbiStore) -> Self {
        Extractor { app, abis }
    }

    /// Ingest one recorded transaction.
    ///
    /// Only trees with a single outer call are processed; token movements
    /// that end up outside every action boundary are discarded.
    pub fn extract_token_txs(&self, tx: &ExternalTx, session: &mut AnalysisSession) {
        let [root] = tx.calls.as_slice() else {
            return;
        };
        let mut state = WalkState {
            user_supplied: [root.from].into_iter().collect(),
            proxy_related: self.app.proxies.clone(),
            transfer_index: 0,
            pending: Vec::new(),
        };
        let _ = self.walk(tx, root, &mut state, session);

        // all actions of one transaction share the tree-final partitions
        for pending in state.pending {
            session.actions.push(ActionInfo {
                function: pending.function,
                initiator: pending.initiator,
                block: tx.block,
                tx_index: tx.tx_index,
                token_txs: pending.token_txs,
                user_supplied: state.user_supplied.clone(),
                proxy_related: state.proxy_related.clone(),
            });
        }
    }

    fn walk(
        &self,
        tx: &ExternalTx,
        call: &InternalCall,
        state: &mut WalkState,
        session: &mut AnalysisSession,
    ) -> Vec<TokenTx> {
        let mut is_action = false;
        let mut function = String::from("none");

        if self.abis.is_proxy(call.to) && call.kind != CallKind::StaticCall {
            if call.kind == CallKind::Create {
                session.managers.insert(call.from);
            }
            if state.user_supplied.contains(&call.from) {
                is_action = true;
            }
            if call.input.len() >= 4 {
                if let Some(method) = self.abis.method_for(call.to, &call.input) {
                    function = method.label();
                    self.mine_address_args(method, call, state, session);
                }
            }
            state.proxy_related.insert(call.to);
        }

        if call.kind != CallKind::StaticCall
            && call.kind != CallKind::DelegateCall
            && !state.user_supplied.contains(&call.to)
            && !state.proxy_related.contains(&call.to)
        {
            if state.user_supplied.contains(&call.from) && !session.is_manager(call.to) {
                state.user_supplied.insert(call.to);
            } else if state.proxy_related.contains(&call.from) {
                state.proxy_related.insert(call.to);
            }
        }

        let mut token_txs = Vec::new();
        if let Some(value) = call.value
            && !value.is_zero()
        {
            token_txs.push(TokenTx {
                block: tx.block,
                tx_index: tx.tx_index,
                transfer_index: state.transfer_index,
                sender: call.from,
                recipient: call.to,
                amount: value,
                token: Address::zero(),
                action: TokenAction::None,
            });
            state.transfer_index += 1;
        }

        for child in &call.calls {
            let nested = self.walk(tx, child, state, session);
            token_txs.extend(nested);
        }

        for event in &call.events {
            let index = state.transfer_index;
            state.transfer_index += 1;
            let Some(mut transfer) = decode_transfer(event) else {
                continue;
            };
            transfer.block = tx.block;
            transfer.tx_index = tx.tx_index;
            transfer.transfer_index = index;
            if self.app.is_lp_token(transfer.token)
                && !transfer.sender.is_zero()
                && !transfer.recipient.is_zero()
                && !self.abis.is_proxy(transfer.sender)
                && !self.abis.is_proxy(transfer.recipient)
            {
                session.relate(transfer.recipient, transfer.sender, tx.block);
            }
            token_txs.push(transfer);
        }

        if is_action {
            for transfer in &token_txs {
                if self.abis.is_proxy(transfer.token) {
                    continue;
                }
                if !transfer.sender.is_zero() && !transfer.recipient.is_zero() {
                    *session.address_counts.entry(transfer.sender).or_default() += 1;
                    *session.address_counts.entry(transfer.recipient).or_default() += 1;
                }
            }
            trace!(
                block = tx.block,
                tx_index = tx.tx_index,
                %function,
                transfers = token_txs.len(),
                "action boundary"
            );
            state.pending.push(PendingAction {
                function,
                initiator: call.from,
                token_txs,
            });
            return Vec::new();
        }
        token_txs
    }

    fn mine_address_args(
        &self,
        method: &AbiFunction,
        call: &InternalCall,
        state: &mut WalkState,
        session: &mut AnalysisSession,
    ) {
        let caller_is_manager = session.is_manager(call.from);
        let role_exempt =
            method.selector == SEL_TRANSFER || method.selector == SEL_TRANSFER_FROM;
        for arg in method.address_args(&call.input) {
            if state.user_supplied.contains(&call.from)
                && !state.proxy_related.contains(&arg)
                && !session.is_manager(arg)
            {
                state.user_supplied.insert(arg);
            }
            if caller_is_manager && !role_exempt {
                session.managers.insert(arg);
            }
        }
    }

    /// Second extraction pass over transactions recorded under the LP
    /// tokens themselves: only grows the related graph.
    pub fn extract_lp_relations(&self, tx: &ExternalTx, session: &mut AnalysisSession) {
        let [root] = tx.calls.as_slice() else {
            return;
        };
        self.walk_lp(tx, root, session);
    }

    fn walk_lp(&self, tx: &ExternalTx, call: &InternalCall, session: &mut AnalysisSession) {
        for child in &call.calls {
            self.walk_lp(tx, child, session);
        }
        for event in &call.events {
            let Some(transfer) = decode_transfer(event) else {
                continue;
            };
            if self.app.is_lp_token(transfer.token)
                && !transfer.sender.is_zero()
                && !transfer.recipient.is_zero()
                && !self.abis.is_proxy(transfer.sender)
                && !self.abis.is_proxy(transfer.recipient)
            {
                session.relate(transfer.recipient, transfer.sender, tx.block);
            }
        }
    }

    /// Classify every recorded action's movements into the ledger.
    ///
    /// Runs once over the frozen action list, after the common-address
    /// filter. LP mints/burns decide the deposit-target and withdraw-source
    /// sets; candidates with both endpoints non-zero become deposits or
    /// withdrawals per the user/proxy partition of their action.
    pub fn classify_actions(&self, session: &mut AnalysisSession) {
        let actions = std::mem::take(&mut session.actions);
        for action in &actions {
            let mut deposit_to: Vec<Address> = Vec::new();
            let mut withdraw_from: Vec<Address> = Vec::new();
            let mut candidates: Vec<TokenTx> = Vec::new();
            for transfer in &action.token_txs {
                if self.app.is_lp_token(transfer.token) {
                    if transfer.sender.is_zero() && !session.is_common(transfer.recipient) {
                        deposit_to.push(transfer.recipient);
                    } else if transfer.recipient.is_zero() && !session.is_common(transfer.sender) {
                        withdraw_from.push(transfer.sender);
                    }
                } else if !transfer.sender.is_zero() && !transfer.recipient.is_zero() {
                    candidates.push(transfer.clone());
                }
            }

            for mut transfer in candidates {
                let sender = transfer.sender;
                let recipient = transfer.recipient;
                let token = transfer.token;
                let sender_supplied = action.user_supplied.contains(&sender);
                let recipient_supplied = action.user_supplied.contains(&recipient);

                if sender_supplied
                    && !session.is_common(sender)
                    && !recipient_supplied
                    && (session.is_common(recipient)
                        || action.proxy_related.contains(&recipient)
                        || sender == action.initiator)
                {
                    transfer.action = TokenAction::Deposit;
                    session.push_token_tx(sender, transfer);
                    for target in &deposit_to {
                        session.relate(*target, sender, action.block);
                    }
                    if !action.proxy_related.contains(&sender) && !session.is_manager(sender) {
                        session.relate(action.initiator, sender, action.block);
                    }
                    *session.related_token.entry(token).or_default() += 1;
                } else if recipient_supplied
                    && !session.is_common(recipient)
                    && !sender_supplied
                    && (session.is_common(sender)
                        || action.proxy_related.contains(&sender)
                        || recipient == action.initiator)
                {
                    transfer.action = TokenAction::Withdraw;
                    session.push_token_tx(recipient, transfer);
                    for source in &withdraw_from {
                        session.relate(recipient, *source, action.block);
                    }
                    if !action.proxy_related.contains(&recipient) && !session.is_manager(recipient)
                    {
                        session.relate(recipient, action.initiator, action.block);
                    }
                    *session.related_token.entry(token).or_default() += 1;
                }
            }
        }
        session.actions = actions;
    }
}

/// Decode an ERC-20 Transfer event into an unclassified token movement.
///
/// Recognised by topic 0 and exactly three topics; events whose data cannot
/// hold the amount word are dropped.
pub fn decode_transfer(event: &Event) -> Option<TokenTx> {
    if event.topics.len() != 3 || event.topics[0] != TRANSFER_TOPIC {
        return None;
    }
    let amount_word = event.data.get(..32)?;
    Some(TokenTx {
        block: 0,
        tx_index: 0,
        transfer_index: 0,
        sender: address_from_topic(&event.topics[1]),
        recipient: address_from_topic(&event.topics[2]),
        amount: ethereum_types::U256::from_big_endian(amount_word),
        token: event.address,
        action: TokenAction::None,
    })
}

/// Last 20 bytes of a 32-byte topic.
fn address_from_topic(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..])
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ethereum_types::U256;

    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn transfer_event(token: Address, from: Address, to: Address, amount: u64) -> Event {
        let mut topics = vec![TRANSFER_TOPIC];
        topics.push(H256::from(from));
        topics.push(H256::from(to));
        let data = U256::from(amount).to_big_endian();
        Event {
            address: token,
            topics,
            data: Bytes::copy_from_slice(&data),
            index: 0,
        }
    }

    #[test]
    fn decodes_well_formed_transfer() {
        let event = transfer_event(addr(0x70), addr(1), addr(2), 500);
        let tx = decode_transfer(&event).unwrap();
        assert_eq!(tx.sender, addr(1));
        assert_eq!(tx.recipient, addr(2));
        assert_eq!(tx.amount, U256::from(500));
        assert_eq!(tx.token, addr(0x70));
        assert_eq!(tx.action, TokenAction::None);
    }

    #[test]
    fn drops_transfer_with_wrong_topic_count() {
        let mut event = transfer_event(addr(0x70), addr(1), addr(2), 500);
        event.topics.pop();
        assert!(decode_transfer(&event).is_none());
    }

    #[test]
    fn drops_transfer_with_short_data() {
        let mut event = transfer_event(addr(0x70), addr(1), addr(2), 500);
        event.data = Bytes::from_static(&[0u8; 8]);
        assert!(decode_transfer(&event).is_none());
    }
}
