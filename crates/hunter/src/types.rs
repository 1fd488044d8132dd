//! Core data types for the token-flow analysis.

use std::fmt;

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use hex_literal::hex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// keccak256("Transfer(address,address,uint256)").
pub const TRANSFER_TOPIC: H256 = H256(hex!(
    "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
));

/// Kind of an internal call inside a recorded transaction tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    Call,
    StaticCall,
    CallCode,
    DelegateCall,
    Create,
}

/// An event emitted during a recorded call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub index: u64,
}

/// One node of a recorded call tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalCall {
    pub from: Address,
    pub to: Address,
    pub kind: CallKind,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub calls: Vec<InternalCall>,
}

/// A recorded on-chain transaction: environment plus its call tree.
///
/// The extractor only processes trees with exactly one outer call (the
/// external sender's own invocation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTx {
    pub block: u64,
    pub timestamp: u64,
    pub tx_index: usize,
    pub calls: Vec<InternalCall>,
}

/// Classification assigned to a token movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenAction {
    Deposit,
    Withdraw,
    BorrowIn,
    BorrowOut,
    SwapIn,
    SwapOut,
    None,
}

impl TokenAction {
    /// Actions that add to a user's running deposit total.
    pub fn is_inflow(self) -> bool {
        matches!(
            self,
            TokenAction::Deposit | TokenAction::BorrowIn | TokenAction::SwapIn
        )
    }

    /// Actions that add to a user's running withdraw total.
    pub fn is_outflow(self) -> bool {
        matches!(
            self,
            TokenAction::Withdraw | TokenAction::BorrowOut | TokenAction::SwapOut
        )
    }
}

/// A single token movement observed inside one transaction.
///
/// `transfer_index` increases monotonically within a transaction and is the
/// final tie-break of the (block, tx-index, transfer-index) sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTx {
    pub block: u64,
    pub tx_index: usize,
    pub transfer_index: u32,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub token: Address,
    pub action: TokenAction,
}

impl TokenTx {
    pub fn sort_key(&self) -> (u64, usize, u32) {
        (self.block, self.tx_index, self.transfer_index)
    }
}

/// One user-initiated outer invocation of an application proxy, with every
/// token movement and the address partitions discovered during the walk.
#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub function: String,
    pub initiator: Address,
    pub block: u64,
    pub tx_index: usize,
    pub token_txs: Vec<TokenTx>,
    pub user_supplied: FxHashSet<Address>,
    pub proxy_related: FxHashSet<Address>,
}

/// Common numéraire class a stablecoin is pegged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    Eth,
    Usd,
    Btc,
}

/// Key of a per-user flow list: a real token or a synthetic view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSlot {
    /// The native coin (token address zero in the ledger).
    Native,
    /// All stablecoins pegged to one anchor, folded together.
    Anchor(Anchor),
    /// A single ERC-20 token.
    Token(Address),
    /// All tokens converted to the common numéraire, one entry per transfer.
    Mixed,
    /// The mixed view collapsed to one entry per (block, tx-index).
    MixedPerTx,
    /// Mirror of the only token a single-token user touched.
    SingleShortcut,
    /// Marker slot: the user touched a token with no usable price feed.
    Unsupported,
}

impl FlowSlot {
    pub fn for_token(token: Address) -> Self {
        if token.is_zero() {
            FlowSlot::Native
        } else {
            FlowSlot::Token(token)
        }
    }
}

impl fmt::Display for FlowSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowSlot::Native => write!(f, "native"),
            FlowSlot::Anchor(Anchor::Eth) => write!(f, "anchor-eth"),
            FlowSlot::Anchor(Anchor::Usd) => write!(f, "anchor-usd"),
            FlowSlot::Anchor(Anchor::Btc) => write!(f, "anchor-btc"),
            FlowSlot::Token(addr) => write!(f, "{addr:#x}"),
            FlowSlot::Mixed => write!(f, "mixed"),
            FlowSlot::MixedPerTx => write!(f, "mixed-per-tx"),
            FlowSlot::SingleShortcut => write!(f, "single-token"),
            FlowSlot::Unsupported => write!(f, "unsupported"),
        }
    }
}

impl Serialize for FlowSlot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Action label on a flow entry.
///
/// Per-transfer entries carry the ledger action verbatim; per-transaction
/// entries carry the set of sides seen among their constituents. Only literal
/// deposits and withdrawals count for the detector's scan points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FlowAction {
    Single(TokenAction),
    Merged { deposit: bool, withdraw: bool },
}

impl FlowAction {
    pub fn contains_deposit(&self) -> bool {
        match self {
            FlowAction::Single(action) => *action == TokenAction::Deposit,
            FlowAction::Merged { deposit, .. } => *deposit,
        }
    }

    pub fn contains_withdraw(&self) -> bool {
        match self {
            FlowAction::Single(action) => *action == TokenAction::Withdraw,
            FlowAction::Merged { withdraw, .. } => *withdraw,
        }
    }
}

/// One point of a per-user, per-slot flow with running totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenFlow {
    pub block: u64,
    pub tx_index: usize,
    pub transfer_index: u32,
    pub action: FlowAction,
    pub amount: f64,
    pub total_deposit: f64,
    pub total_withdraw: f64,
    pub balance: f64,
}

impl TokenFlow {
    /// Sentinel entry prepended at index 0 of every flow list.
    pub fn sentinel() -> Self {
        TokenFlow {
            block: 0,
            tx_index: 0,
            transfer_index: 0,
            action: FlowAction::Single(TokenAction::Deposit),
            amount: 0.0,
            total_deposit: 0.0,
            total_withdraw: 0.0,
            balance: 0.0,
        }
    }

    pub fn sort_key(&self) -> (u64, usize, u32) {
        (self.block, self.tx_index, self.transfer_index)
    }
}

/// One withdraw evaluation point recorded by the detector.
#[derive(Debug, Clone, Serialize)]
pub struct RateRecord {
    pub user: Address,
    pub slot: FlowSlot,
    pub total_deposit: f64,
    pub total_withdraw: f64,
    pub is_single_tx: bool,
    pub block: u64,
    pub tx_index: usize,
}

/// Evidence emitted when the ratio test fires for a user.
#[derive(Debug, Clone, Serialize)]
pub struct AttackInfo {
    pub block: u64,
    pub tx_index: usize,
    pub total_deposit: f64,
    pub total_withdraw: f64,
    pub rate: f64,
    pub token_flows: Vec<TokenFlow>,
    pub related_users: FxHashMap<Address, u64>,
    pub related_token_flows: FxHashMap<Address, Vec<TokenFlow>>,
}

/// user → token → time-ordered token movements.
pub type TokenTxLedger = FxHashMap<Address, FxHashMap<Address, Vec<TokenTx>>>;

/// user → related address → earliest block linking them.
pub type RelatedGraph = FxHashMap<Address, FxHashMap<Address, u64>>;

/// user → slot → time-ordered flow entries.
pub type UserFlowMap = FxHashMap<Address, FxHashMap<FlowSlot, Vec<TokenFlow>>>;

/// Lossy conversion of a raw token amount into the normalised domain.
///
/// Matches the precision the rest of the flow math runs at; only ordering and
/// zero-equality of the results are relied upon.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .0
        .iter()
        .enumerate()
        .fold(0.0, |acc, (i, limb)| {
            acc + (*limb as f64) * 2f64.powi(64 * i as i32)
        })
}
