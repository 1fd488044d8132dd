//! Shared builders for pipeline tests.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use rustc_hash::FxHashMap;

use crate::abi::AbiStore;
use crate::detector::{Detector, DetectorConfig};
use crate::extractor::Extractor;
use crate::flow::{FlowBuilder, FlowOutput};
use crate::price::{PriceOracle, StableToken};
use crate::registry::ApplicationInfo;
use crate::session::AnalysisSession;
use crate::types::{
    CallKind, Event, ExternalTx, FlowSlot, InternalCall, RateRecord, TRANSFER_TOPIC,
};

/// Standard proxy address.
pub const PROXY: u64 = 0x1000;

/// Standard LP-token address.
pub const LP_TOKEN: u64 = 0x2000;

/// Standard ERC-20 token address.
pub const TOKEN: u64 = 0x3000;

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn test_app() -> ApplicationInfo {
    ApplicationInfo {
        name: "testapp".into(),
        created_at: 1,
        deposit_sigs: Default::default(),
        withdraw_sigs: Default::default(),
        proxies: [addr(PROXY)].into_iter().collect(),
        lp_tokens: [addr(LP_TOKEN)].into_iter().collect(),
    }
}

pub fn call(from: Address, to: Address, kind: CallKind) -> InternalCall {
    InternalCall {
        from,
        to,
        kind,
        value: None,
        input: Bytes::new(),
        events: Vec::new(),
        calls: Vec::new(),
    }
}

pub fn transfer_event(token: Address, from: Address, to: Address, amount: u64) -> Event {
    Event {
        address: token,
        topics: vec![TRANSFER_TOPIC, H256::from(from), H256::from(to)],
        data: Bytes::copy_from_slice(&U256::from(amount).to_big_endian()),
        index: 0,
    }
}

pub fn external_tx(block: u64, tx_index: usize, root: InternalCall) -> ExternalTx {
    ExternalTx {
        block,
        timestamp: 1_600_000_000,
        tx_index,
        calls: vec![root],
    }
}

/// A user's proxy invocation that moves tokens via Transfer events.
pub fn proxy_action(
    user: Address,
    block: u64,
    tx_index: usize,
    events: Vec<Event>,
) -> ExternalTx {
    let mut root = call(user, addr(PROXY), CallKind::Call);
    root.events = events;
    external_tx(block, tx_index, root)
}

/// Deposit of `amount` of `token` from `user` into the proxy.
pub fn deposit_tx(user: Address, token: Address, block: u64, tx_index: usize, amount: u64) -> ExternalTx {
    proxy_action(
        user,
        block,
        tx_index,
        vec![transfer_event(token, user, addr(PROXY), amount)],
    )
}

/// Withdrawal of `amount` of `token` from the proxy to `user`.
pub fn withdraw_tx(user: Address, token: Address, block: u64, tx_index: usize, amount: u64) -> ExternalTx {
    proxy_action(
        user,
        block,
        tx_index,
        vec![transfer_event(token, addr(PROXY), user, amount)],
    )
}

/// Full pipeline fixture: extraction, classification, flows, detection.
pub struct Harness {
    pub app: ApplicationInfo,
    pub abis: AbiStore,
    pub session: AnalysisSession,
    pub oracle: PriceOracle,
    pub stable_tokens: FxHashMap<Address, StableToken>,
}

impl Harness {
    pub fn new() -> Self {
        let app = test_app();
        let abis = AbiStore::with_proxies(app.proxies.iter().copied());
        Harness {
            app,
            abis,
            session: AnalysisSession::new(),
            oracle: PriceOracle::new("/nonexistent-price-data"),
            stable_tokens: FxHashMap::default(),
        }
    }

    /// Register a flat rate for `token` across every bucket the tests use.
    pub fn with_rate(self, token: Address, rate: f64) -> Self {
        let table: FxHashMap<u64, f64> = (0..20).map(|i| (i * 500, rate)).collect();
        self.oracle.install(token, table);
        self
    }

    pub fn ingest(&mut self, txs: &[ExternalTx]) {
        let extractor = Extractor::new(&self.app, &self.abis);
        for tx in txs {
            extractor.extract_token_txs(tx, &mut self.session);
        }
    }

    /// Common-address filter + classification, freezing the ledger.
    pub fn finalize(&mut self) {
        self.session.update_common_addresses(&self.app.proxies);
        self.session.update_common_related_users();
        let extractor = Extractor::new(&self.app, &self.abis);
        extractor.classify_actions(&mut self.session);
    }

    pub fn flows(&self) -> FlowOutput {
        FlowBuilder::new(&self.session, &self.app, &self.stable_tokens, &self.oracle).build()
    }

    pub fn detector<'a>(&'a self, output: &'a FlowOutput) -> Detector<'a> {
        Detector::new(&output.flows, &self.session, DetectorConfig::default())
    }
}

/// Flatten a record map into (user, rate-record) rows for assertions.
pub fn all_records(records: &FxHashMap<FlowSlot, Vec<RateRecord>>) -> Vec<&RateRecord> {
    records.values().flatten().collect()
}
