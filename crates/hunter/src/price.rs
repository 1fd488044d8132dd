//! Token price tables and stablecoin anchors.
//!
//! Rates come pre-computed: one JSON file per token (filename = lowercase hex
//! address) mapping a bucketed block number to a float rate against the
//! common numéraire. Stablecoins carry a fixed rate to one of three anchor
//! classes (ETH, USD, BTC) plus their decimals.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use ethereum_types::{Address, H160};
use hex_literal::hex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::HunterError;
use crate::registry::parse_address;
use crate::types::Anchor;

/// Wrapped ether, treated as the native coin in the mixed flow.
pub const WETH: Address = H160(hex!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"));

/// USD-anchored stablecoins route through the DAI price table.
pub const DAI: Address = H160(hex!("6B175474E89094C44Da98b954EedeAC495271d0F"));

/// BTC-anchored stablecoins route through the WBTC price table.
pub const WBTC: Address = H160(hex!("2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599"));

/// Price-feed snapshots are keyed by 500-block buckets.
pub const RATE_BUCKET: u64 = 500;

/// Bucket a block number to the granularity of the price tables.
pub fn bucket_block(block: u64) -> u64 {
    (block / RATE_BUCKET) * RATE_BUCKET
}

/// A stablecoin's peg: which anchor it tracks and at what fixed rate.
#[derive(Debug, Clone)]
pub struct StableToken {
    pub symbol: String,
    pub decimals: u32,
    pub anchor: Anchor,
    pub rate_to_anchor: i64,
}

/// Load the per-anchor stablecoin tables from a directory.
///
/// Expected files: `stable_to_eth.csv`, `stable_to_usd.csv`,
/// `stable_to_btc.csv`, each with columns symbol, token-address,
/// rate-to-anchor, decimals. Missing files are skipped.
pub fn load_stable_tokens(dir: &Path) -> Result<FxHashMap<Address, StableToken>, HunterError> {
    let mut tokens = FxHashMap::default();
    for (file, anchor) in [
        ("stable_to_eth.csv", Anchor::Eth),
        ("stable_to_usd.csv", Anchor::Usd),
        ("stable_to_btc.csv", Anchor::Btc),
    ] {
        let path = dir.join(file);
        if !path.exists() {
            debug!(path = %path.display(), "no stablecoin table");
            continue;
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| HunterError::Storage {
                path: path.clone(),
                cause: e.to_string(),
            })?;
        for record in reader.records() {
            let record = record?;
            if record.len() < 4 {
                continue;
            }
            let symbol = record[0].trim().to_lowercase();
            let address = parse_address(&record[1])?;
            let rate_to_anchor = record[2].trim().parse::<i64>().map_err(|_| {
                HunterError::InvalidArgument(format!("bad rate for stablecoin {symbol}"))
            })?;
            let decimals = record[3].trim().parse::<u32>().map_err(|_| {
                HunterError::InvalidArgument(format!("bad decimals for stablecoin {symbol}"))
            })?;
            tokens.insert(
                address,
                StableToken {
                    symbol,
                    decimals,
                    anchor,
                    rate_to_anchor,
                },
            );
        }
    }
    Ok(tokens)
}

type RateTable = FxHashMap<u64, f64>;

/// Lazily-loaded per-token rate tables behind a read-write guard.
///
/// Reads dominate; a cache miss upgrades to the write guard, loads the
/// token's table from disk, and installs it (a missing or undecodable file
/// installs as permanently unsupported).
pub struct PriceOracle {
    dir: PathBuf,
    tables: RwLock<FxHashMap<Address, Option<RateTable>>>,
}

impl PriceOracle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        PriceOracle {
            dir: dir.into(),
            tables: RwLock::new(FxHashMap::default()),
        }
    }

    /// Rate for `token` at the bucket covering `block`, if the token has a
    /// usable price table.
    pub fn rate(&self, token: Address, block: u64) -> Option<f64> {
        let bucket = bucket_block(block);
        {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = tables.get(&token) {
                return entry.as_ref().and_then(|table| table.get(&bucket).copied());
            }
        }
        let loaded = self.load_table(token);
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let entry = tables.entry(token).or_insert(loaded);
        entry.as_ref().and_then(|table| table.get(&bucket).copied())
    }

    /// Whether any rate table exists for `token` (loading it on demand).
    pub fn has_rates(&self, token: Address) -> bool {
        {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = tables.get(&token) {
                return entry.is_some();
            }
        }
        let loaded = self.load_table(token);
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.entry(token).or_insert(loaded).is_some()
    }

    /// Pre-install a table, bypassing disk. Used by tests and by callers that
    /// already hold rates in memory.
    pub fn install(&self, token: Address, table: FxHashMap<u64, f64>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.insert(token, Some(table));
    }

    fn load_table(&self, token: Address) -> Option<RateTable> {
        let path = self.dir.join(format!("{token:#x}.json"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), "no rate table: {e}");
                return None;
            }
        };
        let parsed: FxHashMap<String, f64> = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %path.display(), "undecodable rate table: {e}");
                return None;
            }
        };
        let mut table = RateTable::default();
        for (block, rate) in parsed {
            match block.parse::<u64>() {
                Ok(block) => {
                    table.insert(block, rate);
                }
                Err(_) => {
                    warn!(path = %path.display(), key = %block, "non-numeric block key");
                }
            }
        }
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketing_floors_to_500() {
        assert_eq!(bucket_block(0), 0);
        assert_eq!(bucket_block(499), 0);
        assert_eq!(bucket_block(500), 500);
        assert_eq!(bucket_block(12_000_165), 12_000_000);
    }

    #[test]
    fn missing_table_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = PriceOracle::new(dir.path());
        let token = Address::from_low_u64_be(0xbeef);
        assert!(!oracle.has_rates(token));
        assert_eq!(oracle.rate(token, 1000), None);
    }

    #[test]
    fn table_loads_lazily_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let token = Address::from_low_u64_be(0xbeef);
        let path = dir.path().join(format!("{token:#x}.json"));
        std::fs::write(&path, r#"{"12000000": 0.5, "12000500": 0.75}"#).unwrap();

        let oracle = PriceOracle::new(dir.path());
        assert!(oracle.has_rates(token));
        assert_eq!(oracle.rate(token, 12_000_165), Some(0.5));
        assert_eq!(oracle.rate(token, 12_000_600), Some(0.75));
        // bucket with no snapshot
        assert_eq!(oracle.rate(token, 12_001_100), None);
    }

    #[test]
    fn stable_tables_load_per_anchor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stable_to_usd.csv"),
            "symbol,address,rate,decimals\nusdc,0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48,1,6\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("stable_to_btc.csv"),
            "symbol,address,rate,decimals\nrenbtc,0xEB4C2781e4ebA804CE9a9803C67d0893436bB27D,1,8\n",
        )
        .unwrap();

        let tokens = load_stable_tokens(dir.path()).unwrap();
        assert_eq!(tokens.len(), 2);
        let usdc = &tokens[&parse_address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap()];
        assert_eq!(usdc.anchor, Anchor::Usd);
        assert_eq!(usdc.decimals, 6);
        assert_eq!(usdc.rate_to_anchor, 1);
    }
}
