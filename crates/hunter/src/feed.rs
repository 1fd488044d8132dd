//! Recorded-transaction feed.
//!
//! Each unit of the feed is one [`ExternalTx`] persisted as JSON under a
//! per-contract directory, filename `<block>_<txIndex>.json`. The feed
//! walks those directories, filters by block range, and de-duplicates
//! identical filenames across the proxy set.

use std::path::{Path, PathBuf};

use ethereum_types::Address;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::error::HunterError;
use crate::registry::ApplicationInfo;
use crate::types::{CallKind, ExternalTx, InternalCall};

/// Canonical file name of a persisted transaction.
pub fn tx_file_name(block: u64, tx_index: usize) -> String {
    format!("{block}_{tx_index}.json")
}

/// Parse `<block>_<txIndex>` out of a file stem.
pub fn parse_block_tx(stem: &str) -> Option<(u64, usize)> {
    let (block, tx_index) = stem.split_once('_')?;
    Some((block.parse().ok()?, tx_index.parse().ok()?))
}

/// Load one persisted transaction. Failures are storage-class (the unit is
/// skipped, the run continues).
pub fn load_tx(path: &Path) -> Result<ExternalTx, HunterError> {
    let raw = std::fs::read_to_string(path).map_err(|e| HunterError::Storage {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| HunterError::Storage {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })
}

/// Persist one transaction under `dir`, creating it as needed.
pub fn dump_tx(tx: &ExternalTx, dir: &Path) -> Result<PathBuf, HunterError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(tx_file_name(tx.block, tx.tx_index));
    std::fs::write(&path, serde_json::to_vec(tx)?)?;
    Ok(path)
}

/// A located feed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLocation {
    pub block: u64,
    pub tx_index: usize,
    pub path: PathBuf,
}

/// A set of per-contract transaction directories.
pub struct TxFeed {
    dirs: Vec<PathBuf>,
}

impl TxFeed {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        TxFeed { dirs }
    }

    /// Feed over the application's proxy directories:
    /// `<apps_dir>/<app>/historyTx/<proxy>`.
    pub fn for_app(apps_dir: &Path, app: &ApplicationInfo) -> Self {
        TxFeed::new(contract_dirs(apps_dir, app, app.proxies.iter()))
    }

    /// Feed over the application's LP-token directories.
    pub fn for_lp_tokens(apps_dir: &Path, app: &ApplicationInfo) -> Self {
        TxFeed::new(contract_dirs(apps_dir, app, app.lp_tokens.iter()))
    }

    /// Every persisted transaction in `[first, last]`, de-duplicated by file
    /// name and sorted by (block, tx-index). Missing directories are
    /// skipped.
    pub fn collect_range(&self, first: u64, last: u64) -> Vec<TxLocation> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut located = Vec::new();
        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), "cannot read feed directory: {e}");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.ends_with(".json") || !seen.insert(name.to_owned()) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let Some((block, tx_index)) = parse_block_tx(stem) else {
                    debug!(%name, "ignoring non-transaction file");
                    continue;
                };
                if block >= first && block <= last {
                    located.push(TxLocation {
                        block,
                        tx_index,
                        path,
                    });
                }
            }
        }
        located.sort_by_key(|loc| (loc.block, loc.tx_index));
        located
    }
}

fn contract_dirs<'a>(
    apps_dir: &Path,
    app: &ApplicationInfo,
    contracts: impl Iterator<Item = &'a Address>,
) -> Vec<PathBuf> {
    contracts
        .map(|address| {
            apps_dir
                .join(&app.name)
                .join("historyTx")
                .join(format!("{address:#x}"))
        })
        .collect()
}

/// Sorts recorded transactions into per-application datasets.
///
/// Watches the proxies and LP tokens of the registered applications; a
/// transaction that calls a watched contract (other than via StaticCall) or
/// moves a watched token is dumped under every matching contract directory.
pub struct TxDumpCollector {
    apps_dir: PathBuf,
    address_map: FxHashMap<Address, String>,
}

impl TxDumpCollector {
    pub fn new(apps_dir: impl Into<PathBuf>) -> Self {
        TxDumpCollector {
            apps_dir: apps_dir.into(),
            address_map: FxHashMap::default(),
        }
    }

    pub fn watch_app(&mut self, app: &ApplicationInfo) {
        for address in app.proxies.iter().chain(app.lp_tokens.iter()) {
            self.address_map.insert(*address, app.name.clone());
        }
    }

    /// Dump `tx` under every watched contract it touches; returns how many
    /// datasets received it.
    pub fn parse_and_dump(&self, tx: &ExternalTx) -> Result<usize, HunterError> {
        let [root] = tx.calls.as_slice() else {
            return Ok(0);
        };
        let mut hits: FxHashMap<Address, &str> = FxHashMap::default();
        self.visit(root, &mut hits);
        for (address, app) in &hits {
            let dir = self
                .apps_dir
                .join(*app)
                .join("historyTx")
                .join(format!("{address:#x}"));
            dump_tx(tx, &dir)?;
        }
        Ok(hits.len())
    }

    fn visit<'a>(&'a self, call: &InternalCall, hits: &mut FxHashMap<Address, &'a str>) {
        if call.kind != CallKind::StaticCall
            && let Some(app) = self.address_map.get(&call.to)
        {
            hits.insert(call.to, app.as_str());
        }
        for child in &call.calls {
            self.visit(child, hits);
        }
        for event in &call.events {
            let Some(transfer) = crate::extractor::decode_transfer(event) else {
                continue;
            };
            if let Some(app) = self.address_map.get(&transfer.sender) {
                hits.insert(transfer.sender, app.as_str());
            } else if let Some(app) = self.address_map.get(&transfer.recipient) {
                hits.insert(transfer.recipient, app.as_str());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn simple_tx(block: u64, tx_index: usize) -> ExternalTx {
        ExternalTx {
            block,
            timestamp: 1_600_000_000,
            tx_index,
            calls: vec![InternalCall {
                from: Address::from_low_u64_be(1),
                to: Address::from_low_u64_be(2),
                kind: CallKind::Call,
                value: None,
                input: Bytes::new(),
                events: Vec::new(),
                calls: Vec::new(),
            }],
        }
    }

    #[test]
    fn dump_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tx = simple_tx(12_345, 7);
        let path = dump_tx(&tx, dir.path()).unwrap();
        assert!(path.ends_with("12345_7.json"));

        let loaded = load_tx(&path).unwrap();
        assert_eq!(loaded.block, 12_345);
        assert_eq!(loaded.tx_index, 7);
        assert_eq!(loaded.calls.len(), 1);
    }

    #[test]
    fn collect_range_filters_sorts_and_dedupes() {
        let root = tempfile::tempdir().unwrap();
        let dir_a = root.path().join("a");
        let dir_b = root.path().join("b");
        for (dir, blocks) in [(&dir_a, [100u64, 300]), (&dir_b, [100, 200])] {
            std::fs::create_dir_all(dir).unwrap();
            for block in blocks {
                dump_tx(&simple_tx(block, 0), dir).unwrap();
            }
        }
        std::fs::write(dir_a.join("notes.txt"), "x").unwrap();

        let feed = TxFeed::new(vec![dir_a, dir_b, root.path().join("missing")]);
        let located = feed.collect_range(100, 250);
        let blocks: Vec<u64> = located.iter().map(|l| l.block).collect();
        // 100 appears in both dirs but is de-duplicated; 300 is out of range
        assert_eq!(blocks, vec![100, 200]);
    }

    #[test]
    fn load_error_is_recoverable_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_0.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_tx(&path).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn parse_block_tx_stems() {
        assert_eq!(parse_block_tx("12345_7"), Some((12345, 7)));
        assert_eq!(parse_block_tx("garbage"), None);
        assert_eq!(parse_block_tx("12_x"), None);
    }
}
