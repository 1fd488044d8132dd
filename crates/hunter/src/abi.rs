//! Minimal contract-ABI support for the extractor.
//!
//! Only what the call-tree walk needs: matching a call's 4-byte selector
//! against a proxy's logic contracts, and mining address-typed arguments out
//! of the static head words of the call input. Dynamic arguments occupy an
//! offset word at their head position, so top-level address arguments are
//! always recoverable without a full dynamic decode.

use std::path::Path;

use ethereum_types::Address;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use sha3::{Digest, Keccak256};
use tracing::{debug, warn};

use crate::error::HunterError;
use crate::registry::{ApplicationInfo, parse_address};

/// Selector of ERC-20 `transfer(address,uint256)`.
pub const SEL_TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Selector of ERC-20 `transferFrom(address,address,uint256)`.
pub const SEL_TRANSFER_FROM: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];

#[derive(Debug, Clone, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    /// Whether this parameter has dynamic ABI encoding.
    fn is_dynamic(&self) -> bool {
        if self.kind == "bytes" || self.kind == "string" {
            return true;
        }
        if self.kind.ends_with("[]") {
            return true;
        }
        if let Some((inner, _len)) = split_fixed_array(&self.kind) {
            let element = AbiParam {
                name: String::new(),
                kind: inner.to_owned(),
                components: self.components.clone(),
            };
            return element.is_dynamic();
        }
        if self.kind.starts_with("tuple") {
            return self.components.iter().any(AbiParam::is_dynamic);
        }
        false
    }

    /// Number of 32-byte head words this parameter occupies.
    fn head_words(&self) -> usize {
        if self.is_dynamic() {
            return 1;
        }
        if let Some((inner, len)) = split_fixed_array(&self.kind) {
            let element = AbiParam {
                name: String::new(),
                kind: inner.to_owned(),
                components: self.components.clone(),
            };
            return len * element.head_words();
        }
        if self.kind.starts_with("tuple") {
            return self.components.iter().map(AbiParam::head_words).sum();
        }
        1
    }

    /// Canonical type string used in the function signature.
    fn canonical(&self) -> String {
        if let Some(rest) = self.kind.strip_prefix("tuple") {
            let inner: Vec<String> = self.components.iter().map(AbiParam::canonical).collect();
            format!("({}){rest}", inner.join(","))
        } else {
            self.kind.clone()
        }
    }
}

/// Split `uint256[3]`-style types into (element type, length).
fn split_fixed_array(kind: &str) -> Option<(&str, usize)> {
    let open = kind.rfind('[')?;
    let close = kind.rfind(']')?;
    if close != kind.len() - 1 || close <= open + 1 {
        return None;
    }
    let len = kind[open + 1..close].parse::<usize>().ok()?;
    Some((&kind[..open], len))
}

#[derive(Debug, Clone)]
pub struct AbiFunction {
    pub name: String,
    pub selector: [u8; 4],
    pub inputs: Vec<AbiParam>,
}

impl AbiFunction {
    /// Human-readable label, e.g. `transfer(0xa9059cbb)`.
    pub fn label(&self) -> String {
        format!("{}(0x{})", self.name, hex::encode(self.selector))
    }

    /// Address-typed top-level arguments read from the input's head words.
    ///
    /// Stops at the first argument whose head word is missing (truncated
    /// input): argument mining is skipped from that point, the caller keeps
    /// walking.
    pub fn address_args(&self, input: &[u8]) -> Vec<Address> {
        let Some(body) = input.get(4..) else {
            return Vec::new();
        };
        let mut args = Vec::new();
        let mut word = 0usize;
        for param in &self.inputs {
            if param.kind == "address" {
                let Some(slot) = body.get(word * 32..(word + 1) * 32) else {
                    break;
                };
                args.push(Address::from_slice(&slot[12..]));
            }
            word += param.head_words();
        }
        args
    }
}

#[derive(Debug, Deserialize)]
struct RawAbiEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiParam>,
}

/// The parsed ABI of one logic contract.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    functions: Vec<AbiFunction>,
}

impl ContractAbi {
    /// Parse a standard ABI JSON array (entries other than functions are
    /// ignored).
    pub fn from_json(raw: &str) -> Result<Self, HunterError> {
        let entries: Vec<RawAbiEntry> = serde_json::from_str(raw)?;
        let mut functions = Vec::new();
        for entry in entries {
            if entry.kind != "function" {
                continue;
            }
            let signature = format!(
                "{}({})",
                entry.name,
                entry
                    .inputs
                    .iter()
                    .map(AbiParam::canonical)
                    .collect::<Vec<_>>()
                    .join(",")
            );
            let digest = Keccak256::digest(signature.as_bytes());
            let mut selector = [0u8; 4];
            selector.copy_from_slice(&digest[..4]);
            functions.push(AbiFunction {
                name: entry.name,
                selector,
                inputs: entry.inputs,
            });
        }
        Ok(ContractAbi { functions })
    }

    pub fn method_by_id(&self, input: &[u8]) -> Option<&AbiFunction> {
        let selector = input.get(..4)?;
        self.functions.iter().find(|f| f.selector == selector)
    }
}

/// Per-proxy logic-contract ABIs.
///
/// Every proxy of the application has an entry even when no ABI files are
/// present, so proxy membership checks do not depend on the ABI source.
#[derive(Debug, Default)]
pub struct AbiStore {
    proxy_abis: FxHashMap<Address, Vec<ContractAbi>>,
}

impl AbiStore {
    /// Load ABIs from `<defi_dir>/<app>/abi/<proxy>/<logic>.json`.
    ///
    /// A missing directory or unreadable file only costs that proxy its
    /// argument mining; the walk itself still runs.
    pub fn load(defi_dir: &Path, app: &ApplicationInfo) -> Result<Self, HunterError> {
        let mut store = AbiStore::default();
        for proxy in &app.proxies {
            let abis = store.proxy_abis.entry(*proxy).or_default();
            let dir = defi_dir.join(&app.name).join("abi").join(format!("{proxy:#x}"));
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), "no ABI directory for proxy: {e}");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if parse_address(stem).is_err() {
                    continue;
                }
                match std::fs::read_to_string(&path).map_err(HunterError::from).and_then(|raw| ContractAbi::from_json(&raw)) {
                    Ok(abi) => abis.push(abi),
                    Err(e) => warn!(path = %path.display(), "skipping undecodable ABI: {e}"),
                }
            }
            debug!(proxy = %format!("{proxy:#x}"), logic_abis = abis.len(), "loaded proxy ABIs");
        }
        Ok(store)
    }

    /// Register proxies without any ABI (membership checks only).
    pub fn with_proxies(proxies: impl IntoIterator<Item = Address>) -> Self {
        let mut store = AbiStore::default();
        for proxy in proxies {
            store.proxy_abis.entry(proxy).or_default();
        }
        store
    }

    pub fn is_proxy(&self, address: Address) -> bool {
        self.proxy_abis.contains_key(&address)
    }

    /// First logic ABI of `proxy` that knows the input's selector.
    pub fn method_for(&self, proxy: Address, input: &[u8]) -> Option<&AbiFunction> {
        self.proxy_abis
            .get(&proxy)?
            .iter()
            .find_map(|abi| abi.method_by_id(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERC20_ABI: &str = r#"[
        {"type":"function","name":"transfer","inputs":[
            {"name":"to","type":"address"},{"name":"amount","type":"uint256"}]},
        {"type":"function","name":"transferFrom","inputs":[
            {"name":"from","type":"address"},{"name":"to","type":"address"},
            {"name":"amount","type":"uint256"}]},
        {"type":"event","name":"Transfer","inputs":[]}
    ]"#;

    #[test]
    fn selectors_match_known_erc20_ids() {
        let abi = ContractAbi::from_json(ERC20_ABI).unwrap();
        let transfer = abi.method_by_id(&SEL_TRANSFER).unwrap();
        assert_eq!(transfer.name, "transfer");
        let transfer_from = abi.method_by_id(&SEL_TRANSFER_FROM).unwrap();
        assert_eq!(transfer_from.name, "transferFrom");
        assert_eq!(transfer_from.label(), "transferFrom(0x23b872dd)");
    }

    #[test]
    fn address_args_read_head_words() {
        let abi = ContractAbi::from_json(ERC20_ABI).unwrap();
        let to = Address::from_low_u64_be(0xfeed);
        let mut input = SEL_TRANSFER.to_vec();
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(to.as_bytes());
        input.extend_from_slice(&word);
        input.extend_from_slice(&[0u8; 32]); // amount

        let method = abi.method_by_id(&input).unwrap();
        assert_eq!(method.address_args(&input), vec![to]);
    }

    #[test]
    fn truncated_input_stops_mining() {
        let abi = ContractAbi::from_json(ERC20_ABI).unwrap();
        let input = SEL_TRANSFER.to_vec(); // selector only, no words
        let method = abi.method_by_id(&input).unwrap();
        assert!(method.address_args(&input).is_empty());
    }

    #[test]
    fn dynamic_args_occupy_one_head_word() {
        let raw = r#"[{"type":"function","name":"route","inputs":[
            {"name":"path","type":"uint256[]"},
            {"name":"recipient","type":"address"}]}]"#;
        let abi = ContractAbi::from_json(raw).unwrap();

        let recipient = Address::from_low_u64_be(0xabc);
        let sig = Keccak256::digest(b"route(uint256[],address)");
        let mut input = sig[..4].to_vec();
        input.extend_from_slice(&[0u8; 32]); // offset word of `path`
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(recipient.as_bytes());
        input.extend_from_slice(&word);

        let method = abi.method_by_id(&input).unwrap();
        assert_eq!(method.address_args(&input), vec![recipient]);
    }

    #[test]
    fn static_tuple_shifts_following_args() {
        let raw = r#"[{"type":"function","name":"fill","inputs":[
            {"name":"order","type":"tuple","components":[
                {"name":"a","type":"uint256"},{"name":"b","type":"uint256"}]},
            {"name":"taker","type":"address"}]}]"#;
        let abi = ContractAbi::from_json(raw).unwrap();

        let taker = Address::from_low_u64_be(0xdef);
        let sig = Keccak256::digest(b"fill((uint256,uint256),address)");
        let mut input = sig[..4].to_vec();
        input.extend_from_slice(&[0u8; 64]); // two tuple words
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(taker.as_bytes());
        input.extend_from_slice(&word);

        let method = abi.method_by_id(&input).unwrap();
        assert_eq!(method.address_args(&input), vec![taker]);
    }
}
