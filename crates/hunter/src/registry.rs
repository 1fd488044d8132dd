//! The DeFi-application registry.
//!
//! The registry CSV lists one application per row: name, creation block,
//! deposit/withdraw method signatures, the proxy-contract set, and the
//! LP-token set. Names are lower-cased; `all` is reserved to mean "analyse
//! every registered application in one pass".

use std::collections::BTreeMap;
use std::path::Path;

use ethereum_types::Address;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::HunterError;

/// Reserved application name meaning "every registered application".
pub const ALL_APPLICATIONS: &str = "all";

/// One registered DeFi application. Immutable during analysis.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub name: String,
    pub created_at: u64,
    pub deposit_sigs: FxHashSet<String>,
    pub withdraw_sigs: FxHashSet<String>,
    pub proxies: FxHashSet<Address>,
    pub lp_tokens: FxHashSet<Address>,
}

impl ApplicationInfo {
    pub fn is_proxy(&self, address: Address) -> bool {
        self.proxies.contains(&address)
    }

    pub fn is_lp_token(&self, address: Address) -> bool {
        self.lp_tokens.contains(&address)
    }
}

/// Parse a `0x`-prefixed (or bare) 20-byte hex address.
pub fn parse_address(raw: &str) -> Result<Address, HunterError> {
    let trimmed = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
    let bytes = hex::decode(trimmed)
        .map_err(|e| HunterError::InvalidArgument(format!("bad address {raw:?}: {e}")))?;
    if bytes.len() != 20 {
        return Err(HunterError::InvalidArgument(format!(
            "bad address {raw:?}: expected 20 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

fn parse_address_list(raw: &str) -> Result<FxHashSet<Address>, HunterError> {
    let mut set = FxHashSet::default();
    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        set.insert(parse_address(part)?);
    }
    Ok(set)
}

fn parse_sig_list(raw: &str) -> FxHashSet<String> {
    raw.split(';')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Load the application registry from CSV.
///
/// Columns: name, creation-block, deposit-sig list (`;`-delimited),
/// withdraw-sig list, proxy-address list, LP-token list. The header row is
/// skipped. A row with no usable LP column simply has an empty LP set.
pub fn load_registry(path: &Path) -> Result<BTreeMap<String, ApplicationInfo>, HunterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| HunterError::Storage {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

    let mut registry = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 5 {
            return Err(HunterError::InvalidArgument(format!(
                "registry row has {} columns, expected at least 5",
                record.len()
            )));
        }
        let name = record[0].trim().to_lowercase();
        if name == ALL_APPLICATIONS {
            return Err(HunterError::InvalidArgument(
                "application name `all` is reserved".to_owned(),
            ));
        }
        let created_at = record[1].trim().parse::<u64>().map_err(|_| {
            HunterError::InvalidArgument(format!(
                "creation block for {name} is not an integer: {:?}",
                &record[1]
            ))
        })?;
        let lp_tokens = match record.get(5) {
            // the original only accepts an LP column long enough to hold an address
            Some(raw) if raw.trim().len() >= 42 => parse_address_list(raw)?,
            _ => FxHashSet::default(),
        };
        let info = ApplicationInfo {
            name: name.clone(),
            created_at,
            deposit_sigs: parse_sig_list(&record[2]),
            withdraw_sigs: parse_sig_list(&record[3]),
            proxies: parse_address_list(&record[4])?,
            lp_tokens,
        };
        debug!(
            app = %info.name,
            proxies = info.proxies.len(),
            lp_tokens = info.lp_tokens.len(),
            "registered application"
        );
        registry.insert(name, info);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const REGISTRY_CSV: &str = "\
name,createAt,deposit,withdraw,proxy,lp
Opyn,9489407,addERC20Collateral(0x26782247);createERC20Option(0x5b7b18ff),exercise(0xeecf2f47),0x7054e08461e3eCb7718B63540adDB3c3A1746415,0x84427447dca0a3a21a58b1d9c2e1e5dd9e26b3d1
uniswap,10000835,mint(0x6a627842),burn(0x89afcb44),0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f;0xB4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc,
";

    fn write_registry() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY_CSV.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_applications_lowercased() {
        let file = write_registry();
        let registry = load_registry(file.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let opyn = &registry["opyn"];
        assert_eq!(opyn.created_at, 9489407);
        assert_eq!(opyn.proxies.len(), 1);
        assert_eq!(opyn.lp_tokens.len(), 1);
        assert!(opyn.deposit_sigs.contains("adderc20collateral(0x26782247)"));
        assert!(opyn.deposit_sigs.contains("createerc20option(0x5b7b18ff)"));
        assert!(opyn.withdraw_sigs.contains("exercise(0xeecf2f47)"));
    }

    #[test]
    fn short_lp_column_means_no_lp_tokens() {
        let file = write_registry();
        let registry = load_registry(file.path()).unwrap();
        assert!(registry["uniswap"].lp_tokens.is_empty());
        assert_eq!(registry["uniswap"].proxies.len(), 2);
    }

    #[test]
    fn parse_address_accepts_prefix_and_case() {
        let a = parse_address("0x7054e08461e3eCb7718B63540adDB3c3A1746415").unwrap();
        let b = parse_address("7054E08461E3ECB7718B63540ADDB3C3A1746415").unwrap();
        assert_eq!(a, b);
        assert!(parse_address("0x1234").is_err());
    }

    #[test]
    fn bad_creation_block_is_input_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"name,createAt,deposit,withdraw,proxy,lp\nx,notanumber,a,b,0x7054e08461e3eCb7718B63540adDB3c3A1746415,\n")
            .unwrap();
        let err = load_registry(file.path()).unwrap_err();
        assert!(matches!(err, HunterError::InvalidArgument(_)));
    }
}
