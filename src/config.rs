//! Wallet construction options (spec §6 "Config options" table).

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::currency::Unit;
use crate::error::{Error, Result};

/// Default empty-address lookahead before a chain is considered exhausted.
pub const DEFAULT_GAP_LIMIT: u32 = 20;
/// Default depth at which a mined output is considered `confirmed`.
pub const DEFAULT_MIN_BLOCK_CONFIRM: u32 = 1;
/// Default size of the per-chain bounded script-hash watch ring.
pub const DEFAULT_MAX_SCRIPT_WATCH: usize = 10;
/// Dust threshold below which a change output is omitted (spec §4.4).
pub const DUST_SAT: u64 = 546;
/// Fallback sats/vbyte for `send` when neither the call nor `WalletConfig`
/// supplies one. Fee-rate estimation from the provider is out of scope
/// (spec §1); callers in production should always set one explicitly.
pub const DEFAULT_FEE_RATE: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub network: Network,
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
    #[serde(default = "default_min_block_confirm")]
    pub min_block_confirm: u32,
    #[serde(default = "default_max_script_watch")]
    pub max_script_watch: usize,
    /// Default sats/vbyte used by `send` when the caller doesn't override it.
    pub fee_rate: Option<f64>,
    pub unit: Unit,
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

fn default_min_block_confirm() -> u32 {
    DEFAULT_MIN_BLOCK_CONFIRM
}

fn default_max_script_watch() -> usize {
    DEFAULT_MAX_SCRIPT_WATCH
}

impl WalletConfig {
    pub fn new(network: Network, unit: Unit) -> Self {
        Self {
            network,
            gap_limit: DEFAULT_GAP_LIMIT,
            min_block_confirm: DEFAULT_MIN_BLOCK_CONFIRM,
            max_script_watch: DEFAULT_MAX_SCRIPT_WATCH,
            fee_rate: None,
            unit,
        }
    }

    /// Parses the `network` config key from one of the strings the spec's
    /// config table allows (`regtest|testnet|signet|mainnet|bitcoin`).
    pub fn parse_network(s: &str) -> Result<Network> {
        match s {
            "regtest" => Ok(Network::Regtest),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_network_aliases() {
        assert_eq!(WalletConfig::parse_network("bitcoin").unwrap(), Network::Bitcoin);
        assert_eq!(WalletConfig::parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(WalletConfig::parse_network("testnet").unwrap(), Network::Testnet);
        assert_eq!(WalletConfig::parse_network("signet").unwrap(), Network::Signet);
        assert_eq!(WalletConfig::parse_network("regtest").unwrap(), Network::Regtest);
        assert!(WalletConfig::parse_network("nonsense").is_err());
    }

    #[test]
    fn defaults_match_spec_table() {
        let cfg = WalletConfig::new(Network::Regtest, Unit::Base);
        assert_eq!(cfg.gap_limit, 20);
        assert_eq!(cfg.min_block_confirm, 1);
        assert_eq!(cfg.max_script_watch, 10);
    }
}
