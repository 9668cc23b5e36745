//! BIP32 derivation for BIP84 (P2WPKH) paths: `m/84'/coin_type'/0'/change/index`.
//!
//! Only account `0` is supported (spec Non-goals: no multi-account wallets).
//! Seed generation (BIP32/BIP39) and low-level elliptic-curve cryptography
//! are out of scope per spec §1; [`KeyDeriver`] is constructed from an
//! already-derived master extended private key.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::key::{CompressedPublicKey, PrivateKey};
use bitcoin::{Address, Network, ScriptBuf};
use secp256k1::{Secp256k1, SecretKey, SignOnly};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const PURPOSE: u32 = 84;

/// The two keychains a BIP84 account derives: external (receive) addresses
/// handed out to counterparties, and internal (change) addresses the wallet
/// sends its own change to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub fn change_value(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }
}

/// A fully-qualified BIP84 HD path, account fixed at `0'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HdPath {
    pub coin_type: u32,
    pub chain: Chain,
    pub index: u32,
}

impl HdPath {
    pub fn new(coin_type: u32, chain: Chain, index: u32) -> Self {
        Self { coin_type, chain, index }
    }

    /// Coin type used in BIP44/84 paths: `0'` for mainnet, `1'` for every
    /// test network, matching the pattern `HdWallet` generalizes from the
    /// single hardcoded `coin_type` the teacher used.
    pub fn coin_type_for_network(network: Network) -> u32 {
        match network {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    pub fn derivation_path(self) -> DerivationPath {
        let nums = [
            ChildNumber::from_hardened_idx(PURPOSE).expect("84 fits"),
            ChildNumber::from_hardened_idx(self.coin_type).expect("coin_type fits"),
            ChildNumber::from_hardened_idx(0).expect("account 0 fits"),
            ChildNumber::from_normal_idx(self.chain.change_value()).expect("0/1 fits"),
            ChildNumber::from_normal_idx(self.index).expect("index fits"),
        ];
        DerivationPath::from(nums.to_vec())
    }
}

impl std::fmt::Display for HdPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "m/{PURPOSE}'/{}'/0'/{}/{}",
            self.coin_type,
            self.chain.change_value(),
            self.index
        )
    }
}

/// Everything `HdWallet` and `TxBuilder` need to know about a derived address.
#[derive(Debug, Clone)]
pub struct DerivedAddress {
    pub path: HdPath,
    pub address: Address,
    pub script_pubkey: ScriptBuf,
    /// sha256 of `script_pubkey`, byte-reversed hex: the provider's index key.
    pub script_hash: String,
    pub public_key: CompressedPublicKey,
}

/// Derives addresses, script-hashes, and private keys along BIP84 paths from
/// a single master extended private key. Cheap to clone: `Secp256k1<SignOnly>`
/// holds no per-instance state worth sharing, and `Xpriv` is `Copy`.
#[derive(Clone)]
pub struct KeyDeriver {
    secp: Secp256k1<SignOnly>,
    master: Xpriv,
    network: Network,
}

impl KeyDeriver {
    pub fn new(master: Xpriv, network: Network) -> Self {
        Self { secp: Secp256k1::signing_only(), master, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn derive_xpriv(&self, path: HdPath) -> Result<Xpriv> {
        Ok(self.master.derive_priv(&self.secp, &path.derivation_path())?)
    }

    /// Derives `(address, script-hash, pubkey)` for `path`.
    pub fn derive_address(&self, path: HdPath) -> Result<DerivedAddress> {
        let xpriv = self.derive_xpriv(path)?;
        let xpub = Xpub::from_priv(&self.secp, &xpriv);
        let public_key = CompressedPublicKey(xpub.public_key);
        let address = Address::p2wpkh(&public_key, self.network);
        let script_pubkey = address.script_pubkey();
        let script_hash = script_hash_hex(&script_pubkey);
        Ok(DerivedAddress { path, address, script_pubkey, script_hash, public_key })
    }

    /// The script-hash alone, for the common case where the caller only
    /// needs the provider subscription key (spec §4.2 step 1 of each visit).
    pub fn path_to_script_hash(&self, path: HdPath) -> Result<String> {
        Ok(self.derive_address(path)?.script_hash)
    }

    /// The private key used to sign inputs spending an output at `path`.
    pub fn derive_private_key(&self, path: HdPath) -> Result<PrivateKey> {
        let xpriv = self.derive_xpriv(path)?;
        let secret: SecretKey = xpriv.private_key;
        Ok(PrivateKey::new(secret, self.network))
    }
}

/// sha256 of an output script, byte-reversed and hex-encoded: the Electrum
/// script-hash index key (spec GLOSSARY).
pub fn script_hash_hex(script_pubkey: &ScriptBuf) -> String {
    use bitcoin::hashes::{sha256, Hash};
    let digest = sha256::Hash::hash(script_pubkey.as_bytes());
    let mut bytes = digest.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}
