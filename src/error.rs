//! The error kinds the wallet core surfaces to its callers.
//!
//! Propagation policy (see spec §7): provider transport errors encountered
//! during `syncAccount` are logged and treated as `noTx` for the affected
//! path rather than returned here; this enum is for errors that must reach
//! the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("provider unavailable")]
    ProviderUnavailable,

    #[error("provider RPC error: {0}")]
    ProviderRpcError(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("output value {value} is below the dust threshold {dust}")]
    DustOutput { value: u64, dust: u64 },

    #[error("a sync is already in progress")]
    SyncInProgress,

    #[error("wallet is not ready yet")]
    NotReady,

    #[error("address is not tracked by this wallet: {0}")]
    AddressUnknown(String),

    #[error("BIP32 derivation error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),

    #[error("sighash error: {0}")]
    Sighash(String),

    #[error("address parse error: {0}")]
    AddressParse(#[from] bitcoin::address::ParseError),

    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] bitcoin::amount::ParseAmountError),
}

pub type Result<T> = std::result::Result<T, Error>;
