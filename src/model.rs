//! Shared data-model types from spec §3: lifecycle state, tx direction, and
//! the transaction log entry (`TxEntry`).

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::currency::Amount;

/// Wallet-internal lifecycle state of a ledger entry (spec GLOSSARY). The
/// derived `Ord` gives `Mempool < Pending < Confirmed`, so promotion checks
/// (spec §3 invariant 3, §8 property 6) are plain comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    Mempool,
    Pending,
    Confirmed,
}

impl State {
    pub const ALL: [State; 3] = [State::Mempool, State::Pending, State::Confirmed];

    /// `mempool ⇔ height==0`, `confirmed ⇔ (currentBlock − height) ≥
    /// min_block_confirm`, else `pending` (spec §4.2 step 1).
    pub fn from_height(height: i64, current_block: u32, min_block_confirm: u32) -> Self {
        if height <= 0 {
            return State::Mempool;
        }
        let depth = current_block as i64 - height;
        if depth >= min_block_confirm as i64 {
            State::Confirmed
        } else {
            State::Pending
        }
    }
}


/// Classification of a transaction relative to the wallet (spec §4.2 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
    Internal,
    Unknown,
}

/// Which side of a transaction an observed output/input sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// An output credited to (or possibly to) one of our addresses.
    Out,
    /// An input spending a previous output, possibly one of ours.
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToAddressMeta {
    pub amount: Amount,
    pub own_address: bool,
}

/// A wallet-observed transaction (spec §3 "Transaction entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxEntry {
    pub txid: Txid,
    pub from_addresses: Vec<String>,
    pub to_addresses: Vec<String>,
    pub to_address_meta: Vec<ToAddressMeta>,
    pub fee: Amount,
    pub amount: Amount,
    pub height: i64,
    pub direction: Direction,
}
