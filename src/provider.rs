//! The remote block/history provider contract (spec §6): an Electrum-style
//! JSON-RPC endpoint. Wire framing (line-delimited JSON-RPC 2.0 over TCP),
//! reconnection, and response caching are explicitly out of scope (spec §1)
//! -- this module defines only the interface `SyncManager`/`TxBuilder` code
//! against, plus an in-memory [`MockProvider`] test double used by the
//! scenario tests in spec §8.
//!
//! A real transport implementing this trait must honor the reconnection
//! policy of spec §5: up to 10 attempts with 2s linear backoff, and
//! `AddressWatch` must finish re-subscribing to every persisted script-hash
//! before `SyncManager` accepts new work after a reconnect.

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use tokio::sync::mpsc;

use crate::error::Result;

/// One entry of `blockchain.scripthash.get_history` / `get_mempool`.
/// `height == 0` means unconfirmed (mempool), matching spec §4.2's
/// `getTxState` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub height: i64,
}

/// One side of a verbose transaction as reported by the provider: the
/// counterparty address is supplied by the provider's index, per spec §4.2
/// ("each output and input carries the counterparty address as reported by
/// the provider").
#[derive(Debug, Clone)]
pub struct ProviderTxOutput {
    pub vout: u32,
    pub value: u64,
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderTxInput {
    pub prev_txid: Txid,
    pub prev_vout: u32,
    pub value: u64,
    pub address: Option<String>,
}

/// The verbose result of `blockchain.transaction.get`.
#[derive(Debug, Clone)]
pub struct ProviderTx {
    pub txid: Txid,
    pub height: i64,
    pub inputs: Vec<ProviderTxInput>,
    pub outputs: Vec<ProviderTxOutput>,
}

/// Pushed notifications: `.subscribe` method responses identified by
/// method-name rather than numeric id (spec §6).
#[derive(Debug, Clone)]
pub enum ProviderNotification {
    NewBlock { height: u32 },
    ScriptHashChanged { script_hash: String },
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// `blockchain.headers.subscribe`: returns the current chain tip height
    /// and begins delivering [`ProviderNotification::NewBlock`].
    async fn headers_subscribe(&self) -> Result<u32>;

    /// `blockchain.scripthash.subscribe`: returns the current status hash
    /// and begins delivering [`ProviderNotification::ScriptHashChanged`] for
    /// this script-hash.
    async fn scripthash_subscribe(&self, script_hash: &str) -> Result<String>;

    /// `blockchain.scripthash.get_history`. `cache` permits a cached
    /// response; callers that need a fresh read (e.g. the new-block handler)
    /// pass `false`.
    async fn get_history(&self, script_hash: &str, cache: bool) -> Result<Vec<HistoryEntry>>;

    /// `blockchain.scripthash.get_mempool`.
    async fn get_mempool(&self, script_hash: &str) -> Result<Vec<HistoryEntry>>;

    /// `blockchain.scripthash.get_balance`.
    async fn get_balance(&self, script_hash: &str) -> Result<(u64, u64)>;

    /// `blockchain.transaction.get` (verbose).
    async fn transaction_get(&self, txid: Txid, cache: bool) -> Result<ProviderTx>;

    /// `blockchain.transaction.broadcast`.
    async fn transaction_broadcast(&self, tx: &Transaction) -> Result<Txid>;

    /// `server.ping`.
    async fn ping(&self) -> Result<()>;

    /// Hands back the receiving half of this client's notification channel.
    /// Must be called at most once; `AddressWatch` owns the receiver for the
    /// lifetime of the wallet.
    fn take_notifications(&self) -> mpsc::UnboundedReceiver<ProviderNotification>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! An in-memory [`ProviderClient`] double: a script for the scenario
    //! tests to push transactions, blocks, and mempool events against,
    //! mirroring how the teacher's `tests/integration_test.rs` drives a
    //! controllable chain source (there `bitcoincore-rpc` on regtest).

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct State {
        height: u32,
        /// script_hash -> all known history entries (mempool and mined).
        history: HashMap<String, Vec<HistoryEntry>>,
        txs: HashMap<Txid, ProviderTx>,
        broadcast: Vec<Transaction>,
        status_hashes: HashMap<String, String>,
    }

    pub struct MockProvider {
        state: Mutex<State>,
        notify_tx: mpsc::UnboundedSender<ProviderNotification>,
        notify_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderNotification>>>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            let (notify_tx, notify_rx) = mpsc::unbounded_channel();
            Self {
                state: Mutex::new(State::default()),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
            }
        }

        pub fn add_tx(&self, script_hash: &str, tx: ProviderTx) {
            let mut state = self.state.lock().unwrap();
            state.history.entry(script_hash.to_string()).or_default().push(HistoryEntry {
                txid: tx.txid,
                height: tx.height,
            });
            state.txs.insert(tx.txid, tx);
        }

        /// Mines a block, updating `height` on every known tx still at
        /// height 0... in practice tests call `set_tx_height` explicitly
        /// then `mine` to bump the tip and emit the notification.
        pub fn mine(&self) -> u32 {
            let mut state = self.state.lock().unwrap();
            state.height += 1;
            let height = state.height;
            drop(state);
            let _ = self.notify_tx.send(ProviderNotification::NewBlock { height });
            height
        }

        pub fn set_tx_height(&self, script_hash: &str, txid: Txid, height: i64) {
            let mut state = self.state.lock().unwrap();
            if let Some(tx) = state.txs.get_mut(&txid) {
                tx.height = height;
            }
            if let Some(entries) = state.history.get_mut(script_hash) {
                for entry in entries.iter_mut() {
                    if entry.txid == txid {
                        entry.height = height;
                    }
                }
            }
        }

        pub fn push_script_hash_changed(&self, script_hash: &str) {
            let _ = self.notify_tx.send(ProviderNotification::ScriptHashChanged {
                script_hash: script_hash.to_string(),
            });
        }

        pub fn height(&self) -> u32 {
            self.state.lock().unwrap().height
        }

        pub fn broadcasted(&self) -> Vec<Transaction> {
            self.state.lock().unwrap().broadcast.clone()
        }
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        async fn headers_subscribe(&self) -> Result<u32> {
            Ok(self.state.lock().unwrap().height)
        }

        async fn scripthash_subscribe(&self, script_hash: &str) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            let count = state.history.get(script_hash).map(|h| h.len()).unwrap_or(0);
            let status = format!("status:{count}");
            state.status_hashes.insert(script_hash.to_string(), status.clone());
            Ok(status)
        }

        async fn get_history(&self, script_hash: &str, _cache: bool) -> Result<Vec<HistoryEntry>> {
            Ok(self.state.lock().unwrap().history.get(script_hash).cloned().unwrap_or_default())
        }

        async fn get_mempool(&self, script_hash: &str) -> Result<Vec<HistoryEntry>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .history
                .get(script_hash)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|e| e.height == 0)
                .collect())
        }

        async fn get_balance(&self, _script_hash: &str) -> Result<(u64, u64)> {
            Ok((0, 0))
        }

        async fn transaction_get(&self, txid: Txid, _cache: bool) -> Result<ProviderTx> {
            self.state
                .lock()
                .unwrap()
                .txs
                .get(&txid)
                .cloned()
                .ok_or_else(|| Error::ProviderRpcError(format!("unknown txid {txid}")))
        }

        async fn transaction_broadcast(&self, tx: &Transaction) -> Result<Txid> {
            let mut state = self.state.lock().unwrap();
            state.broadcast.push(tx.clone());
            Ok(tx.compute_txid())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        fn take_notifications(&self) -> mpsc::UnboundedReceiver<ProviderNotification> {
            self.notify_rx.lock().unwrap().take().expect("notifications taken twice")
        }
    }
}
