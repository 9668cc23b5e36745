//! Orchestrates the gap-limit scan, history ingest, classification, UTXO
//! updates, and the block/script-hash notification handlers (spec §4.2).
//! This is the owning coordinator design note 9 asks for: it holds
//! `HdWallet`, `AddressStore`, `UnspentStore`, `TotalBalance`, and
//! `AddressWatch` by unique ownership; none of them hold a back-reference
//! to this type or to each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::{OutPoint, Txid};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::address_store::{AddressStore, LedgerKind};
use crate::balance::TotalBalance;
use crate::config::WalletConfig;
use crate::error::{Error, Result};
use crate::hdwallet::{ChainSyncState, HdWallet, ScanSignal};
use crate::keys::{Chain, HdPath, KeyDeriver};
use crate::model::{Direction, Side, State, ToAddressMeta, TxEntry};
use crate::provider::{HistoryEntry, ProviderClient};
use crate::storage::KvStore;
use crate::unspent_store::{Reservation, Utxo, UnspentStore};
use crate::watch::AddressWatch;
use crate::currency::Amount;

/// Named callbacks replacing the source's string-keyed event bus (spec §9
/// "Dynamic event emission"). Default no-op bodies let callers implement
/// only what they need.
pub trait SyncEvents: Send + Sync {
    fn on_synced_path(&self, _chain: Chain, _path: HdPath, _has_tx: bool, _state: ChainSyncState) {}
    fn on_new_tx(&self, _entry: &TxEntry) {}
    fn on_sync_end(&self) {}
}

/// A [`SyncEvents`] that observes nothing, for callers that only want to
/// poll `getBalance`/`getTransactions`.
pub struct NoopEvents;
impl SyncEvents for NoopEvents {}

#[derive(Default)]
struct SyncControl {
    halt: AtomicBool,
    in_progress: AtomicBool,
    sync_end: Notify,
}

pub struct SyncManager {
    config: WalletConfig,
    deriver: KeyDeriver,
    hd_wallet: Option<HdWallet>,
    address_store: AddressStore,
    unspent_store: UnspentStore,
    balance: TotalBalance,
    watch: AddressWatch,
    provider: Arc<dyn ProviderClient>,
    events: Arc<dyn SyncEvents>,
    current_block: u32,
    /// `script_hash -> (address, path)`, populated as addresses are derived
    /// or persisted records are loaded on startup.
    address_index: HashMap<String, (String, Option<HdPath>)>,
    /// `txid -> [(address, path)]` of every address whose history produced
    /// it, so the new-block rescan can refetch each one without guessing. A
    /// send that spends an external UTXO and creates internal change touches
    /// both chains for the same txid, so this must not collapse to a single
    /// owner or the non-last address's ledger entry never gets promoted.
    tx_owner: HashMap<Txid, Vec<(String, Option<HdPath>)>>,
    mempool_waiters: HashMap<Txid, oneshot::Sender<()>>,
    control: Arc<SyncControl>,
}

impl SyncManager {
    pub async fn open(
        config: WalletConfig,
        deriver: KeyDeriver,
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn KvStore>,
        events: Arc<dyn SyncEvents>,
    ) -> Result<Self> {
        let hd_wallet = HdWallet::new(deriver.clone(), config.gap_limit);
        let address_store = AddressStore::open(store.scope("address")).await;
        let unspent_store = UnspentStore::open(store.scope("unspent")).await;
        let mut manager = Self {
            watch: AddressWatch::new(config.max_script_watch),
            config,
            deriver,
            hd_wallet: Some(hd_wallet),
            address_store,
            unspent_store,
            balance: TotalBalance::ZERO,
            provider,
            events,
            current_block: 0,
            address_index: HashMap::new(),
            tx_owner: HashMap::new(),
            mempool_waiters: HashMap::new(),
            control: Arc::new(SyncControl::default()),
        };
        manager.start().await?;
        Ok(manager)
    }

    /// Re-subscribes to every persisted script-hash and learns the current
    /// chain tip (spec §4.2 init: "starts AddressWatch which re-subscribes
    /// to every persisted script-hash").
    async fn start(&mut self) -> Result<()> {
        self.current_block = self.provider.headers_subscribe().await?;
        for record in self.address_store.all_addresses().await {
            self.address_index.insert(record.script_hash.clone(), (record.address.clone(), Some(record.path)));
            self.watch.watch(record.path.chain, &record.script_hash);
        }
        self.watch.subscribe_all(self.provider.as_ref()).await
    }

    fn hd_wallet_mut(&mut self) -> &mut HdWallet {
        self.hd_wallet.as_mut().expect("hd_wallet is only absent transiently inside run_scan")
    }

    pub fn hd_wallet(&self) -> &HdWallet {
        self.hd_wallet.as_ref().expect("hd_wallet is only absent transiently inside run_scan")
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Drives the gap-limit scan (spec §4.2 `syncAccount`). Rejects
    /// concurrent scans with [`Error::SyncInProgress`] and a halted wallet
    /// with [`Error::NotReady`].
    pub async fn sync_account(&mut self, reset: bool, restart: bool) -> Result<()> {
        if self.control.in_progress.swap(true, Ordering::SeqCst) {
            return Err(Error::SyncInProgress);
        }
        if self.control.halt.load(Ordering::SeqCst) {
            self.control.in_progress.store(false, Ordering::SeqCst);
            return Err(Error::NotReady);
        }

        if restart {
            self.hard_reset().await;
        } else if reset {
            self.hd_wallet_mut().reset_sync_state();
        }

        let result = self.run_scan().await;
        if result.is_ok() {
            self.unspent_store.process().await;
        }

        self.control.in_progress.store(false, Ordering::SeqCst);
        self.control.halt.store(false, Ordering::SeqCst);
        self.events.on_sync_end();
        self.control.sync_end.notify_waiters();
        result
    }

    async fn hard_reset(&mut self) {
        self.hd_wallet_mut().hard_reset();
        self.address_store.clear_all().await;
        self.unspent_store.clear_all().await;
        self.address_index.clear();
        self.tx_owner.clear();
        self.balance = TotalBalance::ZERO;
    }

    async fn run_scan(&mut self) -> Result<()> {
        // Taken out of `self` for the scan's duration so the visitor closure
        // below can borrow the rest of `self` freely (spec §9: HdWallet does
        // not hold a back-reference to the coordinator, so neither direction
        // needs to alias).
        let mut hd_wallet = self.hd_wallet.take().expect("hd_wallet present between syncAccount calls");
        let result = hd_wallet.for_each_account(|chain, path, pre_state| self.visit_path(chain, path, pre_state)).await;
        self.hd_wallet = Some(hd_wallet);
        result
    }

    async fn visit_path(&mut self, chain: Chain, path: HdPath, pre_state: ChainSyncState) -> Result<ScanSignal> {
        if self.control.halt.load(Ordering::SeqCst) {
            return Ok(ScanSignal::Stop);
        }
        let derived = self.deriver.derive_address(path)?;
        let history = match self.provider.get_history(&derived.script_hash, true).await {
            Ok(history) => history,
            Err(err) => {
                warn!(%path, error = %err, "provider error scanning path, treating as no tx");
                self.events.on_synced_path(chain, path, false, pre_state);
                return Ok(ScanSignal::NoTx);
            }
        };
        if history.is_empty() {
            self.events.on_synced_path(chain, path, false, pre_state);
            return Ok(ScanSignal::NoTx);
        }

        let address = derived.address.to_string();
        self.address_store.get_or_create(&address, path, derived.public_key, &derived.script_hash).await;
        self.address_index.insert(derived.script_hash.clone(), (address.clone(), Some(path)));
        self.process_history(&address, Some(path), history).await?;
        self.events.on_synced_path(chain, path, true, pre_state);
        Ok(ScanSignal::HasTx)
    }

    /// Feeds `entries` (ordered ascending by height, mempool last) through
    /// classification and ledger mutation for the address whose history
    /// this is (spec §4.2 `processHistory`). Returns whether any entry was
    /// processed (the `hasTx` signal for the scan).
    async fn process_history(
        &mut self,
        address: &str,
        path: Option<HdPath>,
        entries: Vec<HistoryEntry>,
    ) -> Result<bool> {
        let mut sorted = entries;
        sorted.sort_by_key(|e| if e.height <= 0 { i64::MAX } else { e.height });
        let mut had_any = false;
        for entry in sorted {
            had_any = true;
            if let Err(err) = self.process_tx(address, path, entry.txid, entry.height).await {
                warn!(txid = %entry.txid, error = %err, "failed to process transaction, skipping");
            }
        }
        Ok(had_any)
    }

    async fn process_tx(&mut self, address: &str, path: Option<HdPath>, txid: Txid, height: i64) -> Result<()> {
        let tx = self.provider.transaction_get(txid, true).await?;
        let state = State::from_height(height, self.current_block, self.config.min_block_confirm);

        if self.address_store.get(address).await.is_none() {
            if let Some(path) = path {
                let derived = self.deriver.derive_address(path)?;
                self.address_store.get_or_create(address, path, derived.public_key, &derived.script_hash).await;
            }
        }

        let total_in: u64 = tx.inputs.iter().map(|i| i.value).sum();
        let total_out: u64 = tx.outputs.iter().map(|o| o.value).sum();
        let fee = Amount::from_sat(total_in.saturating_sub(total_out));

        let mut from_addresses = Vec::new();
        let mut any_input_ours = false;
        let mut all_inputs_ours = !tx.inputs.is_empty();
        for input in &tx.inputs {
            match &input.address {
                Some(addr) => {
                    from_addresses.push(addr.clone());
                    if self.address_store.is_ours(addr).await {
                        any_input_ours = true;
                    } else {
                        all_inputs_ours = false;
                    }
                }
                None => all_inputs_ours = false,
            }
            if input.address.as_deref() == Some(address) {
                let outpoint = OutPoint { txid: input.prev_txid, vout: input.prev_vout };
                self.process_utxo(address, Side::In, state, outpoint, Amount::from_sat(input.value), fee).await?;
            }
        }

        let mut to_addresses = Vec::new();
        let mut to_address_meta = Vec::new();
        let mut all_outputs_ours = !tx.outputs.is_empty();
        for output in &tx.outputs {
            let own = match &output.address {
                Some(addr) => self.address_store.is_ours(addr).await,
                None => false,
            };
            if !own {
                all_outputs_ours = false;
            }
            if let Some(addr) = &output.address {
                to_addresses.push(addr.clone());
                to_address_meta.push(ToAddressMeta { amount: Amount::from_sat(output.value), own_address: own });
            }
            if output.address.as_deref() == Some(address) {
                let outpoint = OutPoint { txid, vout: output.vout };
                self.process_utxo(address, Side::Out, state, outpoint, Amount::from_sat(output.value), Amount::ZERO)
                    .await?;
            }
        }

        let direction = if all_inputs_ours && all_outputs_ours {
            Direction::Internal
        } else if !any_input_ours {
            Direction::Incoming
        } else if any_input_ours && !tx.outputs.is_empty() {
            Direction::Outgoing
        } else {
            Direction::Unknown
        };

        let amount = to_address_meta
            .iter()
            .filter(|meta| match direction {
                Direction::Incoming | Direction::Internal => meta.own_address,
                Direction::Outgoing => !meta.own_address,
                Direction::Unknown => false,
            })
            .fold(Amount::ZERO, |acc, meta| acc + meta.amount);

        let entry = TxEntry { txid, from_addresses, to_addresses, to_address_meta, fee, amount, height, direction };

        let owners = self.tx_owner.entry(txid).or_default();
        if !owners.iter().any(|(owner, _)| owner == address) {
            owners.push((address.to_string(), path));
        }
        if height == 0 {
            self.events.on_new_tx(&entry);
            if let Some(waiter) = self.mempool_waiters.remove(&txid) {
                let _ = waiter.send(());
            }
        }
        self.address_store.put_tx(entry).await;
        Ok(())
    }

    /// The sole mutator of monetary state (spec §4.2 `processUtxo`):
    /// idempotent per `(address, kind, state, outpoint)`.
    async fn process_utxo(
        &mut self,
        address: &str,
        side: Side,
        state: State,
        outpoint: OutPoint,
        value: Amount,
        tx_fee: Amount,
    ) -> Result<()> {
        let kind = match side {
            Side::Out => LedgerKind::Out,
            Side::In => LedgerKind::In,
        };
        if self.address_store.ledger_contains(address, kind, state, outpoint).await {
            return Ok(());
        }

        // Promotion (spec §3 invariant 3): an outpoint occupies at most one
        // state bucket per ledger at a time. If an earlier state already
        // recorded this outpoint, retract it there before recording the new
        // one; demotion never happens under normal forward operation.
        for prior in State::ALL.into_iter().filter(|s| *s < state) {
            if let Some(removed) = self.address_store.remove_ledger_entry(address, kind, prior, outpoint).await? {
                match side {
                    Side::Out => self.balance.debit(prior, removed),
                    Side::In => self.balance.credit(prior, removed),
                }
                break;
            }
        }

        self.address_store.record_ledger_entry(address, kind, state, outpoint, value).await?;
        match side {
            Side::Out => self.balance.credit(state, value),
            Side::In => self.balance.debit(state, value),
        }

        if side == Side::In
            && tx_fee > Amount::ZERO
            && !self.address_store.ledger_contains(address, LedgerKind::Fee, state, outpoint).await
        {
            for prior in State::ALL.into_iter().filter(|s| *s < state) {
                self.address_store.remove_ledger_entry(address, LedgerKind::Fee, prior, outpoint).await?;
            }
            self.address_store.record_ledger_entry(address, LedgerKind::Fee, state, outpoint, tx_fee).await?;
        }

        match side {
            Side::Out => {
                let record = self.address_store.get(address).await.expect("record ensured above");
                self.unspent_store
                    .add(Utxo {
                        outpoint,
                        value,
                        address: address.to_string(),
                        public_key: record.public_key,
                        path: record.path,
                        state,
                        locked: false,
                    })
                    .await;
            }
            Side::In => {
                self.unspent_store.mark_spent(outpoint).await;
            }
        }
        Ok(())
    }

    /// New-block handler (spec §4.2): rescans every tx recorded at
    /// `height == 0` or in `[last, current]`, promoting mempool entries to
    /// pending/confirmed. Reorgs deeper than one block are not handled
    /// (spec §9 open question).
    pub async fn on_new_block(&mut self, current: u32) -> Result<()> {
        let last = self.current_block;
        self.current_block = current;
        if last == 0 || current <= last {
            return Ok(());
        }

        let mut candidates = self.address_store.mempool_txids().await;
        for height in (last as i64)..=(current as i64) {
            candidates.extend(self.address_store.txids_at_height(height).await);
        }
        candidates.sort();
        candidates.dedup();

        for txid in candidates {
            let Some(owners) = self.tx_owner.get(&txid).cloned() else { continue };
            for (address, path) in owners {
                let Some(path) = path else { continue };
                let script_hash = match self.deriver.path_to_script_hash(path) {
                    Ok(hash) => hash,
                    Err(err) => {
                        warn!(%txid, error = %err, "failed to re-derive script-hash for rescan");
                        continue;
                    }
                };
                let history = match self.provider.get_history(&script_hash, false).await {
                    Ok(history) => history,
                    Err(err) => {
                        warn!(%txid, error = %err, "rescan fetch failed, leaving entry as-is");
                        continue;
                    }
                };
                let matching: Vec<HistoryEntry> = history.into_iter().filter(|e| e.txid == txid).collect();
                if !matching.is_empty() {
                    self.process_history(&address, Some(path), matching).await?;
                }
            }
        }

        self.unspent_store.process().await;
        Ok(())
    }

    /// Script-hash-change handler (spec §4.2): refetches mempool history for
    /// the changed script-hash if its status actually moved, then evicts
    /// internal-chain watch entries whose balance is now fully consumed.
    pub async fn on_script_hash_changed(&mut self, script_hash: &str, new_status: &str) -> Result<()> {
        if !self.watch.note_status(script_hash, new_status) {
            return Ok(());
        }
        let Some((address, path)) = self.address_index.get(script_hash).cloned() else {
            return Ok(());
        };
        let mempool = self.provider.get_mempool(script_hash).await?;
        if !mempool.is_empty() {
            self.process_history(&address, path, mempool).await?;
        }

        let mut consumed_hashes = Vec::new();
        for (sh, (addr, _)) in self.address_index.iter() {
            if let Some(record) = self.address_store.get(addr).await {
                let fully_spent = State::ALL.iter().all(|s| record.net(*s) == 0);
                if record.has_tx && fully_spent {
                    consumed_hashes.push(sh.clone());
                }
            }
        }
        self.watch.evict_consumed_internal(|sh| consumed_hashes.iter().any(|c| c == sh));
        self.unspent_store.process().await;
        Ok(())
    }

    /// Adds `path`'s script-hash to the watch ring and subscribes with the
    /// provider (spec §4.2 `watchAddress`).
    pub async fn watch_address(&mut self, chain: Chain, path: HdPath) -> Result<()> {
        let derived = self.deriver.derive_address(path)?;
        self.address_index.insert(derived.script_hash.clone(), (derived.address.to_string(), Some(path)));
        self.watch.watch(chain, &derived.script_hash);
        self.watch.subscribe_all(self.provider.as_ref()).await
    }

    /// Hands out the next unused address on `chain` (spec §4.1/§4.4
    /// `getNewAddress`), registering its record and watch subscription the
    /// same way a scan-discovered address is registered in `visit_path`.
    pub async fn get_new_address(&mut self, chain: Chain) -> Result<crate::keys::DerivedAddress> {
        let derived = self.hd_wallet_mut().get_new_address(chain)?;
        self.address_store
            .get_or_create(&derived.address.to_string(), derived.path, derived.public_key, &derived.script_hash)
            .await;
        self.watch_address(chain, derived.path).await?;
        Ok(derived)
    }

    /// Registers a one-shot wait for `txid` to be observed in the mempool
    /// (spec §9 "Promise-with-attached-callback": the send operation's
    /// second awaitable). Fires at most once (spec §5 ordering guarantee).
    pub fn watch_tx_mempool(&mut self, txid: Txid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.mempool_waiters.insert(txid, tx);
        rx
    }

    pub async fn get_balance(&self, address: Option<&str>) -> TotalBalance {
        match address {
            None => self.balance,
            Some(addr) => {
                let mut balance = TotalBalance::ZERO;
                if let Some(record) = self.address_store.get(addr).await {
                    for state in State::ALL {
                        let net = record.net(state);
                        match state {
                            State::Mempool => balance.mempool = net,
                            State::Pending => balance.pending = net,
                            State::Confirmed => balance.confirmed = net,
                        }
                    }
                }
                balance
            }
        }
    }

    pub async fn get_transactions(&self, limit: usize, offset: usize, reverse: bool) -> Vec<TxEntry> {
        self.address_store.get_transactions(limit, offset, reverse).await
    }

    pub async fn utxo_for_amount(&self, value: Amount, fee_rate: f64) -> Result<Reservation> {
        self.unspent_store.get_utxo_for_amount(value, fee_rate).await
    }

    /// Cooperative pause (spec §4.2/§5 `pauseSync`): resolves immediately if
    /// no scan is running, otherwise waits for the in-flight path to finish
    /// and `sync-end` to fire.
    pub async fn pause_sync(&self) {
        let notified = self.control.sync_end.notified();
        if !self.control.in_progress.load(Ordering::SeqCst) {
            return;
        }
        self.control.halt.store(true, Ordering::SeqCst);
        debug!("halting sync, waiting for in-flight path to finish");
        notified.await;
    }

    pub fn address_store(&self) -> &AddressStore {
        &self.address_store
    }

    pub fn unspent_store(&self) -> &UnspentStore {
        &self.unspent_store
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }
}
