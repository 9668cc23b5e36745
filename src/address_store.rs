//! Per-address balance ledger and transaction log keyed by outpoint (spec
//! §4.5). Persistent mapping `address -> AddressRecord`, a secondary
//! `height -> [txid]` index for the new-block scan, a tx log keyed by
//! `txid`, and an outgoing-tx cache (`addSentTx`/`getSentTx`) retaining
//! builder-side metadata before the provider confirms a send.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bitcoin::key::CompressedPublicKey;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::currency::Amount;
use crate::error::{Error, Result};
use crate::keys::HdPath;
use crate::model::{State, TxEntry};
use crate::storage::{get_json, put_json, KvStore};

/// Which of the three ledgers an entry belongs to (spec §3 "Address record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    In,
    Out,
    Fee,
}

/// A `state -> { outpoint -> amount }` ledger. Outpoints are keyed by their
/// `txid:vout` string so the ledger can round-trip through JSON (map keys
/// must be strings) without a custom serializer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    mempool: BTreeMap<String, Amount>,
    pending: BTreeMap<String, Amount>,
    confirmed: BTreeMap<String, Amount>,
}

impl Ledger {
    fn map(&self, state: State) -> &BTreeMap<String, Amount> {
        match state {
            State::Mempool => &self.mempool,
            State::Pending => &self.pending,
            State::Confirmed => &self.confirmed,
        }
    }

    fn map_mut(&mut self, state: State) -> &mut BTreeMap<String, Amount> {
        match state {
            State::Mempool => &mut self.mempool,
            State::Pending => &mut self.pending,
            State::Confirmed => &mut self.confirmed,
        }
    }

    pub fn contains(&self, state: State, outpoint: OutPoint) -> bool {
        self.map(state).contains_key(&outpoint.to_string())
    }

    pub fn insert(&mut self, state: State, outpoint: OutPoint, amount: Amount) {
        self.map_mut(state).insert(outpoint.to_string(), amount);
    }

    pub fn remove(&mut self, state: State, outpoint: OutPoint) -> Option<Amount> {
        self.map_mut(state).remove(&outpoint.to_string())
    }

    /// Net amount recorded at `state`, summed over every outpoint.
    pub fn net(&self, state: State) -> Amount {
        self.map(state).values().fold(Amount::ZERO, |acc, v| acc + *v)
    }

    pub fn entries(&self, state: State) -> impl Iterator<Item = (&str, Amount)> {
        self.map(state).iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledgers {
    pub r#in: Ledger,
    pub out: Ledger,
    pub fee: Ledger,
}

impl Ledgers {
    fn kind(&self, kind: LedgerKind) -> &Ledger {
        match kind {
            LedgerKind::In => &self.r#in,
            LedgerKind::Out => &self.out,
            LedgerKind::Fee => &self.fee,
        }
    }

    fn kind_mut(&mut self, kind: LedgerKind) -> &mut Ledger {
        match kind {
            LedgerKind::In => &mut self.r#in,
            LedgerKind::Out => &mut self.out,
            LedgerKind::Fee => &mut self.fee,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub path: HdPath,
    pub public_key: CompressedPublicKey,
    pub script_hash: String,
    pub ledgers: Ledgers,
    pub has_tx: bool,
}

impl AddressRecord {
    fn new(address: String, path: HdPath, public_key: CompressedPublicKey, script_hash: String) -> Self {
        Self { address, path, public_key, script_hash, ledgers: Ledgers::default(), has_tx: false }
    }

    /// Net balance at `state`: `out.state − in.state` (spec §3 invariant 4).
    pub fn net(&self, state: State) -> i64 {
        self.ledgers.out.net(state).as_sat() as i64 - self.ledgers.r#in.net(state).as_sat() as i64
    }
}

/// Metadata a `TxBuilder` send retains before the provider confirms the tx
/// (spec §4.5 "outgoing-tx cache").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentTxMeta {
    pub txid: Txid,
    pub hex: String,
    pub selected_inputs: Vec<OutPoint>,
}

const RECORDS_KEY_PREFIX: &str = "record:";
const TX_KEY_PREFIX: &str = "tx:";
const HEIGHT_INDEX_PREFIX: &str = "height:";
const SENT_TX_PREFIX: &str = "sent:";

pub struct AddressStore {
    store: Arc<dyn KvStore>,
    records: RwLock<HashMap<String, AddressRecord>>,
    txs: RwLock<HashMap<Txid, TxEntry>>,
    /// height -> txids mined at that height, for the new-block rescan.
    height_index: RwLock<HashMap<i64, Vec<Txid>>>,
    sent: RwLock<HashMap<Txid, SentTxMeta>>,
}

impl AddressStore {
    /// Opens the store, loading any previously persisted records/tx log.
    pub async fn open(store: Arc<dyn KvStore>) -> Self {
        let mut records = HashMap::new();
        for (key, _) in store.entries(RECORDS_KEY_PREFIX).await {
            let address = key.trim_start_matches(RECORDS_KEY_PREFIX).to_string();
            if let Some(record) = get_json::<AddressRecord>(store.as_ref(), &key).await {
                records.insert(address, record);
            }
        }
        let mut txs = HashMap::new();
        let mut height_index: HashMap<i64, Vec<Txid>> = HashMap::new();
        for (key, _) in store.entries(TX_KEY_PREFIX).await {
            if let Some(entry) = get_json::<TxEntry>(store.as_ref(), &key).await {
                height_index.entry(entry.height).or_default().push(entry.txid);
                txs.insert(entry.txid, entry);
            }
        }
        let mut sent = HashMap::new();
        for (key, _) in store.entries(SENT_TX_PREFIX).await {
            if let Some(meta) = get_json::<SentTxMeta>(store.as_ref(), &key).await {
                sent.insert(meta.txid, meta);
            }
        }
        Self {
            store,
            records: RwLock::new(records),
            txs: RwLock::new(txs),
            height_index: RwLock::new(height_index),
            sent: RwLock::new(sent),
        }
    }

    async fn persist_record(&self, record: &AddressRecord) {
        let key = format!("{RECORDS_KEY_PREFIX}{}", record.address);
        put_json(self.store.as_ref(), &key, record).await;
    }

    /// Ensures an [`AddressRecord`] exists for `address`, creating it from
    /// `path`/`public_key`/`script_hash` if this is the first time it's seen
    /// (spec §4.2 processUtxo: "Ensure an AddressStore record exists").
    pub async fn get_or_create(
        &self,
        address: &str,
        path: HdPath,
        public_key: CompressedPublicKey,
        script_hash: &str,
    ) -> AddressRecord {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(address) {
            return existing.clone();
        }
        let record = AddressRecord::new(address.to_string(), path, public_key, script_hash.to_string());
        records.insert(address.to_string(), record.clone());
        record
    }

    pub async fn get(&self, address: &str) -> Option<AddressRecord> {
        self.records.read().await.get(address).cloned()
    }

    pub async fn is_ours(&self, address: &str) -> bool {
        self.records.read().await.contains_key(address)
    }

    /// Whether `outpoint` is already recorded at `state` in `kind`'s ledger
    /// for `address` -- the idempotence check of spec §4.2 processUtxo.
    pub async fn ledger_contains(
        &self,
        address: &str,
        kind: LedgerKind,
        state: State,
        outpoint: OutPoint,
    ) -> bool {
        self.records
            .read()
            .await
            .get(address)
            .map(|r| r.ledgers.kind(kind).contains(state, outpoint))
            .unwrap_or(false)
    }

    /// Removes a ledger entry previously recorded at `state`, e.g. when
    /// promoting an outpoint `mempool -> pending -> confirmed` (spec §3
    /// invariant 3: an outpoint occupies at most one state bucket at a
    /// time). Returns the removed amount, or `None` if nothing was there.
    pub async fn remove_ledger_entry(
        &self,
        address: &str,
        kind: LedgerKind,
        state: State,
        outpoint: OutPoint,
    ) -> Result<Option<Amount>> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(address)
            .ok_or_else(|| Error::AddressUnknown(address.to_string()))?;
        let removed = record.ledgers.kind_mut(kind).remove(state, outpoint);
        let snapshot = record.clone();
        drop(records);
        self.persist_record(&snapshot).await;
        Ok(removed)
    }

    /// Records `amount` in `address`'s `kind` ledger at `state` for
    /// `outpoint`, and sets `has_tx`. Returns `Err(AddressUnknown)` if the
    /// address was never created via [`Self::get_or_create`].
    pub async fn record_ledger_entry(
        &self,
        address: &str,
        kind: LedgerKind,
        state: State,
        outpoint: OutPoint,
        amount: Amount,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(address)
            .ok_or_else(|| Error::AddressUnknown(address.to_string()))?;
        record.ledgers.kind_mut(kind).insert(state, outpoint, amount);
        record.has_tx = true;
        let snapshot = record.clone();
        drop(records);
        self.persist_record(&snapshot).await;
        Ok(())
    }

    /// Persists a [`TxEntry`], updating the height index.
    pub async fn put_tx(&self, entry: TxEntry) {
        let key = format!("{TX_KEY_PREFIX}{}", entry.txid);
        put_json(self.store.as_ref(), &key, &entry).await;

        let mut height_index = self.height_index.write().await;
        height_index.entry(entry.height).or_default().push(entry.txid);

        self.txs.write().await.insert(entry.txid, entry);
    }

    pub async fn get_tx(&self, txid: &Txid) -> Option<TxEntry> {
        self.txs.read().await.get(txid).cloned()
    }

    /// All txids previously recorded at `height` (used by the new-block
    /// rescan, spec §4.2).
    pub async fn txids_at_height(&self, height: i64) -> Vec<Txid> {
        self.height_index.read().await.get(&height).cloned().unwrap_or_default()
    }

    /// All txids currently recorded at height 0 (still in mempool).
    pub async fn mempool_txids(&self) -> Vec<Txid> {
        self.height_index.read().await.get(&0).cloned().unwrap_or_default()
    }

    /// Paginated transaction history, ordered by block height (descending by
    /// default, ascending with `reverse`), per spec §4.5.
    pub async fn get_transactions(&self, limit: usize, offset: usize, reverse: bool) -> Vec<TxEntry> {
        let txs = self.txs.read().await;
        let mut all: Vec<&TxEntry> = txs.values().collect();
        if reverse {
            all.sort_by_key(|e| e.height);
        } else {
            all.sort_by_key(|e| std::cmp::Reverse(e.height));
        }
        all.into_iter().skip(offset).take(limit).cloned().collect()
    }

    pub async fn add_sent_tx(&self, meta: SentTxMeta) {
        let key = format!("{SENT_TX_PREFIX}{}", meta.txid);
        put_json(self.store.as_ref(), &key, &meta).await;
        self.sent.write().await.insert(meta.txid, meta);
    }

    pub async fn get_sent_tx(&self, txid: &Txid) -> Option<SentTxMeta> {
        self.sent.read().await.get(txid).cloned()
    }

    pub async fn all_addresses(&self) -> Vec<AddressRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Wipes every persisted record, tx, and index entry. Used by
    /// `syncAccount({restart: true})`.
    pub async fn clear_all(&self) {
        self.store.clear().await;
        self.records.write().await.clear();
        self.txs.write().await.clear();
        self.height_index.write().await.clear();
        self.sent.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Chain;
    use crate::storage::MemoryStore;
    use bitcoin::hashes::Hash;

    fn dummy_pubkey() -> CompressedPublicKey {
        use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk))
    }

    fn dummy_outpoint(seed: u8) -> OutPoint {
        OutPoint { txid: Txid::from_byte_array([seed; 32]), vout: 0 }
    }

    #[tokio::test]
    async fn ledger_entry_is_idempotent_and_unknown_address_errors() {
        let store = AddressStore::open(MemoryStore::new()).await;
        let path = HdPath::new(0, Chain::External, 0);
        let pk = dummy_pubkey();
        assert!(store
            .record_ledger_entry("bc1q", LedgerKind::Out, State::Mempool, dummy_outpoint(1), Amount::from_sat(1))
            .await
            .is_err());

        store.get_or_create("bc1q", path, pk, "hash").await;
        store
            .record_ledger_entry("bc1q", LedgerKind::Out, State::Mempool, dummy_outpoint(1), Amount::from_sat(100))
            .await
            .unwrap();
        assert!(store.ledger_contains("bc1q", LedgerKind::Out, State::Mempool, dummy_outpoint(1)).await);

        let record = store.get("bc1q").await.unwrap();
        assert_eq!(record.net(State::Mempool), 100);
        assert!(record.has_tx);
    }

    #[tokio::test]
    async fn transactions_paginate_by_height() {
        let store = AddressStore::open(MemoryStore::new()).await;
        for h in [3, 1, 2] {
            store
                .put_tx(TxEntry {
                    txid: Txid::from_byte_array([h as u8; 32]),
                    from_addresses: vec![],
                    to_addresses: vec![],
                    to_address_meta: vec![],
                    fee: Amount::ZERO,
                    amount: Amount::from_sat(1),
                    height: h,
                    direction: crate::model::Direction::Incoming,
                })
                .await;
        }
        let desc = store.get_transactions(10, 0, false).await;
        assert_eq!(desc.iter().map(|e| e.height).collect::<Vec<_>>(), vec![3, 2, 1]);
        let asc = store.get_transactions(10, 0, true).await;
        assert_eq!(asc.iter().map(|e| e.height).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
