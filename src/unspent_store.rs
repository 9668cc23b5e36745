//! The live UTXO set and UTXO-for-amount reservation (spec §4.3).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bitcoin::key::CompressedPublicKey;
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::currency::Amount;
use crate::error::{Error, Result};
use crate::fee::estimate_fee;
use crate::keys::HdPath;
use crate::model::State;
use crate::storage::{get_json, put_json, KvStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub address: String,
    pub public_key: CompressedPublicKey,
    pub path: HdPath,
    pub state: State,
    pub locked: bool,
}

/// A `getUtxoForAmount` reservation: the selected UTXOs are marked `locked`
/// in the store until [`UnspentStore::unlock`] or the spend is observed
/// through (spec §5 "Shared-resource policy").
#[derive(Debug, Clone)]
pub struct Reservation {
    pub utxos: Vec<Utxo>,
    pub total: Amount,
    pub change: Amount,
}

const UTXO_PREFIX: &str = "utxo:";

pub struct UnspentStore {
    store: Arc<dyn KvStore>,
    utxos: RwLock<HashMap<OutPoint, Utxo>>,
    /// Outpoints observed as spent (an `in` ledger entry was recorded) but
    /// not yet reconciled away by [`Self::process`].
    spent: RwLock<HashSet<OutPoint>>,
}

impl UnspentStore {
    pub async fn open(store: Arc<dyn KvStore>) -> Self {
        let mut utxos = HashMap::new();
        for (key, _) in store.entries(UTXO_PREFIX).await {
            if let Some(utxo) = get_json::<Utxo>(store.as_ref(), &key).await {
                utxos.insert(utxo.outpoint, utxo);
            }
        }
        Self { store, utxos: RwLock::new(utxos), spent: RwLock::new(HashSet::new()) }
    }

    fn key(outpoint: OutPoint) -> String {
        format!("{UTXO_PREFIX}{outpoint}")
    }

    /// Adds a newly observed output (spec §4.2 processUtxo, `out` case).
    pub async fn add(&self, utxo: Utxo) {
        put_json(self.store.as_ref(), &Self::key(utxo.outpoint), &utxo).await;
        self.utxos.write().await.insert(utxo.outpoint, utxo);
    }

    /// Records that `outpoint` was observed spent (spec §4.2 processUtxo,
    /// `in` case). Removal is deferred to [`Self::process`].
    pub async fn mark_spent(&self, outpoint: OutPoint) {
        self.spent.write().await.insert(outpoint);
    }

    /// Removes every UTXO whose spending input has been observed (spec
    /// §4.3). Called after a scan pass or a notification handler finishes.
    pub async fn process(&self) {
        let spent: Vec<OutPoint> = self.spent.read().await.iter().copied().collect();
        if spent.is_empty() {
            return;
        }
        let mut utxos = self.utxos.write().await;
        for outpoint in &spent {
            if utxos.remove(outpoint).is_some() {
                self.store.delete(&Self::key(*outpoint)).await;
            }
        }
        drop(utxos);
        self.spent.write().await.clear();
    }

    async fn update_locked(&self, outpoint: OutPoint, locked: bool) {
        let mut utxos = self.utxos.write().await;
        if let Some(utxo) = utxos.get_mut(&outpoint) {
            utxo.locked = locked;
            let snapshot = utxo.clone();
            drop(utxos);
            put_json(self.store.as_ref(), &Self::key(outpoint), &snapshot).await;
        }
    }

    /// Unlocked UTXOs at `state`, highest value first.
    async fn unlocked_by_state_desc(&self, state: State) -> Vec<Utxo> {
        let mut out: Vec<Utxo> =
            self.utxos.read().await.values().filter(|u| !u.locked && u.state == state).cloned().collect();
        out.sort_by(|a, b| b.value.cmp(&a.value));
        out
    }

    /// Default coin selection (spec §4.3, the only strategy required):
    /// confirmed UTXOs descending by value, falling back to pending once
    /// confirmed is exhausted; mempool UTXOs are never selected. Fee is
    /// recomputed on every added input, since vSize grows with input count.
    pub async fn get_utxo_for_amount(&self, value: Amount, fee_rate: f64) -> Result<Reservation> {
        let mut pool = self.unlocked_by_state_desc(State::Confirmed).await;
        pool.extend(self.unlocked_by_state_desc(State::Pending).await);

        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for utxo in pool {
            total = total.checked_add(utxo.value).ok_or(Error::InsufficientFunds)?;
            selected.push(utxo);
            let fee = Amount::from_sat(estimate_fee(selected.len(), 2, fee_rate));
            if let Some(needed) = value.checked_add(fee) {
                if total >= needed {
                    let change = total.checked_sub(needed).expect("total >= needed just checked");
                    for utxo in &selected {
                        self.update_locked(utxo.outpoint, true).await;
                    }
                    return Ok(Reservation { utxos: selected, total, change });
                }
            }
        }
        Err(Error::InsufficientFunds)
    }

    /// Releases a reservation's UTXOs, e.g. after a failed broadcast (spec
    /// §4.4 step 7, §7).
    pub async fn unlock(&self, reservation: &Reservation) {
        for utxo in &reservation.utxos {
            self.update_locked(utxo.outpoint, false).await;
        }
    }

    pub async fn all(&self) -> Vec<Utxo> {
        self.utxos.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, outpoint: OutPoint) -> bool {
        self.utxos.read().await.contains_key(&outpoint)
    }

    /// Wipes every persisted UTXO. Used by `syncAccount({restart: true})`.
    pub async fn clear_all(&self) {
        self.store.clear().await;
        self.utxos.write().await.clear();
        self.spent.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Chain;
    use crate::storage::MemoryStore;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn dummy_pubkey() -> CompressedPublicKey {
        use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[9u8; 32]).unwrap();
        CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk))
    }

    fn utxo(seed: u8, value: u64, state: State) -> Utxo {
        Utxo {
            outpoint: OutPoint { txid: Txid::from_byte_array([seed; 32]), vout: 0 },
            value: Amount::from_sat(value),
            address: format!("addr{seed}"),
            public_key: dummy_pubkey(),
            path: HdPath::new(0, Chain::External, seed as u32),
            state,
            locked: false,
        }
    }

    #[tokio::test]
    async fn selection_prefers_confirmed_and_locks_selected() {
        let store = UnspentStore::open(MemoryStore::new()).await;
        store.add(utxo(1, 10_000_000, State::Confirmed)).await;
        store.add(utxo(2, 10_000_000, State::Confirmed)).await;

        let reservation = store.get_utxo_for_amount(Amount::from_sat(10_000_000), 10.0).await.unwrap();
        assert_eq!(reservation.utxos.len(), 2);
        assert!(reservation.total.as_sat() >= 10_000_000 + reservation_fee(2));

        let all = store.all().await;
        assert!(all.iter().all(|u| u.locked));
    }

    fn reservation_fee(n_in: usize) -> u64 {
        crate::fee::estimate_fee(n_in, 2, 10.0)
    }

    #[tokio::test]
    async fn insufficient_funds_when_pool_cannot_cover_fee() {
        let store = UnspentStore::open(MemoryStore::new()).await;
        store.add(utxo(1, 10_000_000, State::Confirmed)).await;
        store.add(utxo(2, 10_000_000, State::Confirmed)).await;
        let err = store.get_utxo_for_amount(Amount::from_sat(20_000_000), 10.0).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
    }

    #[tokio::test]
    async fn unlock_releases_reservation() {
        let store = UnspentStore::open(MemoryStore::new()).await;
        store.add(utxo(1, 10_000_000, State::Confirmed)).await;
        let reservation = store.get_utxo_for_amount(Amount::from_sat(1_000_000), 10.0).await.unwrap();
        store.unlock(&reservation).await;
        let all = store.all().await;
        assert!(all.iter().all(|u| !u.locked));
    }

    #[tokio::test]
    async fn process_removes_spent_utxos() {
        let store = UnspentStore::open(MemoryStore::new()).await;
        let u = utxo(1, 1_000, State::Confirmed);
        let outpoint = u.outpoint;
        store.add(u).await;
        store.mark_spent(outpoint).await;
        store.process().await;
        assert!(!store.contains(outpoint).await);
    }

    #[tokio::test]
    async fn mempool_utxos_are_never_selected() {
        let store = UnspentStore::open(MemoryStore::new()).await;
        store.add(utxo(1, 50_000_000, State::Mempool)).await;
        let err = store.get_utxo_for_amount(Amount::from_sat(1_000), 10.0).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
    }
}
