//! Gap-limit-aware path iterator over the external/internal chains, plus the
//! address-reuse guard (spec §4.1).

use std::collections::BTreeSet;
use std::future::Future;

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::keys::{Chain, DerivedAddress, HdPath, KeyDeriver};

/// What a path visit told the scanner during `for_each_account` (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    HasTx,
    NoTx,
    /// Cooperative cancellation: abort the scan immediately.
    Stop,
}

/// Per-chain HD sync state, persisted so `syncAccount` resumes at the next
/// path after restart (spec §3 "HD sync state").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChainSyncState {
    pub cursor: u32,
    pub gap_count: u32,
}

impl ChainSyncState {
    const fn fresh() -> Self {
        Self { cursor: 0, gap_count: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    sync: ChainSyncState,
    /// Indices observed (via `processHistory`) to carry at least one tx.
    has_tx: BTreeSet<u32>,
    /// Highest index ever handed out by `get_new_address`, so we don't
    /// reuse an address that was given out but hasn't synced yet.
    handed_out: Option<u32>,
}

impl ChainState {
    fn fresh() -> Self {
        Self { sync: ChainSyncState::fresh(), has_tx: BTreeSet::new(), handed_out: None }
    }

    fn next_free_index(&self) -> u32 {
        let after_tx = self.has_tx.iter().next_back().map(|i| i + 1).unwrap_or(0);
        let after_handed_out = self.handed_out.map(|i| i + 1).unwrap_or(0);
        after_tx.max(after_handed_out)
    }
}

/// Path iterator + address-reuse guard over a BIP84 account (account `0`
/// only, per spec Non-goals).
pub struct HdWallet {
    deriver: KeyDeriver,
    coin_type: u32,
    gap_limit: u32,
    ext: ChainState,
    int: ChainState,
}

impl HdWallet {
    pub fn new(deriver: KeyDeriver, gap_limit: u32) -> Self {
        let coin_type = HdPath::coin_type_for_network(deriver.network());
        Self { deriver, coin_type, gap_limit, ext: ChainState::fresh(), int: ChainState::fresh() }
    }

    pub fn network(&self) -> Network {
        self.deriver.network()
    }

    fn chain_state(&self, chain: Chain) -> &ChainState {
        match chain {
            Chain::External => &self.ext,
            Chain::Internal => &self.int,
        }
    }

    fn chain_state_mut(&mut self, chain: Chain) -> &mut ChainState {
        match chain {
            Chain::External => &mut self.ext,
            Chain::Internal => &mut self.int,
        }
    }

    /// Returns the lowest-index path on `chain` that has never carried a tx
    /// and has never been handed out before, advancing the hand-out
    /// high-water mark. This is the address-reuse guard of spec §4.1: after
    /// syncing, the next external index is `max(index where has_tx) + 1`,
    /// even across process restarts of a fresh instance sharing the seed
    /// (as long as `has_tx`/`handed_out` were restored from storage first).
    pub fn get_new_address(&mut self, chain: Chain) -> Result<DerivedAddress> {
        let index = self.chain_state(chain).next_free_index();
        let derived = self.deriver.derive_address(HdPath::new(self.coin_type, chain, index))?;
        self.chain_state_mut(chain).handed_out = Some(index);
        Ok(derived)
    }

    /// All addresses ever derived (has-tx or handed-out) on both chains.
    pub fn get_all_addresses(&self) -> Result<Vec<DerivedAddress>> {
        let mut out = Vec::new();
        for chain in [Chain::External, Chain::Internal] {
            let high = self.chain_state(chain).next_free_index();
            for index in 0..high {
                out.push(self.deriver.derive_address(HdPath::new(self.coin_type, chain, index))?);
            }
        }
        Ok(out)
    }

    pub fn get_last_ext_path(&self) -> Option<HdPath> {
        self.ext.handed_out.map(|index| HdPath::new(self.coin_type, Chain::External, index))
    }

    /// Resets the per-chain scan cursor so the next `for_each_account` call
    /// rescans from index 0. `has_tx`/`handed_out` bookkeeping (the
    /// reuse-guard state) is preserved intentionally: a `reset` re-derives
    /// history, it does not forget which addresses were already used.
    pub fn reset_sync_state(&mut self) {
        self.ext.sync = ChainSyncState::fresh();
        self.int.sync = ChainSyncState::fresh();
    }

    /// Full wipe: forgets `has_tx`/`handed_out` bookkeeping along with the
    /// scan cursor, so the next scan starts as if from a brand-new seed.
    /// Used by `syncAccount({restart: true})`.
    pub fn hard_reset(&mut self) {
        self.ext = ChainState::fresh();
        self.int = ChainState::fresh();
    }

    pub fn sync_state(&self, chain: Chain) -> ChainSyncState {
        self.chain_state(chain).sync
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Records that `index` on `chain` was (or wasn't) observed to carry a
    /// tx, updating the gap counter and cursor (spec §4.1). Returns the
    /// chain's post-update sync state, for `synced-path` event payloads.
    fn advance(&mut self, chain: Chain, index: u32, has_tx: bool) -> ChainSyncState {
        let state = self.chain_state_mut(chain);
        if has_tx {
            state.has_tx.insert(index);
            state.sync.gap_count = 0;
        } else {
            state.sync.gap_count += 1;
        }
        state.sync.cursor = index + 1;
        state.sync
    }

    fn gap_exhausted(&self, chain: Chain) -> bool {
        self.chain_state(chain).sync.gap_count >= self.gap_limit
    }

    /// Drives the gap-limit scan (spec §4.1). `visit` is invoked once per
    /// path with the path to probe, and must resolve to the [`ScanSignal`]
    /// learned from the provider. External chain is scanned to completion
    /// before internal chain. The sequence of `(chain, path.index)`
    /// arguments across one call is strictly increasing per chain (spec §5
    /// ordering guarantee, spec §8 property 3).
    pub async fn for_each_account<F, Fut>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(Chain, HdPath, ChainSyncState) -> Fut,
        Fut: Future<Output = Result<ScanSignal>>,
    {
        for chain in [Chain::External, Chain::Internal] {
            loop {
                let index = self.chain_state(chain).sync.cursor;
                let path = HdPath::new(self.coin_type, chain, index);
                let pre_state = self.chain_state(chain).sync;
                let signal = visit(chain, path, pre_state).await?;
                match signal {
                    ScanSignal::Stop => return Ok(()),
                    ScanSignal::HasTx => {
                        self.advance(chain, index, true);
                    }
                    ScanSignal::NoTx => {
                        self.advance(chain, index, false);
                    }
                }
                debug!(?chain, index, ?signal, "scanned path");
                if self.gap_exhausted(chain) {
                    break;
                }
            }
        }
        Ok(())
    }
}
