//! Tracks which script-hashes are subscribed with the provider, per chain,
//! and re-subscribes on resume (spec §3 "Watched script-hash list", §5
//! "Reconnection").

use std::collections::VecDeque;

use crate::error::Result;
use crate::keys::Chain;
use crate::provider::ProviderClient;

#[derive(Debug, Clone)]
struct WatchEntry {
    script_hash: String,
    status: Option<String>,
}

/// A bounded per-chain FIFO ring of `(script_hash, last_status_hash)` pairs
/// (spec §3). `external` additionally never evicts an entry still in use by
/// `HdWallet`'s hand-out high-water mark; eviction here only governs the
/// watch ring itself, not the address-reuse guard.
pub struct AddressWatch {
    max: usize,
    external: VecDeque<WatchEntry>,
    internal: VecDeque<WatchEntry>,
}

impl AddressWatch {
    pub fn new(max_script_watch: usize) -> Self {
        Self { max: max_script_watch, external: VecDeque::new(), internal: VecDeque::new() }
    }

    fn ring(&self, chain: Chain) -> &VecDeque<WatchEntry> {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn ring_mut(&mut self, chain: Chain) -> &mut VecDeque<WatchEntry> {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }

    pub fn is_watching(&self, script_hash: &str) -> bool {
        self.external.iter().chain(self.internal.iter()).any(|e| e.script_hash == script_hash)
    }

    /// Adds `script_hash` to `chain`'s ring if not already present, evicting
    /// the oldest entry on overflow (FIFO, spec §3). No-op if already
    /// watched on this chain.
    pub fn watch(&mut self, chain: Chain, script_hash: &str) {
        let ring = self.ring_mut(chain);
        if ring.iter().any(|e| e.script_hash == script_hash) {
            return;
        }
        ring.push_back(WatchEntry { script_hash: script_hash.to_string(), status: None });
    }

    /// Subscribes to every script-hash newly added via [`Self::watch`] (or
    /// every one, on resume after a reconnect) and records the returned
    /// status hash. Evicts down to `max` per ring on overflow, oldest-first.
    pub async fn subscribe_all(&mut self, provider: &dyn ProviderClient) -> Result<()> {
        for chain in [Chain::External, Chain::Internal] {
            let hashes: Vec<String> = self.ring(chain).iter().map(|e| e.script_hash.clone()).collect();
            for script_hash in hashes {
                let status = provider.scripthash_subscribe(&script_hash).await?;
                if let Some(entry) = self.ring_mut(chain).iter_mut().find(|e| e.script_hash == script_hash) {
                    entry.status = Some(status);
                }
            }
            while self.ring(chain).len() > self.max {
                self.ring_mut(chain).pop_front();
            }
        }
        Ok(())
    }

    /// Updates the stored status hash for `script_hash`; returns `true` if
    /// it differs from what was stored (i.e. the script-hash-change handler
    /// must fetch fresh history), `false` if unchanged or unwatched.
    pub fn note_status(&mut self, script_hash: &str, status: &str) -> bool {
        for ring in [&mut self.external, &mut self.internal] {
            if let Some(entry) = ring.iter_mut().find(|e| e.script_hash == script_hash) {
                let changed = entry.status.as_deref() != Some(status);
                entry.status = Some(status.to_string());
                return changed;
            }
        }
        false
    }

    /// Drops internal-chain entries for which `is_consumed` holds (their
    /// change balance has been spent through), per spec §4.2
    /// script-hash-change handler.
    pub fn evict_consumed_internal(&mut self, is_consumed: impl Fn(&str) -> bool) {
        self.internal.retain(|e| !is_consumed(&e.script_hash));
    }

    pub fn len(&self, chain: Chain) -> usize {
        self.ring(chain).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;

    #[test]
    fn watch_is_idempotent_and_fifo_bounded() {
        let mut watch = AddressWatch::new(2);
        watch.watch(Chain::External, "a");
        watch.watch(Chain::External, "a");
        assert_eq!(watch.len(Chain::External), 1);
        watch.watch(Chain::External, "b");
        watch.watch(Chain::External, "c");
        assert_eq!(watch.len(Chain::External), 3);
    }

    #[tokio::test]
    async fn subscribe_all_evicts_down_to_max() {
        let mut watch = AddressWatch::new(2);
        let provider = MockProvider::new();
        watch.watch(Chain::External, "a");
        watch.watch(Chain::External, "b");
        watch.watch(Chain::External, "c");
        watch.subscribe_all(&provider).await.unwrap();
        assert_eq!(watch.len(Chain::External), 2);
        assert!(!watch.is_watching("a"));
    }

    #[test]
    fn note_status_reports_change() {
        let mut watch = AddressWatch::new(10);
        watch.watch(Chain::External, "a");
        assert!(watch.note_status("a", "s1"));
        assert!(!watch.note_status("a", "s1"));
        assert!(watch.note_status("a", "s2"));
    }

    #[test]
    fn evict_consumed_internal_only_touches_internal_ring() {
        let mut watch = AddressWatch::new(10);
        watch.watch(Chain::Internal, "int1");
        watch.watch(Chain::External, "ext1");
        watch.evict_consumed_internal(|h| h == "int1");
        assert!(!watch.is_watching("int1"));
        assert!(watch.is_watching("ext1"));
    }
}
