// Rust Bitcoin Wallet
// Written in 2019 by
//   Steven Roose <steven@stevenroose.org>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the CC0 Public Domain Dedication
// along with this software.
// If not, see <http://creativecommons.org/publicdomain/zero/1.0/>.
//

//! # Bitcoin wallet sync and accounting core
//!
//! Derives BIP84 addresses from a pre-derived master key, syncs their
//! history against an Electrum-style provider, tracks balances and UTXOs
//! across the mempool/pending/confirmed lifecycle, and builds P2WPKH sends.
//! Seed generation, the wire transport to the provider, and the storage
//! backend are all external collaborators plugged in through the traits in
//! [`provider`] and [`storage`].

#![forbid(unsafe_code)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

pub mod address_store;
pub mod balance;
pub mod config;
pub mod currency;
pub mod error;
pub mod fee;
pub mod hdwallet;
pub mod keys;
pub mod logging;
pub mod model;
pub mod provider;
pub mod storage;
pub mod sync;
pub mod txbuilder;
pub mod unspent_store;
pub mod watch;

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

pub use config::WalletConfig;
pub use currency::{Amount, Unit};
pub use error::{Error, Result};
pub use keys::KeyDeriver;
pub use provider::ProviderClient;
pub use storage::KvStore;
pub use sync::{NoopEvents, SyncEvents, SyncManager};
pub use txbuilder::{SendOutcome, SendRequest, TxBuilder};

use provider::ProviderNotification;

/// The wallet's public entry point: owns a [`SyncManager`] behind a mutex
/// and pumps provider notifications into it for the lifetime of the
/// process (spec §4.2 init: "the wallet keeps syncing as new blocks and
/// script-hash changes arrive"). Mirrors the background-task-plus-shutdown
/// pattern the examples use for long-running provider plumbing, adapted to
/// a single cooperative task rather than a dedicated broadcaster actor,
/// since here there's exactly one kind of inbound event stream to drain.
pub struct Wallet {
    manager: Arc<Mutex<SyncManager>>,
    shutdown: Arc<Notify>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl Wallet {
    /// Opens the wallet and starts the notification pump.
    pub async fn open(
        config: WalletConfig,
        deriver: KeyDeriver,
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn KvStore>,
        events: Arc<dyn SyncEvents>,
    ) -> Result<Self> {
        let mut notifications = provider.take_notifications();
        let manager = Arc::new(Mutex::new(SyncManager::open(config, deriver, provider, store, events).await?));
        let shutdown = Arc::new(Notify::new());

        let pump_manager = Arc::clone(&manager);
        let pump_shutdown = Arc::clone(&shutdown);
        let pump = tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    notification = notifications.recv() => notification,
                    () = pump_shutdown.notified() => return,
                };
                let Some(notification) = notification else { return };
                let mut manager = pump_manager.lock().await;
                let result = match notification {
                    ProviderNotification::NewBlock { height } => manager.on_new_block(height).await,
                    ProviderNotification::ScriptHashChanged { script_hash } => {
                        match manager.provider().scripthash_subscribe(&script_hash).await {
                            Ok(status) => manager.on_script_hash_changed(&script_hash, &status).await,
                            Err(err) => {
                                warn!(%script_hash, error = %err, "failed to refresh changed script-hash status");
                                continue;
                            }
                        }
                    }
                };
                if let Err(err) = result {
                    warn!(error = %err, "error handling provider notification");
                }
            }
        });

        Ok(Self { manager, shutdown, pump: Some(pump) })
    }

    /// Drives a full gap-limit scan (spec §4.2 `syncAccount`).
    pub async fn sync_account(&self, reset: bool, restart: bool) -> Result<()> {
        self.manager.lock().await.sync_account(reset, restart).await
    }

    pub async fn get_balance(&self, address: Option<&str>) -> balance::TotalBalance {
        self.manager.lock().await.get_balance(address).await
    }

    pub async fn get_transactions(&self, limit: usize, offset: usize, reverse: bool) -> Vec<model::TxEntry> {
        self.manager.lock().await.get_transactions(limit, offset, reverse).await
    }

    pub async fn get_new_address(&self, chain: keys::Chain) -> Result<keys::DerivedAddress> {
        self.manager.lock().await.get_new_address(chain).await
    }

    pub async fn send(&self, req: SendRequest) -> Result<SendOutcome> {
        let mut manager = self.manager.lock().await;
        TxBuilder::send(&mut *manager, req).await
    }

    /// Cooperative pause (spec §4.2/§5 `pauseSync`).
    pub async fn pause_sync(&self) {
        self.manager.lock().await.pause_sync().await;
    }

    /// Stops the notification pump. The wallet's state remains usable for
    /// polling calls (`getBalance`, `getTransactions`) after this returns;
    /// only live updates stop.
    pub async fn shutdown(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(pump) = self.pump.take() {
            debug!("waiting for notification pump to stop");
            let _ = pump.await;
        }
    }
}

impl Drop for Wallet {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
