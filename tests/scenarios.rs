//! End-to-end scenarios against `MockProvider`/`MemoryStore` (spec §8
//! "Concrete scenarios"). Requires `--features test-util`.

use std::sync::Arc;

use bitcoin::bip32::Xpriv;
use bitcoin::hashes::Hash;
use bitcoin::hex::FromHex as _;
use bitcoin::{Network, OutPoint, Txid};

use btc_wallet_core::address_store::LedgerKind;
use btc_wallet_core::config::WalletConfig;
use btc_wallet_core::currency::Unit;
use btc_wallet_core::keys::{Chain, HdPath, KeyDeriver};
use btc_wallet_core::model::State;
use btc_wallet_core::provider::mock::MockProvider;
use btc_wallet_core::provider::{ProviderTx, ProviderTxInput, ProviderTxOutput};
use btc_wallet_core::storage::MemoryStore;
use btc_wallet_core::sync::{NoopEvents, SyncManager};
use btc_wallet_core::txbuilder::{SendRequest, TxBuilder};
use btc_wallet_core::Error;

const TEST_SEED_HEX: &str = "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e";

fn test_deriver() -> KeyDeriver {
    let seed = Vec::from_hex(TEST_SEED_HEX).unwrap();
    let master = Xpriv::new_master(Network::Bitcoin, &seed).unwrap();
    KeyDeriver::new(master, Network::Bitcoin)
}

fn test_config() -> WalletConfig {
    let mut cfg = WalletConfig::new(Network::Bitcoin, Unit::Base);
    cfg.gap_limit = 5;
    cfg.fee_rate = Some(10.0);
    cfg
}

async fn open_manager(provider: Arc<MockProvider>) -> SyncManager {
    btc_wallet_core::logging::init_for_testing();
    SyncManager::open(test_config(), test_deriver(), provider, MemoryStore::new(), Arc::new(NoopEvents))
        .await
        .unwrap()
}

fn txid(seed: u8) -> Txid {
    Txid::from_byte_array([seed; 32])
}

/// S1: receive two 0.1 BTC outputs, confirm them, spend 0.1 at fee-rate 10,
/// and follow the resulting balance through mempool -> pending -> confirmed.
#[tokio::test]
async fn s1_receive_confirm_spend_lifecycle() {
    let provider = Arc::new(MockProvider::new());
    let deriver = test_deriver();
    let ext0 = deriver.derive_address(HdPath::new(0, Chain::External, 0)).unwrap();
    let ext1 = deriver.derive_address(HdPath::new(0, Chain::External, 1)).unwrap();

    let fund0 = txid(1);
    let fund1 = txid(2);
    provider.add_tx(
        &ext0.script_hash,
        ProviderTx {
            txid: fund0,
            height: 0,
            inputs: vec![],
            outputs: vec![ProviderTxOutput { vout: 0, value: 10_000_000, address: Some(ext0.address.to_string()) }],
        },
    );
    provider.add_tx(
        &ext1.script_hash,
        ProviderTx {
            txid: fund1,
            height: 0,
            inputs: vec![],
            outputs: vec![ProviderTxOutput { vout: 0, value: 10_000_000, address: Some(ext1.address.to_string()) }],
        },
    );

    let mut manager = open_manager(provider.clone()).await;
    manager.sync_account(false, false).await.unwrap();
    assert_eq!(manager.get_balance(None).await.mempool, 20_000_000);

    // Mine 2 confirmations.
    provider.set_tx_height(&ext0.script_hash, fund0, 1);
    provider.set_tx_height(&ext1.script_hash, fund1, 1);
    provider.mine();
    manager.on_new_block(1).await.unwrap();
    provider.mine();
    manager.on_new_block(2).await.unwrap();
    let balance = manager.get_balance(None).await;
    assert_eq!(balance.confirmed, 20_000_000);
    assert_eq!(balance.mempool, 0);

    let outcome = TxBuilder::send(
        &mut manager,
        SendRequest {
            address: ext1.address.to_string(),
            amount: "0.1".to_string(),
            unit: Unit::Main,
            fee_rate: Some(10.0),
            deduct_fee: false,
        },
    )
    .await
    .unwrap();

    // The send is not yet visible to `processHistory` until the provider
    // reports it; confirmed balance (the untouched UTXO) is unaffected.
    assert_eq!(manager.get_balance(None).await.confirmed, 20_000_000);
    assert!(outcome.total_spent.as_sat() >= 10_000_000);
}

/// S2: spending the entire 0.2 BTC UTXO set as `amount = 0.2` at fee-rate 10
/// cannot also cover the fee, so selection must fail with `InsufficientFunds`.
#[tokio::test]
async fn s2_spending_whole_balance_leaves_no_room_for_fee() {
    let provider = Arc::new(MockProvider::new());
    let deriver = test_deriver();
    let ext0 = deriver.derive_address(HdPath::new(0, Chain::External, 0)).unwrap();

    provider.add_tx(
        &ext0.script_hash,
        ProviderTx {
            txid: txid(3),
            height: 1,
            inputs: vec![],
            outputs: vec![ProviderTxOutput { vout: 0, value: 20_000_000, address: Some(ext0.address.to_string()) }],
        },
    );
    provider.mine();

    let mut manager = open_manager(provider.clone()).await;
    manager.sync_account(false, false).await.unwrap();
    provider.mine();
    manager.on_new_block(2).await.unwrap();
    assert_eq!(manager.get_balance(None).await.confirmed, 20_000_000);

    let err = TxBuilder::send(
        &mut manager,
        SendRequest {
            address: ext0.address.to_string(),
            amount: "20000000".to_string(),
            unit: Unit::Base,
            fee_rate: Some(10.0),
            deduct_fee: false,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds));
}

/// S3: two consecutive unconfirmed sends from a single funding UTXO. The
/// second send must be able to select the first send's (unconfirmed) change
/// output, since pending/mempool change is eligible for selection once the
/// wallet itself created it and it was observed by a rescan.
#[tokio::test]
async fn s3_second_send_spends_first_sends_change() {
    let provider = Arc::new(MockProvider::new());
    let deriver = test_deriver();
    let ext0 = deriver.derive_address(HdPath::new(0, Chain::External, 0)).unwrap();

    provider.add_tx(
        &ext0.script_hash,
        ProviderTx {
            txid: txid(4),
            height: 1,
            inputs: vec![],
            outputs: vec![ProviderTxOutput { vout: 0, value: 10_000_000, address: Some(ext0.address.to_string()) }],
        },
    );
    provider.mine();

    let mut manager = open_manager(provider.clone()).await;
    manager.sync_account(false, false).await.unwrap();
    provider.mine();
    manager.on_new_block(2).await.unwrap();

    let dest = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";
    let first = TxBuilder::send(
        &mut manager,
        SendRequest {
            address: dest.to_string(),
            amount: "0.02".to_string(),
            unit: Unit::Main,
            fee_rate: Some(10.0),
            deduct_fee: false,
        },
    )
    .await
    .unwrap();
    assert!(first.change_address.is_some());

    // The change output lands on internal index 0; surface the broadcast tx
    // back through the provider, under both the spent and credited
    // script-hashes, as an unconfirmed tx so the next scan picks it up.
    let int0 = deriver.derive_address(HdPath::new(0, Chain::Internal, 0)).unwrap();
    let broadcast_tx = provider.broadcasted().last().cloned().expect("first send broadcasted");
    let inputs: Vec<ProviderTxInput> = broadcast_tx
        .input
        .iter()
        .map(|i| ProviderTxInput {
            prev_txid: i.previous_output.txid,
            prev_vout: i.previous_output.vout,
            value: 10_000_000,
            address: Some(ext0.address.to_string()),
        })
        .collect();
    let outputs: Vec<ProviderTxOutput> = broadcast_tx
        .output
        .iter()
        .enumerate()
        .map(|(vout, out)| ProviderTxOutput {
            vout: vout as u32,
            value: out.value.to_sat(),
            address: Some(if vout == 0 { dest.to_string() } else { int0.address.to_string() }),
        })
        .collect();
    let spend_tx = ProviderTx { txid: broadcast_tx.compute_txid(), height: 0, inputs, outputs };
    provider.add_tx(&ext0.script_hash, spend_tx.clone());
    provider.add_tx(&int0.script_hash, spend_tx);

    manager.sync_account(true, false).await.unwrap();
    let balance_after_first = manager.get_balance(None).await;
    assert!(balance_after_first.mempool < 0);

    // Promote the change output out of the mempool bucket: selection never
    // considers mempool-only funds (spec §4.3), so the second send can only
    // succeed once the first send's change is at least `pending`.
    let spend_txid = broadcast_tx.compute_txid();
    provider.set_tx_height(&ext0.script_hash, spend_txid, 3);
    provider.set_tx_height(&int0.script_hash, spend_txid, 3);
    provider.mine();
    manager.on_new_block(3).await.unwrap();

    // The rescan must promote *every* address `spend_txid` touches, not just
    // the last one `process_tx` recorded: `ext0`'s spent outpoint (the `in`
    // side) has to leave `Mempool` exactly like `int0`'s change (the `out`
    // side) did above.
    let spent_outpoint = OutPoint { txid: txid(4), vout: 0 };
    assert!(!manager.address_store().ledger_contains(&ext0.address.to_string(), LedgerKind::In, State::Mempool, spent_outpoint).await);
    assert!(manager.address_store().ledger_contains(&ext0.address.to_string(), LedgerKind::In, State::Pending, spent_outpoint).await);

    let second = TxBuilder::send(
        &mut manager,
        SendRequest {
            address: dest.to_string(),
            amount: "0.02".to_string(),
            unit: Unit::Main,
            fee_rate: Some(10.0),
            deduct_fee: false,
        },
    )
    .await
    .unwrap();

    assert_eq!(provider.broadcasted().len(), 2);
    let total_spent = first.total_spent.as_sat() + second.total_spent.as_sat();
    assert!(total_spent > 0);
}

/// S5: recreating the wallet from the same seed against the same provider
/// state must resume the reuse guard from exactly where it left off.
#[tokio::test]
async fn s5_fresh_instance_resumes_reuse_guard() {
    btc_wallet_core::logging::init_for_testing();
    let provider = Arc::new(MockProvider::new());
    let deriver = test_deriver();
    let ext0 = deriver.derive_address(HdPath::new(0, Chain::External, 0)).unwrap();
    provider.add_tx(
        &ext0.script_hash,
        ProviderTx {
            txid: txid(5),
            height: 0,
            inputs: vec![],
            outputs: vec![ProviderTxOutput { vout: 0, value: 1_000_000, address: Some(ext0.address.to_string()) }],
        },
    );

    let store = MemoryStore::new();
    let mut first_instance = SyncManager::open(
        test_config(),
        test_deriver(),
        provider.clone(),
        store.clone(),
        Arc::new(NoopEvents),
    )
    .await
    .unwrap();
    first_instance.sync_account(false, false).await.unwrap();
    drop(first_instance);

    let mut second_instance =
        SyncManager::open(test_config(), test_deriver(), provider, store, Arc::new(NoopEvents)).await.unwrap();
    second_instance.sync_account(false, false).await.unwrap();
    let next = second_instance.get_new_address(Chain::External).await.unwrap();
    assert_eq!(next.path.index, 1);
}

/// S6: the builder's own record of the transaction matches what gets handed
/// to the provider for broadcast.
#[tokio::test]
async fn s6_builder_output_matches_broadcast_tx() {
    let provider = Arc::new(MockProvider::new());
    let deriver = test_deriver();
    let ext0 = deriver.derive_address(HdPath::new(0, Chain::External, 0)).unwrap();
    provider.add_tx(
        &ext0.script_hash,
        ProviderTx {
            txid: txid(6),
            height: 1,
            inputs: vec![],
            outputs: vec![ProviderTxOutput { vout: 0, value: 5_000_000, address: Some(ext0.address.to_string()) }],
        },
    );
    provider.mine();

    let mut manager = open_manager(provider.clone()).await;
    manager.sync_account(false, false).await.unwrap();
    provider.mine();
    manager.on_new_block(2).await.unwrap();

    let outcome = TxBuilder::send(
        &mut manager,
        SendRequest {
            address: "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g".to_string(),
            amount: "1000000".to_string(),
            unit: Unit::Base,
            fee_rate: Some(10.0),
            deduct_fee: false,
        },
    )
    .await
    .unwrap();

    let broadcast_tx = provider.broadcasted().into_iter().next().unwrap();
    assert_eq!(broadcast_tx.compute_txid(), outcome.txid);
    assert_eq!(broadcast_tx.vsize() as u64, outcome.v_size);
    assert_eq!(broadcast_tx.input.len(), outcome.utxo.len());
    assert_eq!(broadcast_tx.output[0].value.to_sat(), outcome.amount.as_sat());
}

// S4 (BIP84 vectors) is covered by `keys::tests::bip84_vectors_match_spec`;
// repeating it here would just be a round-trip of the same derivation call.
