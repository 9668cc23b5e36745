//! Builds, signs, and broadcasts a single-destination P2WPKH send (spec
//! §4.4 `send`). UTXO selection is delegated to [`UnspentStore`] via
//! [`SyncManager::utxo_for_amount`]; this module only assembles and signs
//! the transaction and forwards it to the provider.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use secp256k1::Message;

use crate::config::{DEFAULT_FEE_RATE, DUST_SAT};
use crate::currency::{Amount, Unit};
use crate::error::{Error, Result};
use crate::fee::estimate_fee;
use crate::keys::{Chain, KeyDeriver};
use crate::sync::SyncManager;

/// `send` request parameters (spec §4.4).
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub address: String,
    /// A decimal amount in `unit` (e.g. `"0.02"` for `Unit::Main`, `"2000000"`
    /// for `Unit::Base`). Parsed via [`Amount::from_unit`], which keeps
    /// fractional main-unit amounts exact instead of routing through a float.
    pub amount: String,
    pub unit: Unit,
    pub fee_rate: Option<f64>,
    /// Take the fee out of `amount` instead of adding it on top.
    pub deduct_fee: bool,
}

/// The record returned by a successful `send` (spec §4.4 output shape).
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub txid: Txid,
    pub hex: String,
    pub v_size: u64,
    pub fee_rate: f64,
    pub fee: Amount,
    pub utxo: Vec<OutPoint>,
    pub vout: u32,
    pub change_address: Option<String>,
    pub total_spent: Amount,
    pub is_valid: bool,
    pub to_addresses: Vec<String>,
    pub from_addresses: Vec<String>,
    pub amount: Amount,
}

/// Parses and validates `addr` against `network` entirely locally, without
/// any provider round-trip (spec §9 REDESIGN FLAG "isValidAddress": the
/// source asked a remote node, which is both slower and an unnecessary
/// trust dependency since address validity is a pure function of the
/// string and the network).
pub fn validate_address(addr: &str, network: Network) -> Result<Address> {
    use std::str::FromStr;
    Address::from_str(addr)
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?
        .require_network(network)
        .map_err(|_| Error::InvalidAddress(addr.to_string()))
}

/// Builds, signs, and broadcasts sends against a [`SyncManager`] (spec
/// §4.4). Stateless: every call re-reads `manager`'s current UTXO set and
/// config, so a single instance can be shared across concurrent sends (the
/// reservation lock in `UnspentStore` is what actually prevents double-spend
/// races between them).
pub struct TxBuilder;

impl TxBuilder {
    /// Reserves inputs, builds a single-destination P2WPKH transaction,
    /// signs every input, and broadcasts it. On broadcast failure the
    /// reservation is released so the UTXOs become selectable again (spec
    /// §7 "Shared-resource policy").
    pub async fn send(manager: &mut SyncManager, req: SendRequest) -> Result<SendOutcome> {
        let network = manager.config().network;
        let dest_address = validate_address(&req.address, network)?;
        let dest_script = dest_address.script_pubkey();

        let fee_rate = req.fee_rate.or(manager.config().fee_rate).unwrap_or(DEFAULT_FEE_RATE);
        let requested = Amount::from_unit(&req.amount, req.unit)?;

        let reservation = manager.utxo_for_amount(requested, fee_rate).await?;
        let n_inputs = reservation.utxos.len();

        let fee_with_change = Amount::from_sat(estimate_fee(n_inputs, 2, fee_rate));
        let dest_amount = if req.deduct_fee {
            requested
                .checked_sub(fee_with_change)
                .ok_or(Error::DustOutput { value: requested.as_sat(), dust: DUST_SAT })?
        } else {
            requested
        };
        let spent_without_fee =
            if req.deduct_fee { requested } else { requested.checked_add(fee_with_change).ok_or(Error::InsufficientFunds)? };
        let prospective_change = reservation.total.checked_sub(spent_without_fee).unwrap_or(Amount::ZERO);

        let has_change = prospective_change.as_sat() >= DUST_SAT;
        let (change_amount, fee) = if has_change {
            (prospective_change, fee_with_change)
        } else {
            let fee = reservation.total.checked_sub(dest_amount).ok_or(Error::InsufficientFunds)?;
            (Amount::ZERO, fee)
        };

        if dest_amount.as_sat() < DUST_SAT {
            manager.unspent_store().unlock(&reservation).await;
            return Err(Error::DustOutput { value: dest_amount.as_sat(), dust: DUST_SAT });
        }

        let change_address = if has_change {
            match manager.get_new_address(Chain::Internal).await {
                Ok(derived) => Some(derived),
                Err(err) => {
                    manager.unspent_store().unlock(&reservation).await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut outputs = vec![TxOut {
            value: bitcoin::Amount::from_sat(dest_amount.as_sat()),
            script_pubkey: dest_script.clone(),
        }];
        if let Some(change) = &change_address {
            outputs.push(TxOut {
                value: bitcoin::Amount::from_sat(change_amount.as_sat()),
                script_pubkey: change.script_pubkey.clone(),
            });
        }

        let inputs: Vec<TxIn> = reservation
            .utxos
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let mut tx =
            Transaction { version: Version::TWO, lock_time: LockTime::ZERO, input: inputs, output: outputs };

        if let Err(err) = sign_inputs(&mut tx, manager.deriver(), &reservation.utxos) {
            manager.unspent_store().unlock(&reservation).await;
            return Err(err);
        }

        let txid = match manager.provider().transaction_broadcast(&tx).await {
            Ok(txid) => txid,
            Err(err) => {
                manager.unspent_store().unlock(&reservation).await;
                return Err(err);
            }
        };

        manager.watch_tx_mempool(txid);

        let from_addresses = reservation.utxos.iter().map(|u| u.address.clone()).collect();
        let to_addresses = vec![dest_address.to_string()];
        let utxo: Vec<OutPoint> = reservation.utxos.iter().map(|u| u.outpoint).collect();
        let v_size = tx.vsize() as u64;

        Ok(SendOutcome {
            txid,
            hex: bitcoin::consensus::encode::serialize_hex(&tx),
            v_size,
            fee_rate,
            fee,
            utxo,
            vout: 0,
            change_address: change_address.map(|c| c.address.to_string()),
            total_spent: dest_amount + fee,
            is_valid: true,
            to_addresses,
            from_addresses,
            amount: dest_amount,
        })
    }
}

fn sign_inputs(tx: &mut Transaction, deriver: &KeyDeriver, utxos: &[crate::unspent_store::Utxo]) -> Result<()> {
    let secp = secp256k1::Secp256k1::signing_only();
    let values: Vec<bitcoin::Amount> = utxos.iter().map(|u| bitcoin::Amount::from_sat(u.value.as_sat())).collect();

    let mut witnesses = Vec::with_capacity(utxos.len());
    for (i, utxo) in utxos.iter().enumerate() {
        let script_pubkey = ScriptBuf::new_p2wpkh(&utxo.public_key.wpubkey_hash());
        let cache = SighashCache::new(&*tx);
        let sighash = cache
            .p2wpkh_signature_hash(i, &script_pubkey, values[i], EcdsaSighashType::All)
            .map_err(|e| Error::Sighash(e.to_string()))?;

        let private_key = deriver.derive_private_key(utxo.path)?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = secp.sign_ecdsa(&message, &private_key.inner);
        let btc_signature = bitcoin::ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All };

        witnesses.push(Witness::p2wpkh(&btc_signature, &utxo.public_key));
    }
    for (input, witness) in tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletConfig;
    use crate::provider::mock::MockProvider;
    use crate::provider::{ProviderTx, ProviderTxOutput};
    use crate::storage::MemoryStore;
    use crate::sync::NoopEvents;
    use bitcoin::bip32::Xpriv;
    use bitcoin::hex::FromHex as _;
    use std::sync::Arc;

    const TEST_SEED_HEX: &str = "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e";

    fn test_deriver() -> KeyDeriver {
        let seed = Vec::from_hex(TEST_SEED_HEX).unwrap();
        let master = Xpriv::new_master(Network::Bitcoin, &seed).unwrap();
        KeyDeriver::new(master, Network::Bitcoin)
    }

    fn test_config() -> WalletConfig {
        let mut cfg = WalletConfig::new(Network::Bitcoin, Unit::Base);
        cfg.gap_limit = 3;
        cfg.fee_rate = Some(10.0);
        cfg
    }

    #[test]
    fn rejects_address_on_wrong_network() {
        let err = validate_address("bcrt1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Bitcoin).unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[test]
    fn accepts_matching_mainnet_address() {
        validate_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Bitcoin).unwrap();
    }

    #[tokio::test]
    async fn send_spends_confirmed_utxo_and_broadcasts() {
        let provider = Arc::new(MockProvider::new());
        let deriver = test_deriver();
        let ext0 = deriver.derive_address(crate::keys::HdPath::new(0, Chain::External, 0)).unwrap();

        let txid = Txid::from_byte_array([9u8; 32]);
        provider.add_tx(
            &ext0.script_hash,
            ProviderTx {
                txid,
                height: 1,
                inputs: vec![],
                outputs: vec![ProviderTxOutput { vout: 0, value: 10_000_000, address: Some(ext0.address.to_string()) }],
            },
        );
        provider.mine();

        let mut manager =
            SyncManager::open(test_config(), deriver, provider.clone(), MemoryStore::new(), Arc::new(NoopEvents))
                .await
                .unwrap();
        manager.sync_account(false, false).await.unwrap();
        provider.mine();
        manager.on_new_block(2).await.unwrap();
        assert_eq!(manager.get_balance(None).await.confirmed, 10_000_000);

        let outcome = TxBuilder::send(
            &mut manager,
            SendRequest {
                address: "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g".to_string(),
                amount: "1000000".to_string(),
                unit: Unit::Base,
                fee_rate: None,
                deduct_fee: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.amount, Amount::from_sat(1_000_000));
        assert!(outcome.change_address.is_some());
        assert_eq!(provider.broadcasted().len(), 1);
        assert_eq!(provider.broadcasted()[0].compute_txid(), outcome.txid);
    }

    #[tokio::test]
    async fn insufficient_funds_is_reported_without_reserving() {
        let provider = Arc::new(MockProvider::new());
        let deriver = test_deriver();
        let mut manager =
            SyncManager::open(test_config(), deriver, provider, MemoryStore::new(), Arc::new(NoopEvents))
                .await
                .unwrap();

        let err = TxBuilder::send(
            &mut manager,
            SendRequest {
                address: "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g".to_string(),
                amount: "1000000".to_string(),
                unit: Unit::Base,
                fee_rate: None,
                deduct_fee: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
    }
}
