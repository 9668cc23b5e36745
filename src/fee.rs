//! vSize/fee estimation for P2WPKH-only transactions (spec §1: fee-rate
//! estimation itself is an external collaborator; what lives here is the
//! fixed per-input/per-output vsize model `UnspentStore` and `TxBuilder`
//! both need to stay in lockstep on, spec §4.3/§4.4).

/// Non-witness overhead: version (4) + segwit marker/flag (2, counted at
/// 1/4 weight) + locktime (4) + varint counts, rounded to whole vbytes.
const TX_OVERHEAD_VBYTES: f64 = 10.5;
/// A single P2WPKH input: outpoint (36) + empty scriptSig varint (1) +
/// sequence (4) = 41 base bytes, plus a 27-vbyte-equivalent witness
/// (signature + pubkey at 1/4 weight).
const INPUT_VBYTES: f64 = 68.0;
/// A single P2WPKH output: value (8) + scriptPubKey varint+22 bytes.
const OUTPUT_VBYTES: f64 = 31.0;

/// Estimated transaction virtual size for `n_inputs` P2WPKH inputs and
/// `n_outputs` P2WPKH outputs.
pub fn estimate_vsize(n_inputs: usize, n_outputs: usize) -> u64 {
    let vsize = TX_OVERHEAD_VBYTES + INPUT_VBYTES * n_inputs as f64 + OUTPUT_VBYTES * n_outputs as f64;
    vsize.ceil() as u64
}

/// Fee in satoshis for `n_inputs`/`n_outputs` at `fee_rate` sat/vbyte,
/// rounded up (spec §4.4 step 5: `fee = ceil(vSize * fee_rate)`).
pub fn estimate_fee(n_inputs: usize, n_outputs: usize, fee_rate: f64) -> u64 {
    (estimate_vsize(n_inputs, n_outputs) as f64 * fee_rate).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsize_grows_linearly_with_inputs_and_outputs() {
        let one_in_two_out = estimate_vsize(1, 2);
        let two_in_two_out = estimate_vsize(2, 2);
        assert_eq!(two_in_two_out - one_in_two_out, INPUT_VBYTES as u64);
    }

    #[test]
    fn fee_rounds_up() {
        // vsize(1,2) = ceil(10.5 + 68 + 62) = 141
        assert_eq!(estimate_vsize(1, 2), 141);
        assert_eq!(estimate_fee(1, 2, 1.0), 141);
        assert_eq!(estimate_fee(1, 2, 10.0), 1410);
    }
}
