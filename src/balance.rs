//! `TotalBalance`: the wallet-wide aggregate across the three lifecycle
//! states (spec §4, invariant 4: `TotalBalance.state = Σ over addresses
//! (address.out.state − address.in.state)` for each state).

use serde::{Deserialize, Serialize};

use crate::currency::Amount;
use crate::model::State;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TotalBalance {
    pub mempool: i64,
    pub pending: i64,
    pub confirmed: i64,
}

impl TotalBalance {
    pub const ZERO: Self = Self { mempool: 0, pending: 0, confirmed: 0 };

    pub fn get(&self, state: State) -> i64 {
        match state {
            State::Mempool => self.mempool,
            State::Pending => self.pending,
            State::Confirmed => self.confirmed,
        }
    }

    fn get_mut(&mut self, state: State) -> &mut i64 {
        match state {
            State::Mempool => &mut self.mempool,
            State::Pending => &mut self.pending,
            State::Confirmed => &mut self.confirmed,
        }
    }

    /// Credits `amount` to `state` (an `out` ledger entry was recorded).
    pub fn credit(&mut self, state: State, amount: Amount) {
        *self.get_mut(state) += amount.as_sat() as i64;
    }

    /// Debits `amount` from `state` (an `in` ledger entry, i.e. a spend, was
    /// recorded).
    pub fn debit(&mut self, state: State, amount: Amount) {
        *self.get_mut(state) -= amount.as_sat() as i64;
    }

    pub fn total(&self) -> i64 {
        self.mempool + self.pending + self.confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_and_debit_are_signed() {
        let mut balance = TotalBalance::ZERO;
        balance.credit(State::Confirmed, Amount::from_sat(100));
        balance.debit(State::Confirmed, Amount::from_sat(40));
        assert_eq!(balance.confirmed, 60);
    }

    #[test]
    fn states_are_independent() {
        let mut balance = TotalBalance::ZERO;
        balance.credit(State::Mempool, Amount::from_sat(10));
        balance.credit(State::Confirmed, Amount::from_sat(20));
        assert_eq!(balance.mempool, 10);
        assert_eq!(balance.pending, 0);
        assert_eq!(balance.confirmed, 20);
    }

    proptest::proptest! {
        /// Balance additivity (spec §8 property 2), checked at the
        /// aggregate level: crediting/debiting a state never leaks into
        /// the other two, and the running total always equals the sum of
        /// the signed deltas applied to that state.
        #[test]
        fn credit_debit_sequence_matches_running_sum(
            ops in proptest::collection::vec((0usize..3, 1i64..1_000_000, proptest::bool::ANY), 0..64),
        ) {
            let mut balance = TotalBalance::ZERO;
            let mut expect = [0i64; 3];
            for (state_idx, sat, is_credit) in ops {
                let state = State::ALL[state_idx];
                let amount = Amount::from_sat(sat as u64);
                if is_credit {
                    balance.credit(state, amount);
                    expect[state_idx] += sat;
                } else {
                    balance.debit(state, amount);
                    expect[state_idx] -= sat;
                }
            }
            for (idx, state) in State::ALL.iter().enumerate() {
                proptest::prop_assert_eq!(balance.get(*state), expect[idx]);
            }
            proptest::prop_assert_eq!(balance.total(), expect.iter().sum::<i64>());
        }
    }
}
