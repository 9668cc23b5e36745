//! Fixed-point satoshi amounts with BTC/sat unit tags.
//!
//! All internal arithmetic happens in base units (satoshis). Conversion from
//! base to main (BTC) units for display is exact (integer division plus
//! zero-padded remainder). Conversion from a caller-supplied decimal amount
//! goes through `bitcoin::Amount`'s own string parser rather than a float,
//! so a fractional main-unit amount like `"0.02"` converts losslessly.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use bitcoin::amount::ParseAmountError;
use bitcoin::Denomination;
use serde::{Deserialize, Serialize};

/// Number of satoshis in one bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// The unit an amount was expressed in at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Bitcoin (1 main = 1e8 base).
    Main,
    /// Satoshi.
    Base,
}

/// A non-negative amount of satoshis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    /// Construct an amount directly from a satoshi count.
    pub const fn from_sat(sat: u64) -> Self {
        Self(sat)
    }

    /// Construct an amount from a whole-bitcoin count, for convenience in
    /// tests and fixtures. Fractional BTC must go through [`Amount::from_sat`]
    /// with a pre-parsed satoshi value to stay lossless.
    pub const fn from_btc(btc: u64) -> Self {
        Self(btc * SATS_PER_BTC)
    }

    /// The amount as a satoshi count.
    pub const fn as_sat(self) -> u64 {
        self.0
    }

    /// Render as a BTC-denominated decimal string, e.g. `"0.20000000"`.
    pub fn to_btc_string(self) -> String {
        let whole = self.0 / SATS_PER_BTC;
        let frac = self.0 % SATS_PER_BTC;
        format!("{whole}.{frac:08}")
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// Parse a caller-supplied decimal amount in the given unit (spec §6
    /// `send({amount, unit})`). `"0.02"` in [`Unit::Main`] and `"2000000"` in
    /// [`Unit::Base`] both yield the same satoshi count; parsing goes through
    /// `bitcoin::Amount`'s decimal parser instead of a float so fractional
    /// main-unit amounts (e.g. scenario S3's "0.02 main") stay exact.
    pub fn from_unit(value: &str, unit: Unit) -> std::result::Result<Self, ParseAmountError> {
        let denom = match unit {
            Unit::Base => Denomination::Satoshi,
            Unit::Main => Denomination::Bitcoin,
        };
        bitcoin::Amount::from_str_in(value, denom).map(|amount| Self(amount.to_sat()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}
