//! Fixed-point quantities used across the ledger, the custodian and the orchestrator.
//!
//! Every amount carries 18 fractional digits and is stored as a raw `u128`.
//! Products of two fixed-point values are computed in 256 bits so that
//! `collateral * rate` cannot silently wrap before being scaled back down.

use candid::CandidType;
use ethnum::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fractional digits carried by every amount.
pub const DECIMALS: u32 = 18;

/// One whole unit in raw representation.
pub const WAD: u128 = 1_000_000_000_000_000_000;

const WAD_U64: u64 = 1_000_000_000_000_000_000;

macro_rules! fixed_point {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u128);

        impl $name {
            pub const ZERO: Self = Self(0);

            pub const fn new(raw: u128) -> Self {
                Self(raw)
            }

            /// `whole * 10^18` raw units. Only meant for literal values.
            pub const fn from_units(whole: u128) -> Self {
                Self(whole * WAD)
            }

            pub const fn to_raw(self) -> u128 {
                self.0
            }

            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }

            pub fn checked_add(self, other: Self) -> Option<Self> {
                self.0.checked_add(other.0).map(Self)
            }

            pub fn checked_sub(self, other: Self) -> Option<Self> {
                self.0.checked_sub(other.0).map(Self)
            }

            pub fn saturating_add(self, other: Self) -> Self {
                Self(self.0.saturating_add(other.0))
            }

            pub fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0))
            }

            /// Exact decimal conversion, truncating digits beyond the 18th.
            /// Returns `None` for negative or oversized values.
            pub fn from_decimal(value: Decimal) -> Option<Self> {
                decimal_to_raw(value).map(Self)
            }

            pub fn to_decimal(self) -> Option<Decimal> {
                let raw = i128::try_from(self.0).ok()?;
                Decimal::try_from_i128_with_scale(raw, DECIMALS).ok()
            }
        }

        impl From<u128> for $name {
            fn from(raw: u128) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.to_decimal() {
                    Some(value) => write!(f, "{}", value.normalize()),
                    None => write!(f, "{}e-18", self.0),
                }
            }
        }
    };
}

fixed_point!(
    /// Quantity of the base asset held as collateral.
    Collateral
);

fixed_point!(
    /// Quantity of the stable credit token.
    Credit
);

fixed_point!(
    /// Credit units paid out per one whole collateral unit.
    Rate
);

fixed_point!(
    /// Dimensionless ratio, e.g. a health factor or a liquidation threshold.
    Ratio
);

impl Ratio {
    /// Sentinel returned for positions without debt; above any threshold.
    pub const MAX: Ratio = Ratio(u128::MAX);
}

impl Collateral {
    /// Credit value of this collateral at `rate`, truncated toward zero.
    pub fn checked_mul_rate(self, rate: Rate) -> Option<Credit> {
        mul_div(self.0, rate.0, WAD).map(Credit)
    }
}

impl Credit {
    /// Collateral covered by this much credit at `rate`, truncated toward zero.
    pub fn checked_div_rate(self, rate: Rate) -> Option<Collateral> {
        mul_div(self.0, WAD, rate.0).map(Collateral)
    }
}

/// `(collateral * rate) / debt` as a ratio. Zero debt yields [`Ratio::MAX`],
/// and so does a ratio too large to represent.
pub fn health_ratio(collateral: Collateral, rate: Rate, debt: Credit) -> Ratio {
    if debt.is_zero() {
        return Ratio::MAX;
    }
    mul_div(collateral.0, rate.0, debt.0)
        .map(Ratio)
        .unwrap_or(Ratio::MAX)
}

fn mul_div(a: u128, b: u128, denominator: u128) -> Option<u128> {
    if denominator == 0 {
        return None;
    }
    let quotient = U256::from(a) * U256::from(b) / U256::from(denominator);
    if quotient > U256::from(u128::MAX) {
        return None;
    }
    Some(quotient.as_u128())
}

fn decimal_to_raw(value: Decimal) -> Option<u128> {
    if value.is_sign_negative() {
        return None;
    }
    let scaled = value.checked_mul(Decimal::from(WAD_U64))?.trunc();
    let mut raw = u128::try_from(scaled.mantissa()).ok()?;
    for _ in 0..scaled.scale() {
        raw /= 10;
    }
    Some(raw)
}
