//! Token amounts.
//!
//! Token amounts on the ledger are unsigned big integers; JSON carries them
//! as decimal strings so consumers without 128-bit ints don't truncate them.

use std::{fmt, iter::Sum, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// An amount of some token, in that token's base units.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Amount(u128);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ParseAmountError {
    #[error("amount is not a valid decimal integer")]
    Invalid,
    #[error("amount overflows u128")]
    Overflow,
}

impl Amount {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u128::MAX);

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn to_u128(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Best-effort conversion for fiat display math. Lossy above 2^53.
    pub fn to_f64(self) -> f64 {
        self.0 as f64
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError::Invalid);
        }
        u128::from_str(s)
            .map(Self)
            .map_err(|_| ParseAmountError::Overflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc.saturating_add(x))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl de::Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal string or unsigned integer amount")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                Amount::from_str(v).map_err(de::Error::custom)
            }

            // Tolerate plain JSON numbers from older snapshots.
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from_u128(u128::from(v)))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{any, Arbitrary},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            any::<u128>().prop_map(Amount::from_u128).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::{prelude::*, proptest};

    use super::*;

    #[test]
    fn serde_is_decimal_string() {
        let amount = Amount::from_u128(340_282_366_920_938_463_463);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"340282366920938463463\"");
        assert_eq!(serde_json::from_str::<Amount>(&json).unwrap(), amount);
    }

    #[test]
    fn deserialize_accepts_bare_numbers() {
        assert_eq!(
            serde_json::from_str::<Amount>("5000000").unwrap(),
            Amount::from_u128(5_000_000),
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(Amount::from_str("").is_err());
        assert!(Amount::from_str("-1").is_err());
        assert!(Amount::from_str("1.5").is_err());
        assert!(Amount::from_str("0x10").is_err());
    }

    #[test]
    fn string_roundtrip() {
        proptest!(|(amount: Amount)| {
            prop_assert_eq!(Amount::from_str(&amount.to_string()).unwrap(), amount);
        });
    }
}
