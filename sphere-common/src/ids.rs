//! Identifier newtypes used across the wallet.
//!
//! All of these are fixed-size byte strings with lowercase-hex serde forms.
//! [`LocalTokenId`] is a *wallet-local* primary key: two live records may
//! transiently share a [`TokenId`] during a split, but never a
//! [`LocalTokenId`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{hex, rng::RngCore, sha256};

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LENGTH: usize = $len;

            pub const fn from_array(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::DecodeError> {
                hex::decode_array(s).map(Self)
            }

            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::display(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::display(&self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(&self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// 32-byte opaque asset identifier.
    CoinId,
    32
);

hex_id!(
    /// The external (on-ledger) token identifier carried in a token's genesis.
    TokenId,
    32
);

hex_id!(
    /// Wallet-local primary key for a token record. Stable for the life of the
    /// record.
    LocalTokenId,
    16
);

hex_id!(
    /// Hash of a token state; the unit the aggregator commits.
    StateHash,
    32
);

hex_id!(
    /// The aggregator's lookup key: `sha256(pubkey_bytes || state_hash_bytes)`.
    RequestId,
    32
);

hex_id!(
    /// Correlates the events of one transfer end-to-end; the receive-side
    /// idempotency key together with the sender pubkey.
    TransferId,
    16
);

impl LocalTokenId {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl TransferId {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl From<sha256::Hash> for StateHash {
    fn from(hash: sha256::Hash) -> Self {
        Self(hash.to_array())
    }
}

impl RequestId {
    /// `RequestId = sha256(pubkey_bytes || state_hash_bytes)`.
    pub fn compute(pubkey: &[u8], state_hash: &StateHash) -> Self {
        Self(sha256::digest_many(&[pubkey, state_hash.as_slice()]).to_array())
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{any, Arbitrary},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    macro_rules! arb_id {
        ($name:ident, $len:literal) => {
            impl Arbitrary for $name {
                type Parameters = ();
                type Strategy = BoxedStrategy<Self>;
                fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                    any::<[u8; $len]>().prop_map($name::from_array).boxed()
                }
            }
        };
    }

    arb_id!(CoinId, 32);
    arb_id!(TokenId, 32);
    arb_id!(LocalTokenId, 16);
    arb_id!(StateHash, 32);
    arb_id!(TransferId, 16);
}
