//! Content identifiers.
//!
//! A [`Cid`] is the SHA-256 of the content bytes, displayed in lowercase
//! base32 (no padding) with the `b` multibase prefix, so ids are stable,
//! self-verifying, and paste-able.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sphere_common::sha256;
use thiserror::Error;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cid([u8; 32]);

#[derive(Debug, Error)]
pub enum ParseCidError {
    #[error("cid must start with the 'b' multibase prefix")]
    MissingPrefix,
    #[error("cid contains an invalid base32 character")]
    InvalidCharacter,
    #[error("cid has the wrong length")]
    BadLength,
}

impl Cid {
    /// The content id of `bytes`.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(sha256::digest(bytes).to_array())
    }

    pub const fn from_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Whether `bytes` hashes to this id.
    pub fn verifies(&self, bytes: &[u8]) -> bool {
        Self::digest(bytes) == *self
    }

    pub fn parse(s: &str) -> Result<Self, ParseCidError> {
        let encoded = s.strip_prefix('b').ok_or(ParseCidError::MissingPrefix)?;
        let bytes = base32_decode(encoded)?;
        <[u8; 32]>::try_from(bytes)
            .map(Self)
            .map_err(|_| ParseCidError::BadLength)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", base32_encode(&self.0))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// RFC 4648 base32, lowercase, no padding.
pub(crate) fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut acc = 0u64;
    let mut bits = 0u32;
    for &byte in bytes {
        acc = (acc << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = ((acc >> bits) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
    }
    if bits > 0 {
        let index = ((acc << (5 - bits)) & 0x1f) as usize;
        out.push(BASE32_ALPHABET[index] as char);
    }
    out
}

pub(crate) fn base32_decode(s: &str) -> Result<Vec<u8>, ParseCidError> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut acc = 0u64;
    let mut bits = 0u32;
    for c in s.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or(ParseCidError::InvalidCharacter)? as u64;
        acc = (acc << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use proptest::{collection::vec, prelude::*, proptest};

    use super::*;

    #[test]
    fn digest_is_deterministic_and_binding() {
        let a = Cid::digest(b"snapshot v1");
        let b = Cid::digest(b"snapshot v1");
        let c = Cid::digest(b"snapshot v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.verifies(b"snapshot v1"));
        assert!(!a.verifies(b"snapshot v2"));
    }

    #[test]
    fn display_parse_roundtrip() {
        proptest!(|(bytes in any::<[u8; 32]>())| {
            let cid = Cid::from_array(bytes);
            let parsed = Cid::parse(&cid.to_string()).unwrap();
            prop_assert_eq!(cid, parsed);
        });
    }

    #[test]
    fn base32_roundtrip() {
        proptest!(|(bytes in vec(any::<u8>(), 0..64))| {
            let encoded = base32_encode(&bytes);
            let decoded = base32_decode(&encoded).unwrap();
            prop_assert_eq!(bytes, decoded);
        });
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Cid::parse("no-prefix").is_err());
        assert!(Cid::parse("b0189").is_err()); // '0','1','8','9' not in alphabet
        assert!(Cid::parse("babc").is_err()); // wrong length
    }

    #[test]
    fn serde_roundtrip() {
        let cid = Cid::digest(b"hello");
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(serde_json::from_str::<Cid>(&json).unwrap(), cid);
    }
}
