//! Signed mutable name records.
//!
//! A name record is the mutable pointer `{cid, sequence}` published under a
//! wallet's derived Ed25519 key. Readers verify the signature against the
//! name (which *is* the public key) and enforce sequence monotonicity, so a
//! relay or gateway can't roll a wallet back to an older snapshot.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sphere_common::{ed25519, hex};
use thiserror::Error;

use crate::cid::{base32_decode, base32_encode, Cid};

const NAME_RECORD_CONTEXT: &[u8] = b"sphere/name-record/v1";

/// A name in the sidecar namespace: the Ed25519 public key it is published
/// under, displayed like a cid (`k` prefix + lowercase base32).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IpnsName(ed25519::PublicKey);

#[derive(Debug, Error)]
pub enum NameError {
    #[error("ipns name must start with the 'k' prefix")]
    MissingPrefix,
    #[error("ipns name is not valid base32 of a public key")]
    BadEncoding,
    #[error("name record signature is invalid")]
    BadSignature,
}

impl IpnsName {
    pub fn from_public_key(public_key: ed25519::PublicKey) -> Self {
        Self(public_key)
    }

    pub fn public_key(&self) -> ed25519::PublicKey {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, NameError> {
        let encoded = s.strip_prefix('k').ok_or(NameError::MissingPrefix)?;
        let bytes = base32_decode(encoded).map_err(|_| NameError::BadEncoding)?;
        ed25519::PublicKey::try_from_slice(&bytes)
            .map(Self)
            .map_err(|_| NameError::BadEncoding)
    }
}

impl fmt::Display for IpnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", base32_encode(self.0.as_slice()))
    }
}

impl fmt::Debug for IpnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IpnsName({self})")
    }
}

impl Serialize for IpnsName {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IpnsName {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed `{cid, sequence}` pointer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignedNameRecord {
    pub name: IpnsName,
    pub cid: Cid,
    pub sequence: u64,
    /// Ed25519 signature, hex.
    pub signature: String,
}

impl SignedNameRecord {
    /// Sign a new record. The caller guarantees `keypair` matches `name`.
    pub fn sign(keypair: &ed25519::KeyPair, cid: Cid, sequence: u64) -> Self {
        let name = IpnsName::from_public_key(keypair.public_key());
        let message = Self::signing_message(&name, &cid, sequence);
        let signature = keypair.sign(&message);
        Self {
            name,
            cid,
            sequence,
            signature: hex::encode(signature.as_slice()),
        }
    }

    /// Verify the signature against the embedded name.
    pub fn verify(&self) -> Result<(), NameError> {
        let sig_bytes =
            hex::decode(&self.signature).map_err(|_| NameError::BadSignature)?;
        let signature = ed25519::Signature::try_from_slice(&sig_bytes)
            .map_err(|_| NameError::BadSignature)?;
        let message = Self::signing_message(&self.name, &self.cid, self.sequence);
        self.name
            .public_key()
            .verify(&message, &signature)
            .map_err(|_| NameError::BadSignature)
    }

    fn signing_message(name: &IpnsName, cid: &Cid, sequence: u64) -> Vec<u8> {
        let mut message = Vec::with_capacity(
            NAME_RECORD_CONTEXT.len() + 32 + 32 + 8,
        );
        message.extend_from_slice(NAME_RECORD_CONTEXT);
        message.extend_from_slice(name.public_key().as_slice());
        message.extend_from_slice(cid.as_slice());
        message.extend_from_slice(&sequence.to_le_bytes());
        message
    }
}
