//! Minimal Ed25519 signing, used for sidecar name records.

use std::fmt;

use ring::signature::KeyPair as _;
use thiserror::Error;

use crate::hex;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ed25519 seed was rejected")]
    InvalidSeed,
    #[error("ed25519 signature verification failed")]
    BadSignature,
    #[error("ed25519 public key must be 32 bytes")]
    BadPublicKeyLength,
    #[error("ed25519 signature must be 64 bytes")]
    BadSignatureLength,
}

/// An Ed25519 signing keypair, deterministically built from a 32-byte seed.
pub struct KeyPair {
    inner: ring::signature::Ed25519KeyPair,
    public_key: PublicKey,
}

/// A 32-byte Ed25519 public key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PublicKey([u8; 32]);

/// A 64-byte Ed25519 signature.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature([u8; 64]);

impl KeyPair {
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, Error> {
        let inner = ring::signature::Ed25519KeyPair::from_seed_unchecked(seed)
            .map_err(|_| Error::InvalidSeed)?;
        let mut pk = [0u8; 32];
        pk.copy_from_slice(inner.public_key().as_ref());
        Ok(Self {
            inner,
            public_key: PublicKey(pk),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        let sig = self.inner.sign(msg);
        let mut out = [0u8; 64];
        out.copy_from_slice(sig.as_ref());
        Signature(out)
    }
}

impl PublicKey {
    pub const fn from_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, Error> {
        <[u8; 32]>::try_from(bytes)
            .map(Self)
            .map_err(|_| Error::BadPublicKeyLength)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_array(self) -> [u8; 32] {
        self.0
    }

    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), Error> {
        ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, &self.0)
            .verify(msg, &signature.0)
            .map_err(|_| Error::BadSignature)
    }
}

impl Signature {
    pub const fn from_array(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, Error> {
        <[u8; 64]>::try_from(bytes)
            .map(Self)
            .map_err(|_| Error::BadSignatureLength)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::display(&self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::display(&self.0))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public_key)
    }
}
