//! AES-256-GCM sealing for blobs at rest and transport payloads.
//!
//! The long-term master key never encrypts data directly. Each seal samples a
//! random 32-byte key id and derives a single-use AEAD key from it via HKDF
//! (the "derive key mode" construction). Single-use keys let us fix the nonce
//! to all zeroes: the key id carries the uniqueness.
//!
//! Wire layout: `version(1) || key_id(32) || ciphertext || tag(16)`.

use ring::aead;
use thiserror::Error;

use crate::{rng::Crng, root_seed};

const VERSION: u8 = 0;
const VERSION_LEN: usize = 1;
const KEY_ID_LEN: usize = 32;
const TAG_LEN: usize = 16;
const OVERHEAD_LEN: usize = VERSION_LEN + KEY_ID_LEN + TAG_LEN;

const KEY_DERIVE_SALT: &[u8] = b"SPHERE-HASH-REALM::SealKey";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealed blob is too short to contain header and tag")]
    TooShort,
    #[error("unknown seal format version: {0}")]
    UnknownVersion(u8),
    #[error("decryption failed: ciphertext or aad was tampered with")]
    Tampered,
}

/// A long-term sealing key. Derive one per purpose from the root seed so
/// ciphertexts from different subsystems can't be swapped for each other.
pub struct SealKey {
    master: [u8; 32],
}

impl SealKey {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    fn derive_message_key(&self, key_id: &[u8; KEY_ID_LEN]) -> aead::LessSafeKey {
        let mut key_bytes = [0u8; 32];
        root_seed::hkdf_sha256(&self.master, KEY_DERIVE_SALT, key_id, &mut key_bytes);
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
            .expect("aes-256-gcm key is always 32 bytes");
        aead::LessSafeKey::new(unbound)
    }

    /// Seal `plaintext`, binding `aad`.
    pub fn seal<R: Crng>(&self, rng: &mut R, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut key_id = [0u8; KEY_ID_LEN];
        rng.fill_bytes(&mut key_id);
        let key = self.derive_message_key(&key_id);

        let mut out = Vec::with_capacity(OVERHEAD_LEN + plaintext.len());
        out.push(VERSION);
        out.extend_from_slice(&key_id);
        out.extend_from_slice(plaintext);

        let mut in_out = out.split_off(VERSION_LEN + KEY_ID_LEN);
        key.seal_in_place_append_tag(zero_nonce(), aead::Aad::from(aad), &mut in_out)
            .expect("sealing is infallible for in-memory buffers");
        out.extend_from_slice(&in_out);
        out
    }

    /// Open a sealed blob, authenticating `aad`.
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < OVERHEAD_LEN {
            return Err(SealError::TooShort);
        }
        let version = sealed[0];
        if version != VERSION {
            return Err(SealError::UnknownVersion(version));
        }
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&sealed[VERSION_LEN..VERSION_LEN + KEY_ID_LEN]);
        let key = self.derive_message_key(&key_id);

        let mut in_out = sealed[VERSION_LEN + KEY_ID_LEN..].to_vec();
        let plaintext = key
            .open_in_place(zero_nonce(), aead::Aad::from(aad), &mut in_out)
            .map_err(|_| SealError::Tampered)?;
        Ok(plaintext.to_vec())
    }
}

fn zero_nonce() -> aead::Nonce {
    aead::Nonce::assume_unique_for_key([0u8; 12])
}

/// The length of a sealed blob for a given plaintext length.
pub const fn sealed_len(plaintext_len: usize) -> usize {
    OVERHEAD_LEN + plaintext_len
}
