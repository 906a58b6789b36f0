//! The persisted wallet blob: mnemonic, tracked HD indices, profile.
//!
//! When the user sets a password the blob is sealed at rest under a
//! PBKDF2-stretched key; otherwise it is stored as plain JSON.

use std::{collections::BTreeSet, io, num::NonZeroU32};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sphere_common::{
    rng::Crng,
    seal::SealKey,
};

use crate::ffs::Ffs;

const WALLET_FILE: &str = "wallet.json";
const SEALED_WALLET_FILE: &str = "wallet.sealed";

/// OWASP-recommended iteration count for PBKDF2-HMAC-SHA256.
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => unreachable!(),
};
const PBKDF2_SALT: &[u8] = b"SPHERE-HASH-REALM::WalletPassword";

/// AAD binding sealed wallet blobs to their purpose.
const WALLET_AAD: &[u8] = b"sphere/wallet-blob";

/// Everything the wallet needs to reconstruct itself locally, other than the
/// token inventory (which replicates through the sidecar).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WalletBlob {
    /// BIP39 mnemonic phrase. The root of all derived secrets.
    pub mnemonic: String,
    /// The active HD address index.
    pub active_index: u32,
    /// Every index the user has ever activated.
    pub tracked_indices: BTreeSet<u32>,
    /// Indices hidden from display. Hiding never deletes keys.
    pub hidden_indices: BTreeSet<u32>,
    /// Opaque reference to the current profile.
    pub profile: Option<String>,
}

impl WalletBlob {
    pub fn new(mnemonic: String) -> Self {
        Self {
            mnemonic,
            active_index: 0,
            tracked_indices: BTreeSet::from([0]),
            hidden_indices: BTreeSet::new(),
            profile: None,
        }
    }
}

/// Loads and saves the [`WalletBlob`], sealed at rest when a password is set.
pub struct WalletStore<F> {
    ffs: F,
}

impl<F: Ffs> WalletStore<F> {
    pub fn new(ffs: F) -> Self {
        Self { ffs }
    }

    /// Load the wallet blob. `Ok(None)` means no wallet has been created.
    pub fn load(&self, password: Option<&str>) -> anyhow::Result<Option<WalletBlob>> {
        match (self.read_opt(SEALED_WALLET_FILE)?, password) {
            (Some(sealed), Some(password)) => {
                let key = password_seal_key(password);
                let plaintext = key
                    .open(WALLET_AAD, &sealed)
                    .context("Wrong password or corrupted wallet file")?;
                let blob = serde_json::from_slice(&plaintext)
                    .context("Could not deserialize wallet blob")?;
                Ok(Some(blob))
            }
            (Some(_), None) => bail!("Wallet is password protected"),
            (None, _) => match self.read_opt(WALLET_FILE)? {
                Some(plain) => {
                    let blob = serde_json::from_slice(&plain)
                        .context("Could not deserialize wallet blob")?;
                    Ok(Some(blob))
                }
                None => Ok(None),
            },
        }
    }

    /// Persist the wallet blob, sealing it iff a password is given.
    pub fn save<R: Crng>(
        &self,
        rng: &mut R,
        blob: &WalletBlob,
        password: Option<&str>,
    ) -> anyhow::Result<()> {
        let json =
            serde_json::to_vec(blob).context("Could not serialize wallet blob")?;
        match password {
            Some(password) => {
                let key = password_seal_key(password);
                let sealed = key.seal(rng, WALLET_AAD, &json);
                self.ffs
                    .write(SEALED_WALLET_FILE, &sealed)
                    .context("Could not write sealed wallet file")?;
                // Don't leave a stale plaintext copy behind.
                let _ = self.ffs.delete(WALLET_FILE);
            }
            None => {
                self.ffs
                    .write(WALLET_FILE, &json)
                    .context("Could not write wallet file")?;
            }
        }
        Ok(())
    }

    /// Wipe all persisted wallet state.
    pub fn clear(&self) -> anyhow::Result<()> {
        self.ffs.delete_all().context("Could not clear wallet store")
    }

    fn read_opt(&self, filename: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.ffs.read(filename) {
            Ok(buf) => Ok(Some(buf)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) =>
                Err(err).with_context(|| format!("Failed to read {filename}")),
        }
    }
}

fn password_seal_key(password: &str) -> SealKey {
    let mut key = [0u8; 32];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        PBKDF2_SALT,
        password.as_bytes(),
        &mut key,
    );
    SealKey::new(key)
}
