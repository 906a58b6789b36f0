//! HD identity management.
//!
//! One wallet tracks many addresses, each an HD index over the same root
//! seed. Exactly one index is active at a time; switching re-derives keys
//! but never discards them, and hidden flags only gate display.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use sphere_common::{
    hex,
    rng::SysRng,
    root_seed::{ChainKeypair, RootSeed},
};
use sphere_store::{
    wallet_store::{WalletBlob, WalletStore},
    Ffs,
};
use sphere_transport::peer;

/// Everything derived for one HD index.
pub struct Identity {
    pub index: u32,
    /// 66-hex compressed chain pubkey.
    pub chain_pubkey_hex: String,
    pub l1_address: String,
    pub direct_address: String,
    /// 64-hex x-only transport pubkey.
    pub transport_pubkey_hex: String,
    pub nametag: Option<String>,
    pub hidden: bool,
    pub(crate) chain_keypair: ChainKeypair,
    pub(crate) transport_keypair: ChainKeypair,
}

/// Owns the root seed and the persisted wallet blob.
pub struct IdentityManager {
    seed: RootSeed,
    store: WalletStore<Arc<dyn Ffs>>,
    password: Option<String>,
    blob: Mutex<WalletBlob>,
    nametag: Mutex<Option<String>>,
}

impl IdentityManager {
    /// Load the persisted wallet, or create one. With `mnemonic` given, an
    /// existing wallet must match it (otherwise the caller is about to mix
    /// two wallets' state).
    pub fn load_or_create(
        ffs: Arc<dyn Ffs>,
        mnemonic: Option<&str>,
        password: Option<&str>,
    ) -> anyhow::Result<Self> {
        let store = WalletStore::new(ffs);
        let existing = store.load(password).context("Could not load wallet blob")?;

        let blob = match (existing, mnemonic) {
            (Some(blob), Some(mnemonic)) => {
                anyhow::ensure!(
                    blob.mnemonic == mnemonic,
                    "Local wallet belongs to a different mnemonic",
                );
                blob
            }
            (Some(blob), None) => blob,
            (None, Some(mnemonic)) => {
                // Validate before persisting.
                RootSeed::from_mnemonic(mnemonic)?;
                let blob = WalletBlob::new(mnemonic.to_owned());
                store.save(&mut SysRng::new(), &blob, password)?;
                blob
            }
            (None, None) => {
                let (generated, _seed) = RootSeed::generate(&mut SysRng::new())?;
                let blob = WalletBlob::new(generated.to_string());
                store.save(&mut SysRng::new(), &blob, password)?;
                blob
            }
        };

        let seed = RootSeed::from_mnemonic(&blob.mnemonic)
            .context("Persisted mnemonic is invalid")?;
        Ok(Self {
            seed,
            store,
            password: password.map(str::to_owned),
            blob: Mutex::new(blob),
            nametag: Mutex::new(None),
        })
    }

    pub fn root_seed(&self) -> &RootSeed {
        &self.seed
    }

    pub fn active_index(&self) -> u32 {
        self.blob.lock().unwrap().active_index
    }

    pub fn tracked_indices(&self) -> Vec<u32> {
        self.blob.lock().unwrap().tracked_indices.iter().copied().collect()
    }

    /// The identity at the active index.
    pub fn active_identity(&self) -> Identity {
        self.derive(self.active_index())
    }

    /// Derive the identity at any index (it need not be tracked yet).
    pub fn derive(&self, index: u32) -> Identity {
        let chain_keypair = self.seed.derive_chain_keypair(index);
        let transport_keypair = self.seed.derive_transport_keypair(index);
        let chain_pk = chain_keypair.public_key().serialize();
        let blob = self.blob.lock().unwrap();
        Identity {
            index,
            chain_pubkey_hex: hex::encode(&chain_pk),
            l1_address: peer::l1_address(&chain_pk),
            direct_address: peer::direct_address(&chain_pk),
            transport_pubkey_hex: hex::encode(&transport_keypair.x_only().serialize()),
            nametag: self.nametag.lock().unwrap().clone(),
            hidden: blob.hidden_indices.contains(&index),
            chain_keypair,
            transport_keypair,
        }
    }

    /// Activate `index`, tracking it if new.
    pub fn switch_to(&self, index: u32) -> anyhow::Result<Identity> {
        {
            let mut blob = self.blob.lock().unwrap();
            blob.active_index = index;
            blob.tracked_indices.insert(index);
            self.persist(&blob)?;
        }
        Ok(self.derive(index))
    }

    /// Hide or unhide an index. Keys are never deleted.
    pub fn set_hidden(&self, index: u32, hidden: bool) -> anyhow::Result<()> {
        let mut blob = self.blob.lock().unwrap();
        if hidden {
            blob.hidden_indices.insert(index);
        } else {
            blob.hidden_indices.remove(&index);
        }
        self.persist(&blob)
    }

    pub fn set_nametag(&self, nametag: Option<String>) {
        *self.nametag.lock().unwrap() = nametag;
    }

    pub fn nametag(&self) -> Option<String> {
        self.nametag.lock().unwrap().clone()
    }

    pub fn mnemonic(&self) -> String {
        self.blob.lock().unwrap().mnemonic.clone()
    }

    /// Wipe the persisted wallet blob.
    pub fn clear(&self) -> anyhow::Result<()> {
        self.store.clear()
    }

    fn persist(&self, blob: &WalletBlob) -> anyhow::Result<()> {
        self.store
            .save(&mut SysRng::new(), blob, self.password.as_deref())
            .context("Could not persist wallet blob")
    }
}

#[cfg(test)]
mod test {
    use sphere_store::MemFs;

    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon about";

    fn mem_ffs() -> Arc<dyn Ffs> {
        Arc::new(MemFs::new())
    }

    #[test]
    fn create_from_mnemonic_then_reload() {
        let ffs = mem_ffs();
        let manager =
            IdentityManager::load_or_create(ffs.clone(), Some(TEST_MNEMONIC), None)
                .unwrap();
        let identity = manager.active_identity();
        assert_eq!(identity.index, 0);
        drop(manager);

        // Reload without the mnemonic: same identity.
        let manager = IdentityManager::load_or_create(ffs, None, None).unwrap();
        let reloaded = manager.active_identity();
        assert_eq!(reloaded.chain_pubkey_hex, identity.chain_pubkey_hex);
        assert_eq!(reloaded.transport_pubkey_hex, identity.transport_pubkey_hex);
    }

    #[test]
    fn mnemonic_mismatch_is_rejected() {
        let ffs = mem_ffs();
        IdentityManager::load_or_create(ffs.clone(), Some(TEST_MNEMONIC), None)
            .unwrap();
        let other =
            "legal winner thank year wave sausage worth useful legal winner \
             thank yellow";
        assert!(IdentityManager::load_or_create(ffs, Some(other), None).is_err());
    }

    #[test]
    fn generated_wallet_has_valid_mnemonic() {
        let manager = IdentityManager::load_or_create(mem_ffs(), None, None).unwrap();
        RootSeed::from_mnemonic(&manager.mnemonic()).unwrap();
    }

    #[test]
    fn switch_derives_new_keys_and_tracks() {
        let manager =
            IdentityManager::load_or_create(mem_ffs(), Some(TEST_MNEMONIC), None)
                .unwrap();
        let id0 = manager.active_identity();
        let id1 = manager.switch_to(1).unwrap();
        assert_ne!(id0.chain_pubkey_hex, id1.chain_pubkey_hex);
        assert_eq!(manager.active_index(), 1);
        assert_eq!(manager.tracked_indices(), vec![0, 1]);

        // Switching back reproduces the original keys.
        let id0_again = manager.switch_to(0).unwrap();
        assert_eq!(id0.chain_pubkey_hex, id0_again.chain_pubkey_hex);
    }

    #[test]
    fn hidden_flags_gate_visibility_not_keys() {
        let manager =
            IdentityManager::load_or_create(mem_ffs(), Some(TEST_MNEMONIC), None)
                .unwrap();
        manager.set_hidden(0, true).unwrap();
        let identity = manager.derive(0);
        assert!(identity.hidden);
        // Keys still derive fine.
        assert!(!identity.chain_pubkey_hex.is_empty());
        manager.set_hidden(0, false).unwrap();
        assert!(!manager.derive(0).hidden);
    }

    #[test]
    fn password_protected_wallet() {
        let ffs = mem_ffs();
        IdentityManager::load_or_create(
            ffs.clone(),
            Some(TEST_MNEMONIC),
            Some("hunter2hunter2"),
        )
        .unwrap();

        assert!(IdentityManager::load_or_create(ffs.clone(), None, None).is_err());
        assert!(IdentityManager::load_or_create(
            ffs.clone(),
            None,
            Some("wrong password")
        )
        .is_err());
        IdentityManager::load_or_create(ffs, None, Some("hunter2hunter2")).unwrap();
    }
}
