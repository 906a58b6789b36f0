//! The wallet root seed, from which every child secret is derived.
//!
//! The seed comes from the user's BIP39 mnemonic. All derivation goes through
//! a single salted HKDF-SHA256 so that child secrets are domain separated by
//! label; nothing downstream ever touches the seed bytes directly.

use std::{fmt, str::FromStr};

use anyhow::{format_err, Context};
use secp256k1::{Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use secrecy::{ExposeSecret, Secret};

use crate::{ed25519, hex, rng::Crng, sha256};

/// HKDF info for the per-identity sidecar signing key.
pub const SIDECAR_KEY_INFO: &[u8] = b"ipfs-storage-ed25519-v1";

/// The user's root seed from which we derive all child secrets.
pub struct RootSeed(Secret<[u8; Self::LENGTH]>);

impl RootSeed {
    pub const LENGTH: usize = 32;

    /// We salt the HKDF for domain separation. The raw bytes here equal
    /// `SHA-256(b"SPHERE-HASH-REALM::RootSeed")`.
    const HKDF_SALT: [u8; 32] = [
        0x3d, 0x82, 0xd4, 0xd5, 0x25, 0xb3, 0x5c, 0xa7, //
        0xb0, 0xf9, 0xd2, 0x53, 0xea, 0xc6, 0xd9, 0xe6, //
        0xa6, 0x59, 0x6c, 0x97, 0x7c, 0x7e, 0x47, 0xd9, //
        0x7a, 0x54, 0x45, 0x66, 0xd2, 0xb7, 0xb7, 0x4c,
    ];

    pub fn new(bytes: Secret<[u8; Self::LENGTH]>) -> Self {
        Self(bytes)
    }

    pub fn from_rng<R: Crng>(rng: &mut R) -> Self {
        let mut seed = [0u8; Self::LENGTH];
        rng.fill_bytes(&mut seed);
        Self(Secret::new(seed))
    }

    /// Derive the root seed from a BIP39 mnemonic phrase. The empty passphrase
    /// is always used; account separation happens at the HKDF layer.
    pub fn from_mnemonic(phrase: &str) -> anyhow::Result<Self> {
        let mnemonic = bip39::Mnemonic::parse(phrase)
            .context("Invalid BIP39 mnemonic phrase")?;
        let seed64 = mnemonic.to_seed("");
        let mut seed = [0u8; Self::LENGTH];
        seed.copy_from_slice(&seed64[..Self::LENGTH]);
        Ok(Self(Secret::new(seed)))
    }

    /// Sample a fresh mnemonic, returning it alongside the derived seed.
    pub fn generate<R: Crng>(rng: &mut R) -> anyhow::Result<(bip39::Mnemonic, Self)> {
        let mut entropy = [0u8; 16];
        rng.fill_bytes(&mut entropy);
        let mnemonic = bip39::Mnemonic::from_entropy(&entropy)
            .context("Could not build mnemonic from entropy")?;
        let seed = Self::from_mnemonic(&mnemonic.to_string())?;
        Ok((mnemonic, seed))
    }

    fn extract(&self) -> ring::hkdf::Prk {
        let salted_hkdf =
            ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, Self::HKDF_SALT.as_slice());
        salted_hkdf.extract(self.0.expose_secret().as_slice())
    }

    /// Derive a new child secret with `label` into a prepared buffer `out`.
    pub fn derive_to_slice(&self, label: &[u8], out: &mut [u8]) {
        hkdf_expand(self.extract(), label, out)
    }

    /// Derive a new child secret with `label` to a hash-output-sized buffer.
    pub fn derive(&self, label: &[u8]) -> Secret<[u8; 32]> {
        let mut out = [0u8; 32];
        self.derive_to_slice(label, &mut out);
        Secret::new(out)
    }

    /// Derive the secp256k1 chain keypair for HD address `index`.
    ///
    /// The chain pubkey (33-byte compressed) is the wallet's on-ledger
    /// predicate key; the aggregator's request ids bind it.
    pub fn derive_chain_keypair(&self, index: u32) -> ChainKeypair {
        let label = format!("sphere/chain/key/{index}");
        self.derive_secp_keypair(label.as_bytes())
    }

    /// Derive the x-only transport keypair for HD address `index`.
    pub fn derive_transport_keypair(&self, index: u32) -> ChainKeypair {
        let label = format!("sphere/transport/key/{index}");
        self.derive_secp_keypair(label.as_bytes())
    }

    /// Derive the Ed25519 seed for the sidecar name-record key.
    pub fn derive_sidecar_seed(&self) -> Secret<[u8; 32]> {
        self.derive(SIDECAR_KEY_INFO)
    }

    /// The sidecar signing keypair, ready to use.
    pub fn derive_sidecar_keypair(&self) -> ed25519::KeyPair {
        let seed = self.derive_sidecar_seed();
        ed25519::KeyPair::from_seed(seed.expose_secret())
            .expect("hkdf output is always a valid ed25519 seed")
    }

    /// Derive the AES master key material sealing wallet blobs at rest.
    pub fn derive_storage_key(&self) -> Secret<[u8; 32]> {
        self.derive(b"sphere/storage/master-key")
    }

    fn derive_secp_keypair(&self, label: &[u8]) -> ChainKeypair {
        let secret = self.derive(label);
        let sk = SecretKey::from_slice(secret.expose_secret().as_slice())
            .expect("hkdf output is a valid scalar except w/ negligible prob");
        ChainKeypair::from_secret_key(sk)
    }
}

impl ExposeSecret<[u8; Self::LENGTH]> for RootSeed {
    fn expose_secret(&self) -> &[u8; Self::LENGTH] {
        self.0.expose_secret()
    }
}

impl FromStr for RootSeed {
    type Err = hex::DecodeError;

    fn from_str(hex_str: &str) -> Result<Self, Self::Err> {
        hex::decode_array(hex_str).map(|bytes| Self::new(Secret::new(bytes)))
    }
}

impl fmt::Debug for RootSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Avoid formatting secrets.
        f.write_str("RootSeed(..)")
    }
}

impl TryFrom<&[u8]> for RootSeed {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != Self::LENGTH {
            return Err(format_err!("input must be {} bytes", Self::LENGTH));
        }
        let mut out = [0u8; Self::LENGTH];
        out.copy_from_slice(bytes);
        Ok(Self::new(Secret::new(out)))
    }
}

/// One-shot HKDF-SHA256 expand from an already-extracted PRK.
fn hkdf_expand(prk: ring::hkdf::Prk, info: &[u8], out: &mut [u8]) {
    struct OkmLength(usize);

    impl ring::hkdf::KeyType for OkmLength {
        fn len(&self) -> usize {
            self.0
        }
    }

    prk.expand(&[info], OkmLength(out.len()))
        .expect("out length is always within hkdf bounds")
        .fill(out)
        .expect("fill length matches expand length")
}

/// One-shot HKDF-SHA256: extract with `salt`, expand with `info`.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) {
    let prk = ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, salt).extract(ikm);
    hkdf_expand(prk, info, out)
}

/// A secp256k1 keypair plus its precomputed public forms.
#[derive(Clone)]
pub struct ChainKeypair {
    keypair: Keypair,
    public_key: PublicKey,
    x_only: XOnlyPublicKey,
}

impl ChainKeypair {
    pub fn from_secret_key(sk: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let public_key = PublicKey::from_secret_key(&secp, &sk);
        let (x_only, _parity) = XOnlyPublicKey::from_keypair(&keypair);
        Self {
            keypair,
            public_key,
            x_only,
        }
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// 33-byte compressed public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// 32-byte x-only public key, the transport identity form.
    pub fn x_only(&self) -> XOnlyPublicKey {
        self.x_only
    }

    /// Schnorr-sign a 32-byte digest.
    pub fn sign_digest(&self, digest: sha256::Hash) -> secp256k1::schnorr::Signature {
        let secp = Secp256k1::new();
        let msg = secp256k1::Message::from_digest(digest.to_array());
        secp.sign_schnorr_no_aux_rand(&msg, &self.keypair)
    }
}

/// Verify a Schnorr signature over a 32-byte digest.
pub fn verify_schnorr(
    signature: &secp256k1::schnorr::Signature,
    digest: sha256::Hash,
    x_only: &XOnlyPublicKey,
) -> bool {
    let secp = Secp256k1::verification_only();
    let msg = secp256k1::Message::from_digest(digest.to_array());
    secp.verify_schnorr(signature, &msg, x_only).is_ok()
}

impl fmt::Debug for ChainKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainKeypair({})", self.public_key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon about";

    #[test]
    fn hkdf_salt_is_hash_of_realm_string() {
        let expected = sha256::digest(b"SPHERE-HASH-REALM::RootSeed");
        assert_eq!(RootSeed::HKDF_SALT, expected.to_array());
    }

    #[test]
    fn mnemonic_derivation_is_deterministic() {
        let seed1 = RootSeed::from_mnemonic(TEST_MNEMONIC).unwrap();
        let seed2 = RootSeed::from_mnemonic(TEST_MNEMONIC).unwrap();
        assert_eq!(seed1.expose_secret(), seed2.expose_secret());

        let kp1 = seed1.derive_chain_keypair(0);
        let kp2 = seed2.derive_chain_keypair(0);
        assert_eq!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn indexes_and_labels_are_domain_separated() {
        let seed = RootSeed::from_mnemonic(TEST_MNEMONIC).unwrap();
        let chain0 = seed.derive_chain_keypair(0);
        let chain1 = seed.derive_chain_keypair(1);
        let transport0 = seed.derive_transport_keypair(0);
        assert_ne!(chain0.public_key(), chain1.public_key());
        assert_ne!(chain0.public_key(), transport0.public_key());
    }

    #[test]
    fn schnorr_sign_verify() {
        let seed = RootSeed::from_mnemonic(TEST_MNEMONIC).unwrap();
        let kp = seed.derive_transport_keypair(0);
        let digest = sha256::digest(b"hello");
        let sig = kp.sign_digest(digest);
        assert!(verify_schnorr(&sig, digest, &kp.x_only()));
        assert!(!verify_schnorr(&sig, sha256::digest(b"other"), &kp.x_only()));
    }

    #[test]
    fn generate_roundtrips_through_phrase() {
        let mut rng = crate::rng::FastRng::from_u64(7);
        let (mnemonic, seed) = RootSeed::generate(&mut rng).unwrap();
        let seed2 = RootSeed::from_mnemonic(&mnemonic.to_string()).unwrap();
        assert_eq!(seed.expose_secret(), seed2.expose_secret());
    }
}
