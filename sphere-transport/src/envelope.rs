//! Encrypted envelopes between transport keys.
//!
//! Two constructions:
//!
//! - [`encrypt`]/[`decrypt`]: a direct envelope between a sender secret key
//!   and a recipient x-only key. ECDH over secp256k1 (x-only keys lifted to
//!   even-y points) feeds HKDF into a single-use AES-256-GCM seal. Used for
//!   token transfers and payment requests, where the signed outer event
//!   already names the sender.
//! - [`gift_wrap`]/[`unwrap_gift`]: the two-layer construction for direct
//!   messages. The plaintext rumor is sealed to the recipient under the
//!   sender's key, then that seal is wrapped in an outer event signed by a
//!   one-shot ephemeral key, so relay operators never see the sender
//!   identity.

use anyhow::{bail, Context};
use secp256k1::{ecdh, Parity, PublicKey, SecretKey, XOnlyPublicKey};
use sphere_common::{
    hex,
    rng::Crng,
    root_seed::{hkdf_sha256, ChainKeypair},
    seal::SealKey,
    time::TimestampMs,
};

use crate::event::{EventKind, Tag, WireEvent};

const ENVELOPE_HKDF_SALT: &[u8] = b"sphere/transport/envelope-v1";
/// AAD for direct envelopes.
const ENVELOPE_AAD: &[u8] = b"sphere/envelope";

/// Derive the shared AEAD key between `sk` and the x-only `pk`.
///
/// Only the shared point's x-coordinate feeds the KDF: negating either side
/// of the DH (which is what lifting an x-only key to an even-y point can do)
/// leaves the x-coordinate unchanged, so both directions always agree.
fn shared_seal_key(sk: &SecretKey, pk: &XOnlyPublicKey) -> SealKey {
    let full_pk = PublicKey::from_x_only_public_key(*pk, Parity::Even);
    let point = ecdh::shared_secret_point(&full_pk, sk);
    let mut key = [0u8; 32];
    hkdf_sha256(&point[..32], ENVELOPE_HKDF_SALT, b"", &mut key);
    SealKey::new(key)
}

/// Encrypt `plaintext` from `sk` to the recipient `pk`. Output is hex.
pub fn encrypt<R: Crng>(
    rng: &mut R,
    sk: &SecretKey,
    pk: &XOnlyPublicKey,
    plaintext: &[u8],
) -> String {
    let key = shared_seal_key(sk, pk);
    hex::encode(&key.seal(rng, ENVELOPE_AAD, plaintext))
}

/// Decrypt an envelope produced by [`encrypt`] for the other side.
pub fn decrypt(
    sk: &SecretKey,
    pk: &XOnlyPublicKey,
    content_hex: &str,
) -> anyhow::Result<Vec<u8>> {
    let sealed = hex::decode(content_hex).context("Envelope content is not hex")?;
    shared_seal_key(sk, pk)
        .open(ENVELOPE_AAD, &sealed)
        .context("Could not decrypt envelope")
}

/// Gift-wrap `rumor` for `recipient`.
///
/// Layering: `rumor` (unsigned, authored by sender) -> `seal` (encrypted
/// sender->recipient, signed by sender) -> `wrap` (encrypted
/// ephemeral->recipient, signed by the ephemeral key, `p`-tagged with the
/// recipient). Only the wrap is published.
pub fn gift_wrap<R: Crng>(
    rng: &mut R,
    sender: &ChainKeypair,
    recipient: &XOnlyPublicKey,
    rumor: &WireEvent,
    now: TimestampMs,
) -> anyhow::Result<WireEvent> {
    if !rumor.sig.is_empty() {
        bail!("Refusing to wrap a signed event; rumors must be unsigned");
    }
    let rumor_json = serde_json::to_string(rumor).context("Rumor serialization")?;
    let seal_content =
        encrypt(rng, &sender.secret_key(), recipient, rumor_json.as_bytes());
    let seal = WireEvent::build(sender, EventKind::Seal, vec![], seal_content, now);

    let ephemeral = ephemeral_keypair(rng);
    let seal_json = serde_json::to_string(&seal).context("Seal serialization")?;
    let wrap_content =
        encrypt(rng, &ephemeral.secret_key(), recipient, seal_json.as_bytes());
    Ok(WireEvent::build(
        &ephemeral,
        EventKind::GiftWrap,
        vec![Tag::p(recipient)],
        wrap_content,
        now,
    ))
}

/// Unwrap a gift wrap addressed to `recipient`, returning the rumor and the
/// sender's transport pubkey (taken from the verified seal).
pub fn unwrap_gift(
    recipient: &ChainKeypair,
    wrap: &WireEvent,
) -> anyhow::Result<(WireEvent, XOnlyPublicKey)> {
    if wrap.kind != EventKind::GiftWrap {
        bail!("Not a gift wrap event");
    }
    let ephemeral_pk = wrap.author().context("Bad wrap author key")?;
    let seal_json = decrypt(&recipient.secret_key(), &ephemeral_pk, &wrap.content)
        .context("Could not open wrap layer")?;
    let seal: WireEvent =
        serde_json::from_slice(&seal_json).context("Seal deserialization")?;
    if seal.kind != EventKind::Seal {
        bail!("Wrap did not contain a seal");
    }
    seal.verify().context("Seal failed verification")?;

    let sender_pk = seal.author().context("Bad seal author key")?;
    let rumor_json = decrypt(&recipient.secret_key(), &sender_pk, &seal.content)
        .context("Could not open seal layer")?;
    let rumor: WireEvent =
        serde_json::from_slice(&rumor_json).context("Rumor deserialization")?;

    // The rumor must claim the same author that sealed it, else a forwarder
    // could re-seal someone else's message as their own.
    if rumor.pubkey != seal.pubkey {
        bail!("Rumor author does not match seal author");
    }
    rumor.verify().context("Rumor failed verification")?;

    Ok((rumor, sender_pk))
}

fn ephemeral_keypair<R: Crng>(rng: &mut R) -> ChainKeypair {
    loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if let Ok(sk) = SecretKey::from_slice(&bytes) {
            return ChainKeypair::from_secret_key(sk);
        }
    }
}
