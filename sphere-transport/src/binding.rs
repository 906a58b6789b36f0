//! Identity-binding events.
//!
//! A binding is a parameterized-replaceable event publishing the mapping
//! from a transport pubkey to the wallet's addresses and optional nametag.
//! The `d` tag pins the replaceable slot; `t` tags carry hashes of every
//! address form so peers can reverse-look-up `identifier -> peer info`
//! without relays learning the plaintext addresses they index.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sphere_common::{
    hex,
    rng::Crng,
    root_seed::{hkdf_sha256, ChainKeypair},
    seal::SealKey,
    sha256,
    time::TimestampMs,
};

use crate::{
    event::{EventKind, Filter, Tag, WireEvent},
    peer::{self, PeerInfo},
};

const NAMETAG_HKDF_SALT: &[u8] = b"sphere-nametag-salt";
const NAMETAG_HKDF_INFO: &[u8] = b"nametag-encryption";
const NAMETAG_AAD: &[u8] = b"sphere/nametag";

/// JSON content of an identity-binding event.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BindingContent {
    /// 66-hex compressed chain pubkey.
    pub public_key: String,
    pub l1_address: String,
    pub direct_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nametag: Option<String>,
    /// Nametag sealed under a key only the owner can derive; lets a wallet
    /// recover its nametag from the mnemonic alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_nametag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<String>,
}

/// The `d`-tag value for a transport pubkey's binding slot.
pub fn binding_d_tag(transport_pubkey_hex: &str) -> String {
    sha256::digest_many(&[b"unicity:identity:", transport_pubkey_hex.as_bytes()])
        .to_string()
}

/// The `t`-tag value indexing one address form.
pub fn address_t_tag(address: &str) -> String {
    sha256::digest_many(&[b"unicity:address:", address.as_bytes()]).to_string()
}

/// The `t`-tag value indexing a nametag.
pub fn nametag_t_tag(nametag: &str) -> String {
    address_t_tag(&format!("@{}", nametag.to_lowercase()))
}

/// Build the signed binding event for `transport` with the given content.
pub fn build_binding<R: Crng>(
    rng: &mut R,
    transport: &ChainKeypair,
    mut content: BindingContent,
    now: TimestampMs,
) -> anyhow::Result<WireEvent> {
    let transport_pubkey_hex = hex::encode(&transport.x_only().serialize());

    let mut tags = vec![Tag::d(binding_d_tag(&transport_pubkey_hex))];
    tags.push(Tag::t(address_t_tag(&content.public_key)));
    tags.push(Tag::t(address_t_tag(&content.direct_address)));
    tags.push(Tag::t(address_t_tag(&content.l1_address)));
    if let Some(proxy) = &content.proxy_address {
        tags.push(Tag::t(address_t_tag(proxy)));
    }
    if let Some(nametag) = content.nametag.clone() {
        tags.push(Tag::t(nametag_t_tag(&nametag)));
        content.proxy_address
            .get_or_insert_with(|| peer::proxy_address(&nametag));
        content.encrypted_nametag =
            Some(encrypt_nametag(rng, transport, &nametag));
    }

    let json = serde_json::to_string(&content).context("Binding serialization")?;
    Ok(WireEvent::build(
        transport,
        EventKind::IdentityBinding,
        tags,
        json,
        now,
    ))
}

/// Parse a binding event into [`PeerInfo`].
pub fn parse_binding(event: &WireEvent) -> anyhow::Result<PeerInfo> {
    anyhow::ensure!(
        event.kind == EventKind::IdentityBinding,
        "Not an identity binding event",
    );
    event.verify().context("Binding failed verification")?;
    let content: BindingContent =
        serde_json::from_str(&event.content).context("Binding deserialization")?;
    Ok(PeerInfo {
        transport_pubkey: event.pubkey.clone(),
        chain_pubkey: content.public_key,
        l1_address: content.l1_address,
        direct_address: content.direct_address,
        proxy_address: content.proxy_address,
        nametag: content.nametag,
    })
}

/// The filter matching our own (or a peer's) binding slot.
pub fn binding_filter_by_author(transport_pubkey_hex: &str) -> Filter {
    Filter::new()
        .kind(EventKind::IdentityBinding)
        .author(transport_pubkey_hex.to_owned())
        .d_tag(binding_d_tag(transport_pubkey_hex))
}

/// The filter matching any binding that indexes `t_tag`.
pub fn binding_filter_by_t_tag(t_tag: String) -> Filter {
    Filter::new().kind(EventKind::IdentityBinding).t_tag(t_tag)
}

fn nametag_seal_key(transport: &ChainKeypair) -> SealKey {
    let sk = transport.secret_key();
    let mut key = [0u8; 32];
    hkdf_sha256(
        &sk.secret_bytes(),
        NAMETAG_HKDF_SALT,
        NAMETAG_HKDF_INFO,
        &mut key,
    );
    SealKey::new(key)
}

/// Seal a nametag so only this wallet can recover it.
pub fn encrypt_nametag<R: Crng>(
    rng: &mut R,
    transport: &ChainKeypair,
    nametag: &str,
) -> String {
    let sealed = nametag_seal_key(transport).seal(rng, NAMETAG_AAD, nametag.as_bytes());
    hex::encode(&sealed)
}

/// Recover a nametag sealed by [`encrypt_nametag`].
pub fn decrypt_nametag(
    transport: &ChainKeypair,
    encrypted_hex: &str,
) -> anyhow::Result<String> {
    let sealed = hex::decode(encrypted_hex).context("Encrypted nametag is not hex")?;
    let plain = nametag_seal_key(transport)
        .open(NAMETAG_AAD, &sealed)
        .context("Could not decrypt nametag")?;
    String::from_utf8(plain).context("Nametag is not UTF-8")
}
