//! The wire event model.
//!
//! Events are the unit relays store and forward: a signed, content-addressed
//! record `{id, pubkey, created_at, kind, tags, content, sig}`. The id is the
//! SHA-256 of the canonical serialization `[0, pubkey, created_at, kind,
//! tags, content]`, and the signature is Schnorr over the id with the
//! author's x-only key, so relays and peers can verify without extra context.

use std::fmt;

use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use sphere_common::{
    hex,
    root_seed::{verify_schnorr, ChainKeypair},
    sha256,
    time::TimestampMs,
};
use thiserror::Error;

/// Event kinds. The numeric space is private to this network; values are
/// stable wire constants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum EventKind {
    /// Outer layer of a gift-wrapped direct message.
    GiftWrap,
    /// Inner sealed layer of a gift wrap.
    Seal,
    /// Plaintext rumor carried inside a seal. Never published on its own.
    Rumor,
    /// Encrypted token transfer.
    TokenTransfer,
    /// Encrypted payment request.
    PaymentRequest,
    /// Encrypted payment response.
    PaymentResponse,
    /// Parameterized-replaceable identity binding.
    IdentityBinding,
}

impl EventKind {
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::GiftWrap => 1059,
            Self::Seal => 13,
            Self::Rumor => 14,
            Self::TokenTransfer => 20010,
            Self::PaymentRequest => 20011,
            Self::PaymentResponse => 20012,
            Self::IdentityBinding => 30078,
        }
    }

    /// Replaceable events keep only the latest `(pubkey, d-tag)` instance.
    pub const fn is_replaceable(self) -> bool {
        matches!(self, Self::IdentityBinding)
    }
}

impl From<EventKind> for u16 {
    fn from(kind: EventKind) -> u16 {
        kind.as_u16()
    }
}

#[derive(Debug, Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownKind(pub u16);

impl TryFrom<u16> for EventKind {
    type Error = UnknownKind;
    fn try_from(value: u16) -> Result<Self, UnknownKind> {
        match value {
            1059 => Ok(Self::GiftWrap),
            13 => Ok(Self::Seal),
            14 => Ok(Self::Rumor),
            20010 => Ok(Self::TokenTransfer),
            20011 => Ok(Self::PaymentRequest),
            20012 => Ok(Self::PaymentResponse),
            30078 => Ok(Self::IdentityBinding),
            other => Err(UnknownKind(other)),
        }
    }
}

/// A single `["name", "value", ..]` tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Recipient tag.
    pub fn p(pubkey: &XOnlyPublicKey) -> Self {
        Self(vec!["p".to_owned(), hex::encode(&pubkey.serialize())])
    }

    /// Replaceable-event discriminator tag.
    pub fn d(value: impl Into<String>) -> Self {
        Self(vec!["d".to_owned(), value.into()])
    }

    /// Indexed lookup tag.
    pub fn t(value: impl Into<String>) -> Self {
        Self(vec!["t".to_owned(), value.into()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// A 32-byte event id: the hash of the canonical event form.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    pub fn from_hex(s: &str) -> Result<Self, hex::DecodeError> {
        hex::decode_array(s).map(Self)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::display(&self.0))
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", hex::display(&self.0))
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event id does not match event contents")]
    BadId,
    #[error("event signature is invalid")]
    BadSignature,
    #[error("event pubkey is not valid hex of an x-only key")]
    BadPubkey,
}

/// A signed wire event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: EventId,
    /// Author x-only pubkey, lowercase hex.
    pub pubkey: String,
    pub created_at: TimestampMs,
    pub kind: EventKind,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over `id`, lowercase hex. Empty for rumors.
    pub sig: String,
}

impl WireEvent {
    /// Build and sign an event with `keypair`.
    pub fn build(
        keypair: &ChainKeypair,
        kind: EventKind,
        tags: Vec<Tag>,
        content: String,
        created_at: TimestampMs,
    ) -> Self {
        let pubkey = hex::encode(&keypair.x_only().serialize());
        let id = Self::compute_id(&pubkey, created_at, kind, &tags, &content);
        let sig = keypair.sign_digest(sha256::Hash::from_array(id.0));
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(&sig.serialize()),
        }
    }

    /// Build an unsigned rumor. Rumors only travel inside seals; their empty
    /// signature means they must never be published bare.
    pub fn build_rumor(
        author: &XOnlyPublicKey,
        kind: EventKind,
        tags: Vec<Tag>,
        content: String,
        created_at: TimestampMs,
    ) -> Self {
        let pubkey = hex::encode(&author.serialize());
        let id = Self::compute_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        }
    }

    fn compute_id(
        pubkey: &str,
        created_at: TimestampMs,
        kind: EventKind,
        tags: &[Tag],
        content: &str,
    ) -> EventId {
        let canonical = serde_json::json!([
            0,
            pubkey,
            created_at.as_i64(),
            kind.as_u16(),
            tags,
            content,
        ]);
        let bytes =
            serde_json::to_vec(&canonical).expect("json arrays always serialize");
        EventId(sha256::digest(&bytes).to_array())
    }

    /// Parse the author pubkey.
    pub fn author(&self) -> Result<XOnlyPublicKey, EventError> {
        let bytes =
            hex::decode_array::<32>(&self.pubkey).map_err(|_| EventError::BadPubkey)?;
        XOnlyPublicKey::from_slice(&bytes).map_err(|_| EventError::BadPubkey)
    }

    /// Verify the id and (for non-rumors) the signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let expected = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if expected != self.id {
            return Err(EventError::BadId);
        }
        if self.sig.is_empty() {
            // Rumors carry no signature by construction.
            return Ok(());
        }
        let author = self.author()?;
        let sig_bytes =
            hex::decode_array::<64>(&self.sig).map_err(|_| EventError::BadSignature)?;
        let sig = secp256k1::schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|_| EventError::BadSignature)?;
        if verify_schnorr(&sig, sha256::Hash::from_array(self.id.0), &author) {
            Ok(())
        } else {
            Err(EventError::BadSignature)
        }
    }

    /// First value of the named tag, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All values of the named tag.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |tag| tag.name() == Some(name))
            .filter_map(Tag::value)
    }
}

/// A relay subscription filter. All set fields must match (conjunction);
/// within a field, any listed value matches (disjunction).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<EventKind>>,
    /// Author x-only pubkeys, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// `p`-tag values (recipients), hex.
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    /// `d`-tag values.
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    /// `t`-tag values.
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub t_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<TimestampMs>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, pubkey_hex: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey_hex.into());
        self
    }

    pub fn p_tag(mut self, value: impl Into<String>) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn d_tag(mut self, value: impl Into<String>) -> Self {
        self.d_tags.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn t_tag(mut self, value: impl Into<String>) -> Self {
        self.t_tags.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn matches(&self, event: &WireEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(values) = &self.p_tags {
            if !event.tag_values("p").any(|v| values.iter().any(|x| x == v)) {
                return false;
            }
        }
        if let Some(values) = &self.d_tags {
            if !event.tag_values("d").any(|v| values.iter().any(|x| x == v)) {
                return false;
            }
        }
        if let Some(values) = &self.t_tags {
            if !event.tag_values("t").any(|v| values.iter().any(|x| x == v)) {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if event.created_at < *since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use sphere_common::root_seed::RootSeed;

    use super::*;

    fn test_keypair(index: u32) -> ChainKeypair {
        let seed = RootSeed::try_from([7u8; 32].as_slice()).unwrap();
        seed.derive_transport_keypair(index)
    }

    #[test]
    fn build_verify_roundtrip() {
        let kp = test_keypair(0);
        let event = WireEvent::build(
            &kp,
            EventKind::TokenTransfer,
            vec![Tag::p(&test_keypair(1).x_only())],
            "payload".to_owned(),
            TimestampMs::from_ms(1_000).unwrap(),
        );
        event.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails_verification() {
        let kp = test_keypair(0);
        let mut event = WireEvent::build(
            &kp,
            EventKind::TokenTransfer,
            vec![],
            "payload".to_owned(),
            TimestampMs::from_ms(1_000).unwrap(),
        );
        event.content = "tampered".to_owned();
        assert!(matches!(event.verify(), Err(EventError::BadId)));
    }

    #[test]
    fn rumor_verifies_without_signature() {
        let kp = test_keypair(0);
        let rumor = WireEvent::build_rumor(
            &kp.x_only(),
            EventKind::Rumor,
            vec![],
            "psst".to_owned(),
            TimestampMs::from_ms(5).unwrap(),
        );
        assert!(rumor.sig.is_empty());
        rumor.verify().unwrap();
    }

    #[test]
    fn serde_roundtrip() {
        let kp = test_keypair(2);
        let event = WireEvent::build(
            &kp,
            EventKind::IdentityBinding,
            vec![Tag::d("abc"), Tag::t("def")],
            "{}".to_owned(),
            TimestampMs::from_ms(99).unwrap(),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: WireEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        back.verify().unwrap();
    }

    #[test]
    fn filter_matching() {
        let kp = test_keypair(0);
        let recipient = test_keypair(1).x_only();
        let event = WireEvent::build(
            &kp,
            EventKind::TokenTransfer,
            vec![Tag::p(&recipient)],
            "x".to_owned(),
            TimestampMs::from_ms(50).unwrap(),
        );

        let recipient_hex = hex::encode(&recipient.serialize());
        assert!(Filter::new().kind(EventKind::TokenTransfer).matches(&event));
        assert!(Filter::new().p_tag(recipient_hex).matches(&event));
        assert!(!Filter::new().kind(EventKind::GiftWrap).matches(&event));
        assert!(!Filter::new().author("00".repeat(32)).matches(&event));

        let since = Filter {
            since: TimestampMs::from_ms(60),
            ..Filter::default()
        };
        assert!(!since.matches(&event));
    }
}
