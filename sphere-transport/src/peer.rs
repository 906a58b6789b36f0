//! Peer identifiers and addresses.
//!
//! Everything a transfer can be addressed to parses into an [`Identifier`];
//! resolution turns an identifier into [`PeerInfo`] via identity-binding
//! lookups.

use std::fmt;

use serde::{Deserialize, Serialize};
use sphere_common::{hex, sha256};

pub const DIRECT_PREFIX: &str = "DIRECT://";
pub const PROXY_PREFIX: &str = "PROXY://";
pub const L1_PREFIX: &str = "unc1";

/// What a recipient string parses into, dispatched purely by shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Identifier {
    /// `@name`
    Nametag(String),
    /// `DIRECT://<66-hex chain pubkey>`
    Direct(String),
    /// `PROXY://<64-hex nametag hash>`
    Proxy(String),
    /// `unc1...` ledger address
    L1(String),
    /// bare 66-hex compressed chain pubkey
    ChainPubkey(String),
    /// bare 64-hex x-only transport pubkey
    TransportPubkey(String),
}

impl Identifier {
    /// Parse a recipient string. Returns `None` for shapes we don't know.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Some(name) = input.strip_prefix('@') {
            if !name.is_empty() {
                return Some(Self::Nametag(name.to_owned()));
            }
            return None;
        }
        if let Some(rest) = input.strip_prefix(DIRECT_PREFIX) {
            if hex::is_hex_of_len(rest, 33) {
                return Some(Self::Direct(rest.to_ascii_lowercase()));
            }
            return None;
        }
        if let Some(rest) = input.strip_prefix(PROXY_PREFIX) {
            if hex::is_hex_of_len(rest, 32) {
                return Some(Self::Proxy(rest.to_ascii_lowercase()));
            }
            return None;
        }
        if input.starts_with(L1_PREFIX) && input.len() == L1_PREFIX.len() + 40 {
            return Some(Self::L1(input.to_owned()));
        }
        if hex::is_hex_of_len(input, 33) {
            return Some(Self::ChainPubkey(input.to_ascii_lowercase()));
        }
        if hex::is_hex_of_len(input, 32) {
            return Some(Self::TransportPubkey(input.to_ascii_lowercase()));
        }
        None
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nametag(name) => write!(f, "@{name}"),
            Self::Direct(pk) => write!(f, "{DIRECT_PREFIX}{pk}"),
            Self::Proxy(hash) => write!(f, "{PROXY_PREFIX}{hash}"),
            Self::L1(addr) => f.write_str(addr),
            Self::ChainPubkey(pk) => f.write_str(pk),
            Self::TransportPubkey(pk) => f.write_str(pk),
        }
    }
}

/// Resolved peer info, assembled from an identity-binding event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// 64-hex x-only transport pubkey.
    pub transport_pubkey: String,
    /// 66-hex compressed chain pubkey.
    pub chain_pubkey: String,
    pub l1_address: String,
    pub direct_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nametag: Option<String>,
}

/// The ledger address form of a chain pubkey: `unc1` + first 20 bytes of
/// its SHA-256, hex.
pub fn l1_address(chain_pubkey: &[u8; 33]) -> String {
    let digest = sha256::digest(chain_pubkey);
    format!("{L1_PREFIX}{}", hex::display(&digest.as_slice()[..20]))
}

/// The direct address form of a chain pubkey.
pub fn direct_address(chain_pubkey: &[u8; 33]) -> String {
    format!("{DIRECT_PREFIX}{}", hex::display(chain_pubkey))
}

/// The proxy address derived from a nametag.
pub fn proxy_address(nametag: &str) -> String {
    let digest = nametag_hash(nametag);
    format!("{PROXY_PREFIX}{digest}")
}

/// The hash binding a nametag into tags and proxy addresses. Nametags are
/// case-insensitive; hash the lowercase form.
pub fn nametag_hash(nametag: &str) -> sha256::Hash {
    let lower = nametag.to_lowercase();
    sha256::digest_many(&[b"unicity:proxy:", lower.as_bytes()])
}
