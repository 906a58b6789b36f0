//! Gift-wrapped P2P messaging over a relay pool.
//!
//! The transport connects to a pool of relays, maintains one durable
//! connection per relay with keepalive and bounded-backoff reconnect, and
//! exposes identity-bound operations: gift-wrapped direct messages, encrypted
//! token transfers, payment requests, identity-binding publication, nametag
//! registration/recovery, and `identifier -> peer info` resolution.

use thiserror::Error;

/// Identity-binding events and nametag sealing.
pub mod binding;
/// The transport client and inbound dispatch.
pub mod client;
/// Encrypted envelopes and gift wrapping.
pub mod envelope;
/// The wire event model and filters.
pub mod event;
/// In-memory relay hub for tests and single-process setups.
pub mod hub;
/// Peer identifiers and address forms.
pub mod peer;
/// The relay pool.
pub mod relay;

pub use client::{
    DirectMessage, IdentityView, InboundPayment, InboundTransfer, PaymentMessage,
    SenderInfo, Subscription, TokenTransferPayload, Transport, TransportConfig,
};
pub use event::{EventKind, Filter, WireEvent};
pub use hub::MemRelayHub;
pub use peer::{Identifier, PeerInfo};
pub use relay::{RelayConnector, RelayPool, DEFAULT_QUERY_TIMEOUT};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to any relay")]
    NotConnected,
    #[error("no identity set on the transport")]
    NoIdentity,
    #[error("not a valid x-only pubkey: {0}")]
    BadPubkey(String),
    #[error("transport crypto error: {0:#}")]
    Crypto(#[source] anyhow::Error),
}
