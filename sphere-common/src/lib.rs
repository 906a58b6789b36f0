//! Shared primitives for the Sphere wallet engine: byte encodings, hashing,
//! randomness, timestamps, amounts, identifiers, and the root seed from which
//! every wallet secret is derived.

/// Token amounts as unsigned big integers with decimal-string serde.
pub mod amount;
/// Exponential backoff iterators for retry loops.
pub mod backoff;
/// Ed25519 signing, used for sidecar name records.
pub mod ed25519;
/// The user-visible error taxonomy.
pub mod error;
/// Hex encoding/decoding utilities.
pub mod hex;
/// Identifier newtypes: coin ids, token ids, state hashes, request ids.
pub mod ids;
/// Cryptographically secure and deterministic rngs.
pub mod rng;
/// The wallet root seed and HKDF child-secret derivation.
pub mod root_seed;
/// AES-256-GCM sealing for blobs at rest.
pub mod seal;
/// SHA-256 helpers.
pub mod sha256;
/// Unix-epoch millisecond timestamps.
pub mod time;
