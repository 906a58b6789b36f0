//! Flat-file persistence for the Sphere wallet engine.
//!
//! Everything the wallet persists locally goes through the [`Ffs`]
//! abstraction: a flat (no subdirectory) file namespace with atomic writes.
//! Higher layers compose stores out of it: the wallet blob, the per-token
//! files, the tombstone log, and the sidecar state file.

/// Flat file system abstraction: disk-backed and in-memory impls.
pub mod ffs;
/// Append-only JSON-lines logs.
pub mod jsonl;
/// The persisted wallet blob (mnemonic, address indices, profile).
pub mod wallet_store;

pub use ffs::{DiskFs, Ffs, MemFs};
