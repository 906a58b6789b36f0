//! Content-addressed replication of the wallet inventory.
//!
//! After every meaningful local change the payments module hands the sidecar
//! a fresh inventory snapshot. The sidecar uploads it to a content-addressed
//! remote, then moves a signed mutable name record (owned by a key derived
//! from the wallet seed) to point at the new cid, so a wallet initialized
//! from the same mnemonic can fetch its full inventory with nothing but the
//! seed.

/// Content identifiers.
pub mod cid;
/// Clients for the content-addressed remote.
pub mod content_client;
/// Signed mutable name records.
pub mod name_record;
/// The write-behind snapshot publisher.
pub mod publisher;
/// Persisted sidecar state and snapshot metadata.
pub mod state;

pub use cid::Cid;
pub use content_client::{ContentClient, ContentError, HttpContentClient, MemContentStore};
pub use name_record::{IpnsName, SignedNameRecord};
pub use publisher::{
    LoadedSnapshot, SidecarError, SidecarEvent, SidecarStorage,
    DEFAULT_FLUSH_DEBOUNCE,
};
pub use state::{read_meta, write_meta, SidecarState, SnapshotMeta, SNAPSHOT_FORMAT_VERSION};
