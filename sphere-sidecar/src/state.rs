//! Persisted sidecar state and snapshot metadata.

use std::io;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sphere_common::time::TimestampMs;
use sphere_store::Ffs;

use crate::{cid::Cid, name_record::IpnsName};

const STATE_FILE: &str = "sidecar_state.json";

/// The snapshot format this build writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Durable sidecar bookkeeping, persisted across restarts.
///
/// Invariants: `sequence_number` is monotonic; each published snapshot's
/// `_meta.last_cid` equals the previously published cid; `data_version`
/// strictly increases across successful publishes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SidecarState {
    pub ipns_name: IpnsName,
    pub sequence_number: u64,
    pub last_published_cid: Option<Cid>,
    pub data_version: u64,
    pub remote_cid: Option<Cid>,
}

impl SidecarState {
    pub fn new(ipns_name: IpnsName) -> Self {
        Self {
            ipns_name,
            sequence_number: 0,
            last_published_cid: None,
            data_version: 0,
            remote_cid: None,
        }
    }

    /// Load persisted state, or initialize for `ipns_name`. Persisted state
    /// belonging to a different name (identity switch, corrupt file) is
    /// discarded.
    pub fn load_or_init(ffs: &dyn Ffs, ipns_name: IpnsName) -> Self {
        match ffs.read(STATE_FILE) {
            Ok(buf) => match serde_json::from_slice::<Self>(&buf) {
                Ok(state) if state.ipns_name == ipns_name => state,
                Ok(_) | Err(_) => Self::new(ipns_name),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound =>
                Self::new(ipns_name),
            Err(_) => Self::new(ipns_name),
        }
    }

    pub fn persist(&self, ffs: &dyn Ffs) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .context("Could not serialize sidecar state")?;
        ffs.write(STATE_FILE, &json)
            .context("Could not write sidecar state")
    }
}

/// The `_meta` header every published snapshot carries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u64,
    pub address: String,
    pub format_version: u32,
    pub updated_at: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cid: Option<Cid>,
}

/// Read `_meta` out of a snapshot value.
pub fn read_meta(snapshot: &serde_json::Value) -> anyhow::Result<SnapshotMeta> {
    let meta = snapshot
        .get("_meta")
        .context("Snapshot is missing _meta")?;
    serde_json::from_value(meta.clone()).context("Snapshot _meta is malformed")
}

/// Write `_meta` back into a snapshot value.
pub fn write_meta(snapshot: &mut serde_json::Value, meta: &SnapshotMeta) {
    if let Some(object) = snapshot.as_object_mut() {
        object.insert(
            "_meta".to_owned(),
            serde_json::to_value(meta).expect("meta always serializes"),
        );
    }
}

#[cfg(test)]
mod test {
    use sphere_common::ed25519;
    use sphere_store::MemFs;

    use super::*;

    fn name(byte: u8) -> IpnsName {
        let kp = ed25519::KeyPair::from_seed(&[byte; 32]).unwrap();
        IpnsName::from_public_key(kp.public_key())
    }

    #[test]
    fn persist_load_roundtrip() {
        let ffs = MemFs::new();
        let mut state = SidecarState::new(name(1));
        state.sequence_number = 4;
        state.data_version = 9;
        state.persist(&ffs).unwrap();

        let loaded = SidecarState::load_or_init(&ffs, name(1));
        assert_eq!(loaded, state);
    }

    #[test]
    fn foreign_identity_state_is_discarded() {
        let ffs = MemFs::new();
        let mut state = SidecarState::new(name(1));
        state.sequence_number = 4;
        state.persist(&ffs).unwrap();

        let loaded = SidecarState::load_or_init(&ffs, name(2));
        assert_eq!(loaded, SidecarState::new(name(2)));
    }

    #[test]
    fn meta_read_write_roundtrip() {
        let mut snapshot = serde_json::json!({
            "_meta": {
                "version": 3,
                "address": "unc1abc",
                "format_version": 1,
                "updated_at": 1000,
            },
            "tokens": {},
        });
        let mut meta = read_meta(&snapshot).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.last_cid, None);

        meta.version = 4;
        meta.last_cid = Some(Cid::digest(b"prev"));
        write_meta(&mut snapshot, &meta);
        assert_eq!(read_meta(&snapshot).unwrap(), meta);
    }

    #[test]
    fn missing_meta_is_an_error() {
        assert!(read_meta(&serde_json::json!({"tokens": {}})).is_err());
    }
}
