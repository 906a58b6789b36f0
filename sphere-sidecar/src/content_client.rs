//! Clients for the content-addressed remote.
//!
//! The remote exposes four operations: upload bytes (returning their cid),
//! fetch bytes by cid, publish a signed name record, and resolve a name.
//! One closed variant per implementation: an HTTP gateway client and an
//! in-memory store for tests and offline use.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    cid::Cid,
    name_record::{IpnsName, SignedNameRecord},
};

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content not found")]
    NotFound,
    #[error("content bytes do not hash to the requested cid")]
    CidMismatch,
    #[error("name record failed verification")]
    BadRecord,
    #[error("remote unavailable: {0:#}")]
    Unavailable(#[source] anyhow::Error),
}

/// A client for the content-addressed remote.
#[derive(Clone)]
pub enum ContentClient {
    Http(HttpContentClient),
    Mem(MemContentStore),
}

impl ContentClient {
    pub async fn upload(&self, bytes: &[u8]) -> Result<Cid, ContentError> {
        match self {
            Self::Http(client) => client.upload(bytes).await,
            Self::Mem(store) => store.upload(bytes),
        }
    }

    pub async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, ContentError> {
        let bytes = match self {
            Self::Http(client) => client.fetch(cid).await?,
            Self::Mem(store) => store.fetch(cid)?,
        };
        // Never trust the remote: content addressing means we can check.
        if !cid.verifies(&bytes) {
            return Err(ContentError::CidMismatch);
        }
        Ok(bytes)
    }

    pub async fn publish_name(
        &self,
        record: &SignedNameRecord,
    ) -> Result<(), ContentError> {
        record.verify().map_err(|_| ContentError::BadRecord)?;
        match self {
            Self::Http(client) => client.publish_name(record).await,
            Self::Mem(store) => store.publish_name(record),
        }
    }

    pub async fn resolve_name(
        &self,
        name: &IpnsName,
    ) -> Result<Option<SignedNameRecord>, ContentError> {
        let record = match self {
            Self::Http(client) => client.resolve_name(name).await?,
            Self::Mem(store) => store.resolve_name(name),
        };
        match record {
            Some(record) => {
                record.verify().map_err(|_| ContentError::BadRecord)?;
                if record.name != *name {
                    return Err(ContentError::BadRecord);
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

// --- HTTP gateway client --- //

/// Talks to an IPFS-style HTTP gateway:
///
/// - `POST {base}/api/v0/add` with raw bytes -> `{"cid": "..."}`
/// - `GET  {base}/ipfs/{cid}` -> raw bytes (404 = not found)
/// - `POST {base}/api/v0/name/publish` with a record JSON
/// - `GET  {base}/api/v0/name/resolve/{name}` -> record JSON (404 = none)
#[derive(Clone)]
pub struct HttpContentClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct AddResponse {
    cid: Cid,
}

impl HttpContentClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    async fn upload(&self, bytes: &[u8]) -> Result<Cid, ContentError> {
        let url = format!("{}/api/v0/add", self.base_url);
        let response = self
            .client
            .post(url)
            .body(bytes.to_vec())
            .send()
            .await
            .context("upload request failed")
            .map_err(ContentError::Unavailable)?;
        let response = response
            .error_for_status()
            .context("upload was rejected")
            .map_err(ContentError::Unavailable)?;
        let parsed: AddResponse = response
            .json()
            .await
            .context("upload response was malformed")
            .map_err(ContentError::Unavailable)?;
        Ok(parsed.cid)
    }

    async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, ContentError> {
        let url = format!("{}/ipfs/{cid}", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("fetch request failed")
            .map_err(ContentError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ContentError::NotFound);
        }
        let response = response
            .error_for_status()
            .context("fetch was rejected")
            .map_err(ContentError::Unavailable)?;
        let bytes = response
            .bytes()
            .await
            .context("fetch body read failed")
            .map_err(ContentError::Unavailable)?;
        Ok(bytes.to_vec())
    }

    async fn publish_name(
        &self,
        record: &SignedNameRecord,
    ) -> Result<(), ContentError> {
        let url = format!("{}/api/v0/name/publish", self.base_url);
        self.client
            .post(url)
            .json(record)
            .send()
            .await
            .context("publish request failed")
            .map_err(ContentError::Unavailable)?
            .error_for_status()
            .context("publish was rejected")
            .map_err(ContentError::Unavailable)?;
        Ok(())
    }

    async fn resolve_name(
        &self,
        name: &IpnsName,
    ) -> Result<Option<SignedNameRecord>, ContentError> {
        let url = format!("{}/api/v0/name/resolve/{name}", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("resolve request failed")
            .map_err(ContentError::Unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .context("resolve was rejected")
            .map_err(ContentError::Unavailable)?;
        let record: SignedNameRecord = response
            .json()
            .await
            .context("resolve response was malformed")
            .map_err(ContentError::Unavailable)?;
        Ok(Some(record))
    }
}

// --- In-memory store --- //

/// In-memory content store. Clones share state, so one store can back many
/// wallets in a test.
#[derive(Clone, Default)]
pub struct MemContentStore {
    inner: Arc<MemInner>,
}

#[derive(Default)]
struct MemInner {
    blobs: Mutex<HashMap<Cid, Vec<u8>>>,
    names: Mutex<HashMap<IpnsName, SignedNameRecord>>,
    /// Fail this many upcoming name publishes (fault injection for tests).
    fail_publishes: AtomicU32,
    /// Fail this many upcoming uploads.
    fail_uploads: AtomicU32,
}

impl MemContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` name publishes fail with `Unavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` uploads fail with `Unavailable`.
    pub fn fail_next_uploads(&self, n: u32) {
        self.inner.fail_uploads.store(n, Ordering::SeqCst);
    }

    pub fn blob_count(&self) -> usize {
        self.inner.blobs.lock().unwrap().len()
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn upload(&self, bytes: &[u8]) -> Result<Cid, ContentError> {
        if Self::take_fault(&self.inner.fail_uploads) {
            return Err(ContentError::Unavailable(anyhow::anyhow!(
                "injected upload failure"
            )));
        }
        let cid = Cid::digest(bytes);
        self.inner
            .blobs
            .lock()
            .unwrap()
            .insert(cid, bytes.to_vec());
        Ok(cid)
    }

    fn fetch(&self, cid: &Cid) -> Result<Vec<u8>, ContentError> {
        self.inner
            .blobs
            .lock()
            .unwrap()
            .get(cid)
            .cloned()
            .ok_or(ContentError::NotFound)
    }

    fn publish_name(&self, record: &SignedNameRecord) -> Result<(), ContentError> {
        if Self::take_fault(&self.inner.fail_publishes) {
            return Err(ContentError::Unavailable(anyhow::anyhow!(
                "injected publish failure"
            )));
        }
        let mut names = self.inner.names.lock().unwrap();
        if let Some(existing) = names.get(&record.name) {
            // The remote also refuses rollbacks.
            if record.sequence <= existing.sequence {
                debug!(
                    "rejecting name publish: sequence {} <= {}",
                    record.sequence, existing.sequence,
                );
                return Err(ContentError::BadRecord);
            }
        }
        names.insert(record.name, record.clone());
        Ok(())
    }

    fn resolve_name(&self, name: &IpnsName) -> Option<SignedNameRecord> {
        self.inner.names.lock().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod test {
    use sphere_common::ed25519;

    use super::*;

    fn client() -> (ContentClient, MemContentStore) {
        let store = MemContentStore::new();
        (ContentClient::Mem(store.clone()), store)
    }

    #[tokio::test]
    async fn upload_fetch_roundtrip() {
        let (client, _store) = client();
        let cid = client.upload(b"hello world").await.unwrap();
        assert_eq!(client.fetch(&cid).await.unwrap(), b"hello world");
        assert!(matches!(
            client.fetch(&Cid::digest(b"other")).await,
            Err(ContentError::NotFound)
        ));
    }

    #[tokio::test]
    async fn name_publish_resolve_roundtrip() {
        let (client, _store) = client();
        let kp = ed25519::KeyPair::from_seed(&[1; 32]).unwrap();
        let name = IpnsName::from_public_key(kp.public_key());

        assert_eq!(client.resolve_name(&name).await.unwrap(), None);

        let record = SignedNameRecord::sign(&kp, Cid::digest(b"v1"), 1);
        client.publish_name(&record).await.unwrap();
        assert_eq!(client.resolve_name(&name).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn sequence_rollback_rejected() {
        let (client, _store) = client();
        let kp = ed25519::KeyPair::from_seed(&[1; 32]).unwrap();

        client
            .publish_name(&SignedNameRecord::sign(&kp, Cid::digest(b"v2"), 2))
            .await
            .unwrap();
        let rollback = SignedNameRecord::sign(&kp, Cid::digest(b"v1"), 1);
        assert!(matches!(
            client.publish_name(&rollback).await,
            Err(ContentError::BadRecord)
        ));
    }

    #[tokio::test]
    async fn fault_injection_counts_down() {
        let (client, store) = client();
        store.fail_next_uploads(1);
        assert!(client.upload(b"x").await.is_err());
        assert!(client.upload(b"x").await.is_ok());
    }
}
