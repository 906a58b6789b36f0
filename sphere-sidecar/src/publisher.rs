//! The write-behind snapshot publisher.
//!
//! `save` drops the snapshot into a single-slot latest-wins buffer and
//! returns immediately; a dedicated writer task debounces, then uploads the
//! snapshot and advances the signed name record. Only the writer task ever
//! flushes, which is what guarantees a single in-flight publish: saves that
//! land mid-flush refill the buffer and the writer goes around again.
//!
//! Chain discipline: the uploaded snapshot's `_meta.last_cid` is the remote
//! cid from before the publish and its `_meta.version` strictly increases;
//! the name-record sequence bumps by exactly one per publish. Nothing
//! advances on failure; the failed snapshot re-enters the buffer and is
//! retried with backoff.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use serde_json::Value;
use sphere_common::{backoff, ed25519, time::TimestampMs};
use sphere_store::Ffs;
use sphere_tokio::{
    events_bus::EventsBus, notify, notify_once::NotifyOnce, task::SpTask,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    cid::Cid,
    content_client::{ContentClient, ContentError},
    name_record::{IpnsName, SignedNameRecord},
    state::{self, SidecarState},
};

/// Default debounce between a save and its flush.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("remote snapshot not found for this identity")]
    NotFound,
    #[error("name record sequence regressed (remote {remote} < local {local})")]
    SequenceRegressed { remote: u64, local: u64 },
    #[error("snapshot failed shape validation: {0:#}")]
    BadSnapshot(#[source] anyhow::Error),
    #[error(transparent)]
    Content(#[from] ContentError),
}

/// Emitted by the writer task after each flush attempt.
#[derive(Clone, Debug)]
pub enum SidecarEvent {
    PublishSucceeded {
        cid: Cid,
        version: u64,
        sequence: u64,
    },
    PublishFailed {
        message: String,
    },
}

/// A successfully loaded remote snapshot.
#[derive(Clone, Debug)]
pub struct LoadedSnapshot {
    pub data: Value,
    pub cid: Cid,
    pub sequence: u64,
}

pub struct SidecarStorage<F> {
    inner: Arc<SidecarInner<F>>,
    writer_task: StdMutex<Option<SpTask<()>>>,
}

struct SidecarInner<F> {
    client: ContentClient,
    keypair: ed25519::KeyPair,
    ffs: F,
    state: StdMutex<SidecarState>,
    buffer: StdMutex<Option<Value>>,
    dirty_tx: notify::Sender,
    events: EventsBus<SidecarEvent>,
    flush_debounce: Duration,
    shutdown: NotifyOnce,
}

impl<F: Ffs + 'static> SidecarStorage<F> {
    /// Restore persisted sidecar state and start the writer task.
    pub fn new(
        client: ContentClient,
        keypair: ed25519::KeyPair,
        ffs: F,
        flush_debounce: Duration,
    ) -> Self {
        let ipns_name = IpnsName::from_public_key(keypair.public_key());
        let state = SidecarState::load_or_init(&ffs, ipns_name);
        let (dirty_tx, dirty_rx) = notify::channel();

        let inner = Arc::new(SidecarInner {
            client,
            keypair,
            ffs,
            state: StdMutex::new(state),
            buffer: StdMutex::new(None),
            dirty_tx,
            events: EventsBus::new(),
            flush_debounce,
            shutdown: NotifyOnce::new(),
        });

        let writer_task = SpTask::spawn(
            "sidecar-writer",
            writer_loop(Arc::clone(&inner), dirty_rx),
        );

        Self {
            inner,
            writer_task: StdMutex::new(Some(writer_task)),
        }
    }

    pub fn ipns_name(&self) -> IpnsName {
        self.inner.state.lock().unwrap().ipns_name
    }

    pub fn state(&self) -> SidecarState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn events(&self) -> &EventsBus<SidecarEvent> {
        &self.inner.events
    }

    /// Buffer a snapshot for publication. Returns immediately; rapid
    /// successive saves coalesce, latest wins.
    pub fn save(&self, snapshot: Value) {
        *self.inner.buffer.lock().unwrap() = Some(snapshot);
        self.inner.dirty_tx.send();
    }

    /// Resolve this identity's name record and fetch the current snapshot.
    ///
    /// [`SidecarError::NotFound`] is a legitimate state for an identity that
    /// has never published.
    #[instrument(skip_all, name = "(sidecar-load)")]
    pub async fn load(&self) -> Result<LoadedSnapshot, SidecarError> {
        let (ipns_name, local_sequence) = {
            let state = self.inner.state.lock().unwrap();
            (state.ipns_name, state.sequence_number)
        };

        let record = self
            .inner
            .client
            .resolve_name(&ipns_name)
            .await?
            .ok_or(SidecarError::NotFound)?;

        // A remote sequence behind what we've published means the name
        // service is serving a rollback.
        if record.sequence < local_sequence {
            return Err(SidecarError::SequenceRegressed {
                remote: record.sequence,
                local: local_sequence,
            });
        }

        let bytes = self.inner.client.fetch(&record.cid).await?;
        let data: Value = serde_json::from_slice(&bytes)
            .context("Snapshot is not JSON")
            .map_err(SidecarError::BadSnapshot)?;
        let meta = state::read_meta(&data).map_err(SidecarError::BadSnapshot)?;

        // Adopt remote progress so our next publish chains onto it. This is
        // what makes restore-from-mnemonic continue the cid chain instead of
        // forking it.
        {
            let mut state = self.inner.state.lock().unwrap();
            if record.sequence > state.sequence_number {
                state.sequence_number = record.sequence;
            }
            if meta.version > state.data_version {
                state.data_version = meta.version;
            }
            state.remote_cid = Some(record.cid);
            if let Err(err) = state.persist(&self.inner.ffs) {
                warn!("Could not persist sidecar state after load: {err:#}");
            }
        }

        Ok(LoadedSnapshot {
            data,
            cid: record.cid,
            sequence: record.sequence,
        })
    }

    /// Stop the writer task, draining any buffered snapshot first.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send();
        self.inner.dirty_tx.send();
        let task = self.writer_task.lock().unwrap().take();
        if let Some(task) = task {
            task.join_and_log().await;
        }
    }
}

async fn writer_loop<F: Ffs>(
    inner: Arc<SidecarInner<F>>,
    mut dirty_rx: notify::Receiver,
) {
    let shutdown = inner.shutdown.clone();
    'outer: loop {
        tokio::select! {
            () = shutdown.recv() => break,
            () = dirty_rx.recv() => (),
        }

        // Debounce: rapid saves coalesce into one flush.
        tokio::select! {
            () = shutdown.recv() => break,
            () = tokio::time::sleep(inner.flush_debounce) => (),
        }

        let mut backoff_iter = backoff::iter();
        loop {
            // Scoped take: holding the buffer lock across the flush would
            // block saves for the duration of the upload.
            let taken = inner.buffer.lock().unwrap().take();
            let snapshot = match taken {
                Some(snapshot) => snapshot,
                None => break,
            };
            match flush(&inner, snapshot.clone()).await {
                Ok((cid, version, sequence)) => {
                    info!("Published snapshot v{version} seq={sequence} cid={cid}");
                    inner.events.notify(SidecarEvent::PublishSucceeded {
                        cid,
                        version,
                        sequence,
                    });
                    backoff_iter = backoff::iter();
                }
                Err(err) => {
                    warn!("Snapshot publish failed: {err:#}");
                    inner.events.notify(SidecarEvent::PublishFailed {
                        message: format!("{err:#}"),
                    });
                    // Never advance on failure: put the snapshot back unless
                    // a newer save already replaced it.
                    inner
                        .buffer
                        .lock()
                        .unwrap()
                        .get_or_insert(snapshot);
                    let wait =
                        backoff_iter.next().expect("backoff iterator is infinite");
                    tokio::select! {
                        () = shutdown.recv() => break 'outer,
                        () = tokio::time::sleep(wait) => (),
                    }
                }
            }
        }
    }

    // Final synchronous drain on shutdown.
    let remaining = inner.buffer.lock().unwrap().take();
    if let Some(snapshot) = remaining {
        match flush(&inner, snapshot).await {
            Ok((cid, version, sequence)) => {
                info!("Drained snapshot v{version} seq={sequence} cid={cid}");
                inner.events.notify(SidecarEvent::PublishSucceeded {
                    cid,
                    version,
                    sequence,
                });
            }
            Err(err) => warn!("Final snapshot drain failed: {err:#}"),
        }
    }
    debug!("Sidecar writer exiting");
}

/// One publish attempt. State only advances after every step succeeds, so a
/// failure anywhere leaves `dataVersion` and `sequenceNumber` untouched.
async fn flush<F: Ffs>(
    inner: &SidecarInner<F>,
    mut snapshot: Value,
) -> Result<(Cid, u64, u64), SidecarError> {
    let (prior_sequence, prior_data_version, prior_remote_cid) = {
        let state = inner.state.lock().unwrap();
        (
            state.sequence_number,
            state.data_version,
            state.remote_cid,
        )
    };

    let mut meta = state::read_meta(&snapshot).map_err(SidecarError::BadSnapshot)?;
    // Merged snapshots may already carry a version ahead of ours; plain
    // saves get the next version in our chain. Bootstrap is version 1 with
    // no last_cid.
    meta.version = meta.version.max(prior_data_version + 1);
    meta.last_cid = prior_remote_cid;
    meta.updated_at = TimestampMs::now();
    state::write_meta(&mut snapshot, &meta);

    let bytes = serde_json::to_vec(&snapshot)
        .context("Snapshot serialization")
        .map_err(SidecarError::BadSnapshot)?;
    let cid = inner.client.upload(&bytes).await?;

    let sequence = prior_sequence + 1;
    let record = SignedNameRecord::sign(&inner.keypair, cid, sequence);
    inner.client.publish_name(&record).await?;

    // Success: advance and persist.
    {
        let mut state = inner.state.lock().unwrap();
        state.sequence_number = sequence;
        state.last_published_cid = Some(cid);
        state.remote_cid = Some(cid);
        state.data_version = meta.version;
        if let Err(err) = state.persist(&inner.ffs) {
            warn!("Could not persist sidecar state after publish: {err:#}");
        }
    }

    Ok((cid, meta.version, sequence))
}
