//! The token store: one file per live token, a "sent" archive, and the
//! append-only tombstone and history logs.

use std::{io, sync::Arc};

use anyhow::Context;
use sphere_common::ids::LocalTokenId;
use sphere_store::{jsonl, Ffs};
use tracing::warn;

use crate::{
    snapshot::{HistoryEntry, Tombstone},
    token::TokenRecord,
};

const LIVE_PREFIX: &str = "tok-";
const ARCHIVE_PREFIX: &str = "sent-";
const TOMBSTONE_LOG: &str = "tombstones.jsonl";
const HISTORY_LOG: &str = "history.jsonl";

/// A structurally broken record found while loading, kept for diagnostics.
#[derive(Clone, Debug)]
pub struct ValidationIssue {
    pub filename: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct TokenStore {
    ffs: Arc<dyn Ffs>,
}

impl TokenStore {
    pub fn new(ffs: Arc<dyn Ffs>) -> Self {
        Self { ffs }
    }

    fn live_filename(local_id: &LocalTokenId) -> String {
        format!("{LIVE_PREFIX}{local_id}.json")
    }

    fn archive_filename(local_id: &LocalTokenId) -> String {
        format!("{ARCHIVE_PREFIX}{local_id}.json")
    }

    /// Load every live record. Files that fail to decode or whose blob fails
    /// structural validation are dropped and reported, never silently kept.
    pub fn load_live(&self) -> anyhow::Result<(Vec<TokenRecord>, Vec<ValidationIssue>)> {
        let mut records = Vec::new();
        let mut issues = Vec::new();
        for filename in self.ffs.read_dir().context("Token dir listing failed")? {
            if !filename.starts_with(LIVE_PREFIX) {
                continue;
            }
            let buf = match self.ffs.read(&filename) {
                Ok(buf) => buf,
                Err(err) => {
                    issues.push(ValidationIssue {
                        filename,
                        reason: format!("read failed: {err}"),
                    });
                    continue;
                }
            };
            let record: TokenRecord = match serde_json::from_slice(&buf) {
                Ok(record) => record,
                Err(err) => {
                    warn!("Dropping undecodable token file {filename}: {err}");
                    issues.push(ValidationIssue {
                        filename,
                        reason: format!("decode failed: {err}"),
                    });
                    continue;
                }
            };
            if let Err(err) = record.blob.parse() {
                warn!("Dropping structurally invalid token {filename}: {err}");
                issues.push(ValidationIssue {
                    filename,
                    reason: format!("invalid blob: {err}"),
                });
                continue;
            }
            records.push(record);
        }
        Ok((records, issues))
    }

    /// Insert or update a live record.
    pub fn upsert_live(&self, record: &TokenRecord) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .context("Token record serialization")?;
        self.ffs
            .write(&Self::live_filename(&record.local_id), &json)
            .context("Token record write failed")
    }

    /// Remove a live record without archiving (merge removals).
    pub fn remove_live(&self, local_id: &LocalTokenId) -> anyhow::Result<()> {
        match self.ffs.delete(&Self::live_filename(local_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("Token record delete failed"),
        }
    }

    /// Move a record to the immutable "sent" archive.
    pub fn archive(&self, record: &TokenRecord) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .context("Token record serialization")?;
        self.ffs
            .write(&Self::archive_filename(&record.local_id), &json)
            .context("Archive write failed")?;
        self.remove_live(&record.local_id)
    }

    /// Load the archived ("Sent folder") records.
    pub fn load_archived(&self) -> anyhow::Result<Vec<TokenRecord>> {
        let mut records = Vec::new();
        for filename in self.ffs.read_dir().context("Token dir listing failed")? {
            if !filename.starts_with(ARCHIVE_PREFIX) {
                continue;
            }
            match self
                .ffs
                .read(&filename)
                .map_err(anyhow::Error::from)
                .and_then(|buf| {
                    serde_json::from_slice::<TokenRecord>(&buf).map_err(Into::into)
                }) {
                Ok(record) => records.push(record),
                Err(err) => warn!("Skipping archived file {filename}: {err:#}"),
            }
        }
        Ok(records)
    }

    pub fn append_tombstone(&self, tombstone: &Tombstone) -> anyhow::Result<()> {
        jsonl::append(&self.ffs, TOMBSTONE_LOG, tombstone)
    }

    pub fn load_tombstones(&self) -> anyhow::Result<Vec<Tombstone>> {
        jsonl::load_all(&self.ffs, TOMBSTONE_LOG)
    }

    pub fn append_history(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        jsonl::append(&self.ffs, HISTORY_LOG, entry)
    }

    pub fn load_history(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        jsonl::load_all(&self.ffs, HISTORY_LOG)
    }

    /// Rewrite the tombstone log wholesale (after a merge imports remote
    /// tombstones).
    pub fn replace_tombstones(&self, tombstones: &[Tombstone]) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for tombstone in tombstones {
            serde_json::to_writer(&mut buf, tombstone)
                .context("Tombstone serialization")?;
            buf.push(b'\n');
        }
        self.ffs
            .write(TOMBSTONE_LOG, &buf)
            .context("Tombstone log rewrite failed")
    }

    /// Rewrite the history log wholesale (after a merge).
    pub fn replace_history(&self, history: &[HistoryEntry]) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for entry in history {
            serde_json::to_writer(&mut buf, entry).context("History serialization")?;
            buf.push(b'\n');
        }
        self.ffs
            .write(HISTORY_LOG, &buf)
            .context("History log rewrite failed")
    }

    /// Wipe everything.
    pub fn clear(&self) -> anyhow::Result<()> {
        self.ffs.delete_all().context("Token store clear failed")
    }
}
