//! Append-only JSON-lines logs over an [`Ffs`] file.
//!
//! One serialized record per line. Loads tolerate a truncated final line
//! (crash mid-append) by dropping it.

use std::io;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::ffs::Ffs;

/// Append a record as one line.
pub fn append<T: Serialize>(
    ffs: &dyn Ffs,
    filename: &str,
    record: &T,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(record).context("Failed to serialize record")?;
    line.push(b'\n');
    ffs.append(filename, &line)
        .with_context(|| format!("Failed to append to {filename}"))
}

/// Load all records. A missing file is an empty log.
pub fn load_all<T: DeserializeOwned>(
    ffs: &dyn Ffs,
    filename: &str,
) -> anyhow::Result<Vec<T>> {
    let buf = match ffs.read(filename) {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) =>
            return Err(err).with_context(|| format!("Failed to read {filename}")),
    };

    let mut out = Vec::new();
    for (idx, line) in buf.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<T>(line) {
            Ok(record) => out.push(record),
            // A torn tail from a crash mid-append is expected; anything else
            // in the middle of the log is worth a warning either way.
            Err(err) => warn!("{filename}:{idx}: dropping undecodable line: {err}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ffs::MemFs;

    #[test]
    fn append_then_load() {
        let ffs = MemFs::new();
        append(&ffs, "log", &1u32).unwrap();
        append(&ffs, "log", &2u32).unwrap();
        append(&ffs, "log", &3u32).unwrap();
        assert_eq!(load_all::<u32>(&ffs, "log").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn missing_file_is_empty() {
        let ffs = MemFs::new();
        assert_eq!(load_all::<u32>(&ffs, "log").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let ffs = MemFs::new();
        append(&ffs, "log", &1u32).unwrap();
        // Simulate a crash mid-append.
        ffs.append("log", b"{\"trunc").unwrap();
        assert_eq!(load_all::<u32>(&ffs, "log").unwrap(), vec![1]);
    }
}
