//! Flat file system abstraction.
//!
//! A "file system" here is a flat namespace of named byte blobs. The disk
//! impl stages writes in a hidden subdirectory and renames them into place so
//! a crash never leaves a half-written file; the in-memory impl backs tests.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use sphere_common::{hex, rng::RngExt, rng::SysRng};

/// Abstraction over a flat file system (no subdirs).
///
/// NOTE: Use [`io::ErrorKind::NotFound`] to detect a missing file.
pub trait Ffs: Send + Sync {
    fn read(&self, filename: &str) -> io::Result<Vec<u8>>;

    /// List all filenames, in unspecified order.
    fn read_dir(&self) -> io::Result<Vec<String>>;

    /// Atomically replace `filename` with `data`.
    fn write(&self, filename: &str, data: &[u8]) -> io::Result<()>;

    /// Append `data` to `filename`, creating it if missing. Appends are not
    /// atomic across crashes; callers must tolerate a truncated final entry.
    fn append(&self, filename: &str, data: &[u8]) -> io::Result<()>;

    /// Delete a file. Deleting a missing file is an error.
    fn delete(&self, filename: &str) -> io::Result<()>;

    /// Delete every file in the namespace.
    fn delete_all(&self) -> io::Result<()>;
}

impl<F: Ffs + ?Sized> Ffs for &F {
    fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        (**self).read(filename)
    }
    fn read_dir(&self) -> io::Result<Vec<String>> {
        (**self).read_dir()
    }
    fn write(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        (**self).write(filename, data)
    }
    fn append(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        (**self).append(filename, data)
    }
    fn delete(&self, filename: &str) -> io::Result<()> {
        (**self).delete(filename)
    }
    fn delete_all(&self) -> io::Result<()> {
        (**self).delete_all()
    }
}

impl<F: Ffs + ?Sized> Ffs for std::sync::Arc<F> {
    fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        (**self).read(filename)
    }
    fn read_dir(&self) -> io::Result<Vec<String>> {
        (**self).read_dir()
    }
    fn write(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        (**self).write(filename, data)
    }
    fn append(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        (**self).append(filename, data)
    }
    fn delete(&self, filename: &str) -> io::Result<()> {
        (**self).delete(filename)
    }
    fn delete_all(&self) -> io::Result<()> {
        (**self).delete_all()
    }
}

/// Disk-backed [`Ffs`].
pub struct DiskFs {
    /// Files are stored flat in this directory.
    base_dir: PathBuf,

    /// `{base_dir}/.write`
    ///
    /// Writes land here fully before being renamed to their final
    /// destination in `base_dir`. Staging inside `base_dir` keeps the rename
    /// on one filesystem, which is what makes it atomic.
    write_dir: PathBuf,
}

impl DiskFs {
    /// Open an [`DiskFs`] at `base_dir`, creating the directory (and any
    /// parents) if needed.
    pub fn create_dir_all(base_dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(base_dir.as_path())?;

        // Clean up the write dir from before; it may contain partial writes
        // from just before a crash.
        let write_dir = Self::write_dir_path(&base_dir);
        if write_dir.exists() {
            fs::remove_dir_all(write_dir.as_path())?;
        }
        fs::create_dir(write_dir.as_path())?;

        Ok(Self {
            base_dir,
            write_dir,
        })
    }

    fn write_dir_path(base_dir: &Path) -> PathBuf {
        base_dir.join(".write")
    }
}

impl Ffs for DiskFs {
    fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut file = fs::File::open(self.base_dir.join(filename))?;
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_dir(&self) -> io::Result<Vec<String>> {
        let mut filenames = Vec::new();
        for maybe_entry in self.base_dir.read_dir()? {
            let entry = maybe_entry?;
            if entry.file_type()?.is_file() {
                // Skip non-UTF-8 filenames; we never write them.
                if let Some(filename) = entry.file_name().to_str() {
                    filenames.push(filename.to_owned());
                }
            }
        }
        Ok(filenames)
    }

    fn write(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        let final_dest_path = self.base_dir.join(filename);

        // A random staging name so concurrent writers to the same file can't
        // step on each other's partial writes; last rename wins.
        let tmp_write_path = {
            let token = SysRng::new().gen_bytes16();
            self.write_dir.join(hex::encode(&token))
        };

        fs::write(tmp_write_path.as_path(), data)?;
        fs::rename(tmp_write_path.as_path(), final_dest_path)?;
        Ok(())
    }

    fn append(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base_dir.join(filename))?;
        file.write_all(data)
    }

    fn delete(&self, filename: &str) -> io::Result<()> {
        fs::remove_file(self.base_dir.join(filename))
    }

    fn delete_all(&self) -> io::Result<()> {
        for filename in self.read_dir()? {
            fs::remove_file(self.base_dir.join(filename))?;
        }
        Ok(())
    }
}

/// In-memory [`Ffs`] for tests and ephemeral wallets.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(filename: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {filename}"))
}

impl Ffs for MemFs {
    fn read(&self, filename: &str) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(filename)
            .cloned()
            .ok_or_else(|| not_found(filename))
    }

    fn read_dir(&self) -> io::Result<Vec<String>> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    fn write(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(filename.to_owned(), data.to_vec());
        Ok(())
    }

    fn append(&self, filename: &str, data: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(filename.to_owned())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn delete(&self, filename: &str) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(filename)
            .map(|_| ())
            .ok_or_else(|| not_found(filename))
    }

    fn delete_all(&self) -> io::Result<()> {
        self.files.lock().unwrap().clear();
        Ok(())
    }
}
