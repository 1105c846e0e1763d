//! Shared File Access
//!
//! A set file is shared by every process that opens it. Mutations happen
//! under an exclusive whole-file advisory lock, acquired by polling because
//! there is no cross-process wait primitive to block on. The first 16 bytes
//! (entry count and UUID) are memory-mapped so any process can notice
//! appends and rewrites without locking.
//!
//! Locks belong to the open file description, so two [`SharedFile`]s over
//! the same path contend with each other even inside one process.
//!
//! The file is never shortened below the 16-byte prefix while mapped.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::format::{decode_prefix, encode_prefix, write_at, FIXED_PREFIX_LEN};

/// Pause between two lock attempts
const LOCK_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// An open set file plus its mapped header prefix
pub struct SharedFile {
    file: File,
    prefix: Option<MmapMut>,
    path: PathBuf,
}

impl SharedFile {
    /// Open (creating if needed) the file at `path`
    ///
    /// The prefix is not mapped until [`SharedFile::map_prefix`] is called
    /// on a file that has a header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            file,
            prefix: None,
            path: path.to_path_buf(),
        })
    }

    /// Underlying file handle
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current physical length
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Map the 16-byte prefix; the file must already be that long
    pub fn map_prefix(&mut self) -> Result<()> {
        if self.prefix.is_some() {
            return Ok(());
        }
        if self.len()? < FIXED_PREFIX_LEN {
            return Err(Error::Format(format!(
                "{} is too short to hold a header",
                self.path.display()
            )));
        }
        // SAFETY: the mapping covers the fixed prefix only, and no code path
        // shrinks a set file below that length.
        let map = unsafe {
            MmapOptions::new()
                .len(FIXED_PREFIX_LEN as usize)
                .map_mut(&self.file)?
        };
        self.prefix = Some(map);
        Ok(())
    }

    /// Whether the prefix is mapped
    pub fn is_mapped(&self) -> bool {
        self.prefix.is_some()
    }

    /// `(entry_count, uuid)` as currently on disk, without locking
    ///
    /// `None` until the prefix is mapped.
    pub fn read_prefix(&self) -> Option<(u64, u64)> {
        self.prefix.as_ref().map(|map| decode_prefix(&map[..]))
    }

    /// Overwrite the prefix; call with the lock held
    pub fn write_prefix(&mut self, entry_count: u64, uuid: u64) -> Result<()> {
        let bytes = encode_prefix(entry_count, uuid);
        match self.prefix.as_mut() {
            Some(map) => map.copy_from_slice(&bytes),
            None => write_at(&self.file, 0, &bytes)?,
        }
        Ok(())
    }

    /// Take the exclusive lock, polling until it is free
    ///
    /// Logs a notice every `attention_span` of waiting; never gives up.
    /// Fails only if the OS locking call itself errors.
    pub fn lock(&self, attention_span: Duration) -> Result<()> {
        let span = attention_span.max(Duration::from_millis(1));
        let start = Instant::now();
        let mut next_notice = span;

        loop {
            match try_lock_exclusive(&self.file) {
                Ok(true) => {
                    if start.elapsed() >= span {
                        debug!(
                            file = %self.path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Acquired cache file lock"
                        );
                    }
                    return Ok(());
                }
                Ok(false) => {}
                Err(source) => {
                    return Err(Error::LockAcquisition {
                        path: self.path.display().to_string(),
                        source,
                    })
                }
            }

            let waited = start.elapsed();
            if waited >= next_notice {
                info!(
                    file = %self.path.display(),
                    waited_ms = waited.as_millis() as u64,
                    "Waiting for another process to release the cache file lock"
                );
                next_notice += span;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Flush the prefix and file data, then drop the lock
    pub fn unlock(&self) -> Result<()> {
        let flushed = self.flush();
        unlock(&self.file).map_err(|source| Error::LockAcquisition {
            path: self.path.display().to_string(),
            source,
        })?;
        flushed
    }

    fn flush(&self) -> Result<()> {
        if let Some(map) = self.prefix.as_ref() {
            map.flush_range(0, FIXED_PREFIX_LEN as usize)?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

/// One non-blocking attempt at the exclusive lock
///
/// `Ok(false)` means another handle holds it (or the call was interrupted)
/// and the caller should poll again.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.kind() == io::ErrorKind::Interrupted
        || err.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

fn unlock(file: &File) -> io::Result<()> {
    FileExt::unlock(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn scratch(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("nested").join("set.mrc")
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedFile::open(scratch(&dir)).unwrap();
        assert_eq!(shared.len().unwrap(), 0);
        assert!(!shared.is_mapped());
        assert_eq!(shared.read_prefix(), None);
    }

    #[test]
    fn test_map_requires_prefix_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut shared = SharedFile::open(scratch(&dir)).unwrap();
        assert!(shared.map_prefix().is_err());

        shared.write_prefix(3, 99).unwrap();
        shared.map_prefix().unwrap();
        assert_eq!(shared.read_prefix(), Some((3, 99)));
    }

    #[test]
    fn test_prefix_visible_to_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir);
        let mut writer = SharedFile::open(&path).unwrap();
        writer.write_prefix(0, 1).unwrap();
        writer.map_prefix().unwrap();

        let mut reader = SharedFile::open(&path).unwrap();
        reader.map_prefix().unwrap();

        writer.lock(Duration::from_secs(5)).unwrap();
        writer.write_prefix(5, 2).unwrap();
        writer.unlock().unwrap();

        assert_eq!(reader.read_prefix(), Some((5, 2)));
    }

    #[test]
    fn test_lock_excludes_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir);
        let first = SharedFile::open(&path).unwrap();
        let second = SharedFile::open(&path).unwrap();

        first.lock(Duration::from_secs(5)).unwrap();
        assert!(!try_lock_exclusive(second.file()).unwrap());

        first.unlock().unwrap();
        assert!(try_lock_exclusive(second.file()).unwrap());
        second.unlock().unwrap();
    }

    #[test]
    fn test_contention_is_retried_not_fatal() {
        assert!(is_contended(&fs4::lock_contended_error()));
        assert!(is_contended(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_contended(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_lock_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir);
        let holder = SharedFile::open(&path).unwrap();
        holder.lock(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let shared = SharedFile::open(&waiter_path).unwrap();
            shared.lock(Duration::from_millis(10)).unwrap();
            tx.send(()).unwrap();
            shared.unlock().unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        holder.unlock().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }
}
