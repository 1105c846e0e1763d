//! Cache Set Engine
//!
//! One [`RaCacheSet`] owns one set file. Records are only ever appended;
//! superseded and deleted records are marked in place and left behind until
//! [`RaCacheSet::organise`] rewrites the file.
//!
//! Every operation first compares the mapped header prefix with what this
//! instance last saw. An unchanged prefix means the index is current and no
//! lock is taken. A grown entry count means another process appended, and
//! only the new tail is indexed. A new UUID means the file was rewritten,
//! and the index is rebuilt from scratch.
//!
//! Read paths never fail: errors are logged and reported as a miss.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::index::{key_hash, HashIndex, IndexEntry, KeyHasher};
use super::resident::{Residency, ResidentStore};
use super::stats::{ReportSchedule, SetCounters, SetStats};
use super::sync::SharedFile;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::format::{
    random_uuid, read_at, read_slot, write_at, write_entry_code, write_eof, EntryCode, FileHeader,
    RecordHeader, RecordSlot,
};
use crate::naming;
use crate::serializer::{JsonSerializer, Serializer};

/// Largest buffer used to move a record during compaction
const MOVE_CHUNK: u64 = 64 * 1024;

/// Outcome of compacting a set file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrganiseReport {
    pub entries_kept: u64,
    pub entries_removed: u64,
    pub bytes_freed: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl OrganiseReport {
    /// Add another report's counts to this one
    pub fn merge(&mut self, other: &OrganiseReport) {
        self.entries_kept += other.entries_kept;
        self.entries_removed += other.entries_removed;
        self.bytes_freed += other.bytes_freed;
        self.bytes_before += other.bytes_before;
        self.bytes_after += other.bytes_after;
    }
}

/// Mutable state, guarded by the set mutex
struct SetState<K, V> {
    file: Option<SharedFile>,
    /// Offset of the Eof marker, where the next record goes
    end: u64,
    /// Records (live or dead) this instance has accounted for
    entry_count: u64,
    uuid: u64,
    index: HashIndex,
    resident: ResidentStore<K, V>,
    schedule: ReportSchedule,
}

/// Disk-backed store of one primary set, optionally tagged
pub struct RaCacheSet<K, V, S = JsonSerializer> {
    cache_name: String,
    set_name: String,
    tag_name: Option<String>,
    path: PathBuf,
    config: Arc<CacheConfig>,
    serializer: Arc<S>,
    hasher: KeyHasher,
    counters: SetCounters,
    state: Mutex<SetState<K, V>>,
}

impl<K, V, S> RaCacheSet<K, V, S> {
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn tag_name(&self) -> Option<&str> {
        self.tag_name.as_deref()
    }

    /// Location of the set file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file is currently open
    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }
}

impl<K, V, S> RaCacheSet<K, V, S>
where
    K: Serialize + DeserializeOwned + PartialEq + Clone + Send + Sync,
    V: Serialize + DeserializeOwned + Clone + Send + Sync,
    S: Serializer,
{
    /// Create a set engine; the file is opened on first use
    pub fn new(
        cache_name: impl Into<String>,
        set_name: impl Into<String>,
        tag_name: Option<String>,
        config: Arc<CacheConfig>,
        serializer: Arc<S>,
    ) -> Self {
        let cache_name = cache_name.into();
        let set_name = set_name.into();
        let path = naming::set_file_path(&config.root, &cache_name, &set_name, tag_name.as_deref());

        let state = SetState {
            file: None,
            end: 0,
            entry_count: 0,
            uuid: 0,
            index: HashIndex::new(),
            resident: ResidentStore::new(config.resident_bytes),
            schedule: ReportSchedule::new(
                config.stats_interval,
                config.max_object_loss_rate,
                config.loss_warning_interval,
            ),
        };

        Self {
            cache_name,
            set_name,
            tag_name,
            path,
            config,
            serializer,
            hasher: key_hash,
            counters: SetCounters::new(),
            state: Mutex::new(state),
        }
    }

    /// Replace the key hash function
    ///
    /// Every process sharing the file must use the same function.
    pub fn with_hasher(mut self, hasher: KeyHasher) -> Self {
        self.hasher = hasher;
        self
    }

    // =========================================================================
    // Public Operations
    // =========================================================================

    /// Look up the object stored under `key`
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut st = self.state.lock();
        self.counters.record_attempt();

        let found = match self.try_get(&mut st, key) {
            Ok(found) => found,
            Err(e) => {
                warn!(file = %self.path.display(), error = %e, "Cache read failed, treating as a miss");
                None
            }
        };
        if found.is_none() {
            self.counters.record_miss();
        }

        self.check_reports(&mut st);
        found
    }

    /// Store `value` under `key`, superseding any earlier record
    ///
    /// Failures are logged and the write is dropped.
    pub fn put(&self, key: K, value: V) {
        let mut st = self.state.lock();
        if let Err(e) = self.try_put(&mut st, key, value) {
            warn!(
                file = %self.path.display(),
                error = %e,
                "Failed to add entry to cache file, the write is lost"
            );
        }
        self.check_reports(&mut st);
    }

    /// Mark the record for `key` deleted; returns whether one existed
    pub fn delete(&self, key: &K) -> bool {
        let mut st = self.state.lock();
        match self.try_delete(&mut st, key) {
            Ok(found) => found,
            Err(e) => {
                warn!(file = %self.path.display(), error = %e, "Failed to delete cache entry");
                false
            }
        }
    }

    /// Every live key, in no particular order
    pub fn get_all_keys(&self) -> Vec<K> {
        let mut st = self.state.lock();
        match self.try_get_all_keys(&mut st) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(file = %self.path.display(), error = %e, "Failed to list cache keys");
                Vec::new()
            }
        }
    }

    /// Rewrite the file in place without its dead records
    ///
    /// Holds the file lock for the whole pass, which reads the entire file.
    /// Other processes block meanwhile and rebuild their indexes afterwards.
    /// With `check_integrity`, live records whose packages no longer
    /// deserialize are dropped too. On failure the file is closed so the
    /// next operation reopens and reloads it.
    pub fn organise(&self, check_integrity: bool) -> Result<OrganiseReport> {
        let mut st = self.state.lock();
        let result = self.try_organise(&mut st, check_integrity);
        if let Err(e) = &result {
            error!(
                file = %self.path.display(),
                error = %e,
                "Organising cache file failed, file is now in an unknown state"
            );
            self.close(&mut st);
        }
        result
    }

    /// Reset the file to an empty header with a fresh UUID
    pub fn clear(&self) {
        let mut st = self.state.lock();
        if let Err(e) = self.try_clear(&mut st) {
            error!(file = %self.path.display(), error = %e, "Failed to empty cache file");
            self.close(&mut st);
        }
    }

    /// Pick up appends and rewrites made by other processes
    pub fn fast_sync(&self) {
        let mut st = self.state.lock();
        if let Err(e) = self.sync(&mut st) {
            warn!(file = %self.path.display(), error = %e, "Cache file sync failed");
        }
    }

    /// Drop every resident key and object; the index stays
    pub fn clear_memory(&self) {
        self.state.lock().resident.clear();
    }

    /// Current statistics
    pub fn stats(&self) -> SetStats {
        let st = self.state.lock();
        self.snapshot(&st)
    }

    /// Log current statistics
    pub fn log_stats(&self) {
        let st = self.state.lock();
        log_snapshot(&self.snapshot(&st));
    }

    // =========================================================================
    // Operation Bodies
    // =========================================================================

    fn try_get(&self, st: &mut SetState<K, V>, key: &K) -> Result<Option<Arc<V>>> {
        self.sync(st)?;
        let hash = (self.hasher)(&self.serializer.serialize(key)?);

        let entry = match self.find(st, hash, key, false)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        match st.resident.object(entry.offset) {
            Residency::Resident(object) => {
                self.counters.record_memory_hit();
                return Ok(Some(object));
            }
            Residency::Lost => self.counters.record_object_lost(),
            Residency::NotLoaded => {}
        }

        match self.load_object(st, hash, &entry) {
            Ok(Some(object)) => {
                self.counters.record_disk_hit();
                Ok(Some(object))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(
                    file = %self.path.display(),
                    offset = entry.offset,
                    error = %e,
                    "Failed to load cached object; organise with integrity checking drops corrupt packages"
                );
                Ok(None)
            }
        }
    }

    fn try_put(&self, st: &mut SetState<K, V>, key: K, value: V) -> Result<()> {
        self.ensure_open(st)?;

        let key_package = self.serializer.serialize(&key)?;
        let object_package = self.serializer.serialize(&value)?;
        let key_len = package_len(&key_package)?;
        let object_len = package_len(&object_package)?;
        let hash = (self.hasher)(&key_package);

        self.with_lock(st, move |set, st| {
            set.catch_up(st)?;

            if let Some(old) = set.find(st, hash, &key, true)? {
                write_entry_code(open_file(&st.file)?.file(), old.offset, EntryCode::Overwritten)?;
            }

            let offset = st.end;
            let header = RecordHeader::valid(hash, key_len, object_len);
            let mut record = Vec::with_capacity(header.record_len() as usize);
            record.extend_from_slice(&header.encode());
            record.extend_from_slice(&key_package);
            record.extend_from_slice(&object_package);

            let file = open_file_mut(&mut st.file)?;
            write_at(file.file(), offset, &record)?;
            let end = offset + header.record_len();
            write_eof(file.file(), end)?;
            file.write_prefix(st.entry_count + 1, st.uuid)?;

            st.end = end;
            st.entry_count += 1;
            let entry = IndexEntry {
                offset,
                key_len,
                object_len,
            };
            if st.index.insert(hash, entry) {
                set.counters.record_collision();
            }
            st.resident.insert_key(offset, Arc::new(key), key_len as u64);
            st.resident.insert_object(offset, Arc::new(value), object_len as u64);
            Ok(())
        })
    }

    fn try_delete(&self, st: &mut SetState<K, V>, key: &K) -> Result<bool> {
        self.ensure_open(st)?;
        let hash = (self.hasher)(&self.serializer.serialize(key)?);

        self.with_lock(st, |set, st| {
            set.catch_up(st)?;
            match set.find(st, hash, key, true)? {
                Some(old) => {
                    write_entry_code(open_file(&st.file)?.file(), old.offset, EntryCode::Deleted)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn try_get_all_keys(&self, st: &mut SetState<K, V>) -> Result<Vec<K>> {
        self.sync(st)?;

        let entries: Vec<(u32, IndexEntry)> = st.index.iter().map(|(h, e)| (h, *e)).collect();
        let mut keys = Vec::with_capacity(entries.len());

        let SetState {
            file,
            index,
            resident,
            ..
        } = st;
        let file = open_file(file)?;

        for (hash, entry) in entries {
            match self.materialize_key(file, resident, &entry) {
                Ok(Some(key)) => keys.push(Arc::unwrap_or_clone(key)),
                Ok(None) => {
                    index.remove_offset(hash, entry.offset);
                }
                Err(e) => warn!(
                    file = %self.path.display(),
                    offset = entry.offset,
                    error = %e,
                    "Failed to load cached key, skipping it"
                ),
            }
        }
        Ok(keys)
    }

    fn try_organise(&self, st: &mut SetState<K, V>, check_integrity: bool) -> Result<OrganiseReport> {
        if st.file.is_none() {
            // the compaction pass reads the whole index anyway
            st.file = Some(SharedFile::open(&self.path)?);
        }
        self.with_lock(st, |set, st| {
            if open_file(&st.file)?.len()? == 0 {
                set.create_header(st)?;
                return Ok(OrganiseReport::default());
            }
            set.compact(st, check_integrity)
        })
    }

    fn try_clear(&self, st: &mut SetState<K, V>) -> Result<()> {
        if st.file.is_none() {
            st.file = Some(SharedFile::open(&self.path)?);
        }
        self.with_lock(st, |set, st| set.create_header(st))?;
        info!(file = %self.path.display(), "Emptied cache file");
        Ok(())
    }

    // =========================================================================
    // File Synchronization
    // =========================================================================

    /// Open and index the file if this instance has not yet done so
    fn ensure_open(&self, st: &mut SetState<K, V>) -> Result<()> {
        if st.file.is_some() {
            return Ok(());
        }
        st.file = Some(SharedFile::open(&self.path)?);

        let loaded = self.with_lock(st, |set, st| {
            if open_file(&st.file)?.len()? == 0 {
                set.create_header(st)
            } else {
                set.load_all(st)
            }
        });
        if let Err(e) = loaded {
            self.close(st);
            return Err(e);
        }
        Ok(())
    }

    /// Fast change check, catching up under the lock only if needed
    fn sync(&self, st: &mut SetState<K, V>) -> Result<()> {
        self.ensure_open(st)?;
        let changed = match st.file.as_ref().and_then(SharedFile::read_prefix) {
            Some((count, uuid)) => count != st.entry_count || uuid != st.uuid,
            None => true,
        };
        if !changed {
            return Ok(());
        }
        self.with_lock(st, |set, st| set.catch_up(st))
    }

    /// Reconcile the index with the file; call with the lock held
    fn catch_up(&self, st: &mut SetState<K, V>) -> Result<()> {
        let (count, uuid) = open_file(&st.file)?
            .read_prefix()
            .ok_or_else(|| Error::Internal("cache file header is not mapped".into()))?;

        if uuid != st.uuid {
            info!(
                file = %self.path.display(),
                old_uuid = st.uuid,
                new_uuid = uuid,
                "Cache file was rewritten, reloading index"
            );
            self.load_all(st)
        } else if count < st.entry_count {
            info!(
                file = %self.path.display(),
                count,
                known = st.entry_count,
                "Cache file lost entries, reloading index"
            );
            self.load_all(st)
        } else if count > st.entry_count {
            self.load_remaining(st, count)
        } else {
            Ok(())
        }
    }

    /// Run `op` with the file lock held, flushing and releasing afterwards
    fn with_lock<T>(
        &self,
        st: &mut SetState<K, V>,
        op: impl FnOnce(&Self, &mut SetState<K, V>) -> Result<T>,
    ) -> Result<T> {
        open_file(&st.file)?.lock(self.config.attention_span)?;

        let result = op(self, st);

        // a file closed by `op` released its lock when dropped
        let released = match st.file.as_ref() {
            Some(file) => file.unlock(),
            None => Ok(()),
        };
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                warn!(file = %self.path.display(), error = %release, "Failed to release cache file lock");
                Err(e)
            }
        }
    }

    fn close(&self, st: &mut SetState<K, V>) {
        st.file = None;
        st.index.clear();
        st.resident.clear();
        st.end = 0;
        st.entry_count = 0;
        st.uuid = 0;
    }

    // =========================================================================
    // Header and Index Loading
    // =========================================================================

    /// Write a fresh empty file; call with the lock held
    fn create_header(&self, st: &mut SetState<K, V>) -> Result<()> {
        let header = FileHeader::new(&self.cache_name, &self.set_name, self.tag_name.as_deref());
        let bytes = header.encode();
        let len = bytes.len() as u64;

        let file = open_file_mut(&mut st.file)?;
        write_at(file.file(), 0, &bytes)?;
        write_eof(file.file(), len)?;
        file.file().set_len(len + 1)?;
        file.map_prefix()?;

        st.index.clear();
        st.resident.clear();
        st.end = len;
        st.entry_count = 0;
        st.uuid = header.uuid;

        debug!(file = %self.path.display(), uuid = header.uuid, "Created cache file header");
        Ok(())
    }

    /// Rebuild the index from the header on; call with the lock held
    fn load_all(&self, st: &mut SetState<K, V>) -> Result<()> {
        let file = open_file_mut(&mut st.file)?;
        let (header, header_len) = read_header(file.file())?;
        file.map_prefix()?;

        info!(
            file = %self.path.display(),
            entries = header.entry_count,
            uuid = header.uuid,
            "Loading cache index"
        );
        self.check_header_names(&header);

        st.index.clear();
        st.resident.clear();
        st.uuid = header.uuid;
        st.end = header_len;
        st.entry_count = 0;
        self.load_remaining(st, header.entry_count)
    }

    /// Index records from the last known end on; call with the lock held
    ///
    /// A corrupt or truncated record ends the scan. The file is cut back to
    /// the last good record so later appends land on a clean tail.
    fn load_remaining(&self, st: &mut SetState<K, V>, claimed: u64) -> Result<()> {
        let file = open_file(&st.file)?;
        let len = file.len()?;

        let mut offset = st.end;
        let mut found = 0u64;
        let stopped = loop {
            let scanned = match scan_slot(file.file(), offset, len) {
                Ok(scanned) => scanned,
                Err(e) => {
                    // keep what was indexed so far consistent and leave the file alone
                    st.end = offset;
                    st.entry_count += found;
                    return Err(e);
                }
            };
            match scanned {
                Scanned::Record(header) => {
                    if header.code == EntryCode::Valid {
                        let entry = IndexEntry {
                            offset,
                            key_len: header.key_len,
                            object_len: header.object_len,
                        };
                        if st.index.insert(header.key_hash, entry) {
                            self.counters.record_collision();
                        }
                    }
                    offset += header.record_len();
                    found += 1;
                }
                Scanned::End => break None,
                Scanned::Corrupt(e) => break Some(e),
            }
        };

        st.end = offset;
        st.entry_count += found;

        if let Some(e) = stopped {
            warn!(
                file = %self.path.display(),
                offset,
                entries = st.entry_count,
                error = %e,
                "Corrupt cache record, truncating file here and dropping all further entries"
            );
            let file = open_file_mut(&mut st.file)?;
            write_eof(file.file(), offset)?;
            file.file().set_len(offset + 1)?;
            file.write_prefix(st.entry_count, st.uuid)?;
            return Ok(());
        }

        if st.entry_count != claimed {
            warn!(
                file = %self.path.display(),
                found = st.entry_count,
                claimed,
                "Loaded entry count does not match the header"
            );
        }
        Ok(())
    }

    fn check_header_names(&self, header: &FileHeader) {
        if header.cache_name != self.cache_name {
            warn!(
                file = %self.path.display(),
                stored = %header.cache_name,
                "Cache name inside the file does not match its file name"
            );
        }
        if header.set_name != self.set_name {
            warn!(
                file = %self.path.display(),
                stored = %header.set_name,
                "Set name inside the file does not match its file name"
            );
        }
        if header.tag_name != self.tag_name {
            warn!(
                file = %self.path.display(),
                stored = ?header.tag_name,
                "Tag inside the file does not match its file name"
            );
        }
    }

    // =========================================================================
    // Lookup and Payload Loading
    // =========================================================================

    /// Find the live record for `key`, optionally unlinking it
    ///
    /// Every match re-reads its entry code, resident or not. Matches whose
    /// record another process has since marked dead are dropped from the
    /// index and the search continues down the chain.
    fn find(
        &self,
        st: &mut SetState<K, V>,
        hash: u32,
        key: &K,
        remove: bool,
    ) -> Result<Option<IndexEntry>> {
        let SetState {
            file,
            index,
            resident,
            ..
        } = st;
        let file = open_file(file)?;

        loop {
            let found = index.lookup(hash, key, false, |entry| {
                self.materialize_key(file, resident, entry)
            });
            let entry = match found {
                Some(entry) => entry,
                None => return Ok(None),
            };

            if record_is_live(file.file(), entry.offset)? {
                if remove {
                    index.remove_offset(hash, entry.offset);
                    resident.forget(entry.offset);
                }
                return Ok(Some(entry));
            }

            debug!(
                file = %self.path.display(),
                offset = entry.offset,
                "Record was superseded elsewhere, dropping it from the index"
            );
            index.remove_offset(hash, entry.offset);
            resident.forget(entry.offset);
        }
    }

    /// Key of `entry`, from memory or disk; `None` if the record is dead
    fn materialize_key(
        &self,
        file: &SharedFile,
        resident: &mut ResidentStore<K, V>,
        entry: &IndexEntry,
    ) -> Result<Option<Arc<K>>> {
        match resident.key(entry.offset) {
            Residency::Resident(key) => return Ok(Some(key)),
            Residency::Lost => self.counters.record_key_lost(),
            Residency::NotLoaded => {}
        }

        let package = match read_live_package(file.file(), entry.offset, entry.key_offset(), entry.key_len)? {
            Some(package) => package,
            None => {
                resident.forget(entry.offset);
                return Ok(None);
            }
        };
        let key: Arc<K> = Arc::new(self.serializer.deserialize(&package)?);
        resident.insert_key(entry.offset, Arc::clone(&key), entry.key_len as u64);
        Ok(Some(key))
    }

    fn load_object(
        &self,
        st: &mut SetState<K, V>,
        hash: u32,
        entry: &IndexEntry,
    ) -> Result<Option<Arc<V>>> {
        let file = open_file(&st.file)?;
        let package =
            match read_live_package(file.file(), entry.offset, entry.object_offset(), entry.object_len)? {
                Some(package) => package,
                None => {
                    st.index.remove_offset(hash, entry.offset);
                    st.resident.forget(entry.offset);
                    return Ok(None);
                }
            };
        let object: Arc<V> = Arc::new(self.serializer.deserialize(&package)?);
        st.resident
            .insert_object(entry.offset, Arc::clone(&object), entry.object_len as u64);
        Ok(Some(object))
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Slide every live record down over the dead ones; call with the lock held
    fn compact(&self, st: &mut SetState<K, V>, check_integrity: bool) -> Result<OrganiseReport> {
        let file = open_file_mut(&mut st.file)?;
        let (header, header_len) = read_header(file.file())?;
        file.map_prefix()?;
        let bytes_before = file.len()?;
        let claimed = header.entry_count;

        info!(
            file = %self.path.display(),
            entries = claimed,
            uuid = header.uuid,
            "Organising cache file"
        );

        let handle = file.file();
        let mut read = header_len;
        let mut write = header_len;
        let mut kept = 0u64;
        let mut removed = 0u64;
        let mut progress = Progress::new(claimed);

        loop {
            let record = match scan_slot(handle, read, bytes_before)? {
                Scanned::Record(record) => record,
                Scanned::End => break,
                Scanned::Corrupt(e) => {
                    warn!(
                        file = %self.path.display(),
                        offset = read,
                        kept,
                        error = %e,
                        "Corrupt cache record while organising, truncating file here"
                    );
                    break;
                }
            };
            let len = record.record_len();

            let keep = record.code == EntryCode::Valid
                && (!check_integrity || self.packages_intact(handle, read, &record)?);
            if keep {
                if write != read {
                    move_record(handle, read, write, len)?;
                }
                write += len;
                kept += 1;
            } else {
                removed += 1;
            }
            read += len;

            if let Some(percent) = progress.advance(kept + removed) {
                debug!(file = %self.path.display(), percent, "Organising cache file");
            }
        }

        write_eof(handle, write)?;
        handle.set_len(write + 1)?;
        let uuid = random_uuid();
        file.write_prefix(kept, uuid)?;

        let report = OrganiseReport {
            entries_kept: kept,
            entries_removed: removed,
            bytes_freed: bytes_before.saturating_sub(write + 1),
            bytes_before,
            bytes_after: write + 1,
        };
        info!(
            file = %self.path.display(),
            claimed,
            found = kept + removed,
            bytes_read = read,
            removed,
            bytes_freed = report.bytes_freed,
            kept,
            bytes_kept = write,
            old_uuid = header.uuid,
            new_uuid = uuid,
            "Organised cache file"
        );

        self.load_all(st)?;
        Ok(report)
    }

    /// Whether both packages of a live record deserialize
    ///
    /// I/O errors are returned rather than counted against the record.
    fn packages_intact(&self, file: &File, offset: u64, record: &RecordHeader) -> Result<bool> {
        let key_offset = RecordHeader::key_offset(offset);
        let check = || -> Result<()> {
            let key = read_package(file, key_offset, record.key_len)?;
            self.serializer.deserialize::<K>(&key)?;
            let object = read_package(file, key_offset + record.key_len as u64, record.object_len)?;
            self.serializer.deserialize::<V>(&object)?;
            Ok(())
        };
        match check() {
            Ok(()) => Ok(true),
            Err(Error::Io(e)) => Err(Error::Io(e)),
            Err(e) => {
                warn!(
                    file = %self.path.display(),
                    offset,
                    error = %e,
                    "Package integrity check failed, dropping entry"
                );
                Ok(false)
            }
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    fn snapshot(&self, st: &SetState<K, V>) -> SetStats {
        let mut stats = SetStats {
            cache_name: self.cache_name.clone(),
            set_name: self.set_name.clone(),
            tag_name: self.tag_name.clone(),
            entries: st.index.len() as u64,
            file_entries: st.entry_count,
            file_bytes: st
                .file
                .as_ref()
                .and_then(|f| f.len().ok())
                .unwrap_or(0),
            resident_keys: st.resident.resident_keys() as u64,
            resident_key_bytes: st.resident.key_bytes(),
            resident_objects: st.resident.resident_objects() as u64,
            resident_object_bytes: st.resident.object_bytes(),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }

    fn check_reports(&self, st: &mut SetState<K, V>) {
        let now = Instant::now();
        if let Some(rate) = st.schedule.loss_warning(&self.counters, now) {
            warn!(
                file = %self.path.display(),
                loss_rate = rate,
                "Cache is losing many objects from memory, consider raising minerva.cache.residentBytes"
            );
            log_snapshot(&self.snapshot(st));
        } else if st.schedule.dump_due(now) {
            log_snapshot(&self.snapshot(st));
        }
    }
}

fn log_snapshot(stats: &SetStats) {
    info!(
        cache = %stats.cache_name,
        set = %stats.set_name,
        tag = ?stats.tag_name,
        entries = stats.entries,
        file_entries = stats.file_entries,
        resident_keys = stats.resident_keys,
        resident_key_kb = stats.resident_key_bytes / 1024,
        resident_objects = stats.resident_objects,
        resident_object_kb = stats.resident_object_bytes / 1024,
        attempts = stats.attempts,
        misses = stats.misses,
        hits_from_memory = stats.hits_from_memory,
        hits_from_disk = stats.hits_from_disk,
        keys_lost = stats.keys_lost,
        objects_lost = stats.objects_lost,
        collisions = stats.collisions,
        "Cache set statistics"
    );
}

// =============================================================================
// File Helpers
// =============================================================================

fn open_file(file: &Option<SharedFile>) -> Result<&SharedFile> {
    file.as_ref()
        .ok_or_else(|| Error::Internal("cache file is not open".into()))
}

fn open_file_mut(file: &mut Option<SharedFile>) -> Result<&mut SharedFile> {
    file.as_mut()
        .ok_or_else(|| Error::Internal("cache file is not open".into()))
}

fn read_header(file: &File) -> Result<(FileHeader, u64)> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(0))?;
    FileHeader::read_from(BufReader::new(handle))
}

fn package_len(package: &[u8]) -> Result<u32> {
    u32::try_from(package.len()).map_err(|_| Error::PackageTooLarge {
        size: package.len(),
    })
}

fn record_is_live(file: &File, offset: u64) -> Result<bool> {
    let mut code = [0u8; 1];
    if read_at(file, offset, &mut code)? == 0 {
        return Err(Error::corrupt(offset, "record lies beyond end of file"));
    }
    match EntryCode::from_byte(code[0]) {
        Some(EntryCode::Valid) => Ok(true),
        Some(c) if c.is_dead() => Ok(false),
        _ => Err(Error::corrupt(
            offset,
            format!("expected a live record, found code {:#04x}", code[0]),
        )),
    }
}

fn read_package(file: &File, offset: u64, len: u32) -> Result<Vec<u8>> {
    let mut package = vec![0u8; len as usize];
    if read_at(file, offset, &mut package)? < package.len() {
        return Err(Error::corrupt(offset, "package runs past end of file"));
    }
    Ok(package)
}

/// Read a package, or `None` if its record has been marked dead
fn read_live_package(
    file: &File,
    record_offset: u64,
    offset: u64,
    len: u32,
) -> Result<Option<Vec<u8>>> {
    if !record_is_live(file, record_offset)? {
        return Ok(None);
    }
    read_package(file, offset, len).map(Some)
}

/// Copy a record to a lower offset, one chunk at a time
///
/// Chunks go front to back, which is safe because `to < from`.
fn move_record(file: &File, from: u64, to: u64, len: u64) -> Result<()> {
    let mut buf = vec![0u8; len.min(MOVE_CHUNK) as usize];
    let mut done = 0u64;
    while done < len {
        let chunk = (len - done).min(MOVE_CHUNK) as usize;
        if read_at(file, from + done, &mut buf[..chunk])? < chunk {
            return Err(Error::corrupt(from, "record shrank while organising"));
        }
        write_at(file, to + done, &buf[..chunk])?;
        done += chunk as u64;
    }
    Ok(())
}

/// Outcome of inspecting one slot during a scan
#[derive(Debug)]
enum Scanned {
    Record(RecordHeader),
    End,
    /// Unreadable record; the scan stops and the tail is cut here
    Corrupt(Error),
}

/// Inspect the slot at `offset`, separating corruption from I/O failure
fn scan_slot(file: &File, offset: u64, file_len: u64) -> Result<Scanned> {
    match read_slot(file, offset, file_len) {
        Ok(RecordSlot::Record(header)) => Ok(Scanned::Record(header)),
        Ok(RecordSlot::Eof) | Ok(RecordSlot::EndOfFile) => Ok(Scanned::End),
        Err(e @ Error::CorruptRecord { .. }) => Ok(Scanned::Corrupt(e)),
        Err(e) => Err(e),
    }
}

/// Reports every tenth of the claimed record count
struct Progress {
    total: u64,
    next: u64,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self { total, next: 10 }
    }

    fn advance(&mut self, parsed: u64) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let percent = parsed * 100 / self.total;
        if percent >= self.next {
            self.next = (percent / 10 + 1) * 10;
            Some(percent)
        } else {
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    type TestSet = RaCacheSet<String, Vec<u32>>;

    fn config(dir: &tempfile::TempDir) -> Arc<CacheConfig> {
        Arc::new(CacheConfig {
            stats_interval: None,
            ..CacheConfig::with_root(dir.path())
        })
    }

    fn open_set(config: &Arc<CacheConfig>, tag: Option<&str>) -> TestSet {
        RaCacheSet::new(
            "mag",
            "coils",
            tag.map(str::to_string),
            Arc::clone(config),
            Arc::new(JsonSerializer),
        )
    }

    #[test]
    fn test_lazy_open() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        assert!(!set.is_open());
        assert!(!set.path().exists());

        assert_eq!(set.get(&"missing".to_string()), None);
        assert!(set.is_open());

        let bytes = std::fs::read(set.path()).unwrap();
        let (header, len) = FileHeader::decode(&bytes).unwrap();
        assert_eq!(header.entry_count, 0);
        assert_eq!(header.set_name, "coils");
        assert_eq!(bytes.len() as u64, len + 1);
        assert_eq!(bytes[len as usize], EntryCode::Eof.as_byte());
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);

        set.put("a".into(), vec![1, 2, 3]);
        assert_eq!(set.get(&"a".to_string()).as_deref(), Some(&vec![1, 2, 3]));

        assert!(set.delete(&"a".to_string()));
        assert!(!set.delete(&"a".to_string()));
        assert_eq!(set.get(&"a".to_string()), None);

        let stats = set.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.file_entries, 1);
        assert_eq!(stats.hits_from_memory, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_header_count_tracks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        set.put("a".into(), vec![1]);
        set.put("a".into(), vec![2]);
        set.put("b".into(), vec![3]);

        let bytes = std::fs::read(set.path()).unwrap();
        let (header, _) = FileHeader::decode(&bytes).unwrap();
        assert_eq!(header.entry_count, 3);
        assert_eq!(*bytes.last().unwrap(), EntryCode::Eof.as_byte());
    }

    #[test]
    fn test_reads_from_disk_after_memory_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        set.put("a".into(), vec![9; 16]);

        set.clear_memory();
        assert_eq!(set.get(&"a".to_string()).as_deref(), Some(&vec![9; 16]));
        assert_eq!(set.stats().hits_from_disk, 1);

        assert_eq!(set.get(&"a".to_string()).as_deref(), Some(&vec![9; 16]));
        assert_eq!(set.stats().hits_from_memory, 1);
    }

    #[test]
    fn test_tiny_budget_counts_lost_objects() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(CacheConfig {
            resident_bytes: 12,
            stats_interval: None,
            ..CacheConfig::with_root(dir.path())
        });
        let set = open_set(&config, None);
        set.put("a".into(), vec![1]);
        set.put("b".into(), vec![2]);
        set.put("c".into(), vec![3]);

        for key in ["a", "b", "c"] {
            assert!(set.get(&key.to_string()).is_some());
        }
        assert!(set.stats().objects_lost > 0);
    }

    #[test]
    fn test_delete_seen_by_other_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let first = open_set(&config, None);
        let second = open_set(&config, None);

        first.put("a".into(), vec![1]);
        assert!(second.get(&"a".to_string()).is_some());

        // no append, so only the on-disk entry code reveals the delete
        assert!(first.delete(&"a".to_string()));
        assert_eq!(second.get(&"a".to_string()), None);
    }

    #[test]
    fn test_overwrite_by_other_instance_not_served_stale() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let first = open_set(&config, None);
        let second = open_set(&config, None);

        first.put("a".into(), vec![1]);
        assert_eq!(second.get(&"a".to_string()).as_deref(), Some(&vec![1]));

        first.put("a".into(), vec![2]);
        assert_eq!(second.get(&"a".to_string()).as_deref(), Some(&vec![2]));
        assert_eq!(second.get_all_keys(), vec!["a".to_string()]);
    }

    #[test]
    fn test_get_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        for key in ["x", "y", "z"] {
            set.put(key.into(), vec![]);
        }
        set.delete(&"y".to_string());
        set.clear_memory();

        let mut keys = set.get_all_keys();
        keys.sort();
        assert_eq!(keys, vec!["x".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_clear_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let set = open_set(&config, Some("t1"));
        set.put("a".into(), vec![1]);
        let other = open_set(&config, Some("t1"));
        assert!(other.get(&"a".to_string()).is_some());

        set.clear();
        assert_eq!(set.get(&"a".to_string()), None);
        assert_eq!(other.get(&"a".to_string()), None);
        assert_eq!(set.stats().file_entries, 0);
    }

    #[test]
    fn test_organise_unopened_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        let report = set.organise(false).unwrap();
        assert_eq!(report, OrganiseReport::default());
        assert!(set.path().exists());
    }

    #[test]
    fn test_organise_report() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        set.put("a".into(), vec![1]);
        set.put("a".into(), vec![2]);
        set.put("b".into(), vec![3]);
        set.delete(&"b".to_string());
        set.put("c".into(), vec![4]);

        let before = std::fs::metadata(set.path()).unwrap().len();
        let report = set.organise(false).unwrap();
        assert_eq!(report.entries_kept, 2);
        assert_eq!(report.entries_removed, 2);
        assert_eq!(report.bytes_before, before);
        assert_eq!(report.bytes_after, std::fs::metadata(set.path()).unwrap().len());
        assert_eq!(report.bytes_freed, before - report.bytes_after);

        assert_eq!(set.get(&"a".to_string()).as_deref(), Some(&vec![2]));
        assert_eq!(set.get(&"c".to_string()).as_deref(), Some(&vec![4]));
        assert_eq!(set.get(&"b".to_string()), None);
        assert!(set.is_open());
    }

    #[test]
    fn test_organise_integrity_drops_undecodable_objects() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        // same file, but the stored objects are strings rather than numbers
        let writer: RaCacheSet<String, String> = RaCacheSet::new(
            "mag",
            "coils",
            None,
            Arc::clone(&config),
            Arc::new(JsonSerializer),
        );
        writer.put("a".into(), "not numbers".into());
        drop(writer);

        let set = open_set(&config, None);
        set.put("b".into(), vec![1]);
        assert_eq!(set.get(&"a".to_string()), None);

        let report = set.organise(true).unwrap();
        assert_eq!(report.entries_kept, 1);
        assert_eq!(report.entries_removed, 1);
        assert_eq!(set.get(&"b".to_string()).as_deref(), Some(&vec![1]));
    }

    #[test]
    fn test_corrupt_tail_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let set = open_set(&config, None);
        set.put("a".into(), vec![1]);
        set.put("b".into(), vec![2]);
        let path = set.path().to_path_buf();
        drop(set);

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();
        drop(file);

        let set = open_set(&config, None);
        assert!(set.get(&"a".to_string()).is_some());
        assert_eq!(set.get(&"b".to_string()), None);

        let bytes = std::fs::read(&path).unwrap();
        let (header, _) = FileHeader::decode(&bytes).unwrap();
        assert_eq!(header.entry_count, 1);
        assert_eq!(*bytes.last().unwrap(), EntryCode::Eof.as_byte());

        // appends land on the repaired tail
        set.put("c".into(), vec![3]);
        drop(set);
        let set = open_set(&config, None);
        assert_eq!(set.get(&"c".to_string()).as_deref(), Some(&vec![3]));
    }

    #[test]
    fn test_header_name_mismatch_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let set = open_set(&config, None);
        set.put("a".into(), vec![1]);
        let path = set.path().to_path_buf();
        drop(set);

        // reuse the file under another tag
        let renamed = naming::set_file_path(&config.root, "mag", "coils", Some("moved"));
        std::fs::rename(&path, &renamed).unwrap();

        let set = open_set(&config, Some("moved"));
        assert_eq!(set.get(&"a".to_string()).as_deref(), Some(&vec![1]));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let set = open_set(&config, None);
        std::fs::create_dir_all(set.path().parent().unwrap()).unwrap();
        std::fs::write(set.path(), vec![0u8; 64]).unwrap();

        set.put("a".into(), vec![1]);
        assert_eq!(set.get(&"a".to_string()), None);
        assert!(!set.is_open());
    }

    #[test]
    fn test_scan_separates_io_errors_from_corruption() {
        use assert_matches::assert_matches;

        let dir = tempfile::tempdir().unwrap();
        let set = open_set(&config(&dir), None);
        set.put("a".into(), vec![1]);
        let path = set.path().to_path_buf();
        drop(set);

        let bytes = std::fs::read(&path).unwrap();
        let (_, header_len) = FileHeader::decode(&bytes).unwrap();
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        write_at(&file, header_len, &[0x7F]).unwrap();
        assert_matches!(
            scan_slot(&file, header_len, bytes.len() as u64),
            Ok(Scanned::Corrupt(Error::CorruptRecord { .. }))
        );

        // reading a directory fails with an I/O error, not a corrupt record
        let not_a_file = File::open(dir.path()).unwrap();
        assert_matches!(scan_slot(&not_a_file, 0, 100), Err(Error::Io(_)));
    }

    #[test]
    fn test_organise_moves_record_larger_than_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let set = open_set(&config, None);
        let big: Vec<u32> = (0..40_000).map(|n| n % 1000).collect();
        set.put("dead".into(), vec![1]);
        set.delete(&"dead".to_string());
        set.put("big".into(), big.clone());
        set.put("small".into(), vec![2]);

        let report = set.organise(false).unwrap();
        assert_eq!(report.entries_kept, 2);
        assert_eq!(report.entries_removed, 1);

        drop(set);
        let set = open_set(&config, None);
        assert_eq!(set.get(&"big".to_string()).as_deref(), Some(&big));
        assert_eq!(set.get(&"small".to_string()).as_deref(), Some(&vec![2]));
    }

    #[test]
    fn test_progress_deciles() {
        let mut progress = Progress::new(20);
        let reported: Vec<u64> = (1..=20).filter_map(|n| progress.advance(n)).collect();
        assert_eq!(reported, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(Progress::new(0).advance(5), None);
    }
}
