//! The storage engine.

use std::collections::BTreeSet;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::info;

use crate::config::Config;
use crate::datafile::{self, DataFiles};
use crate::error::{Error, Result};
use crate::hint;
use crate::keydir::{KeyDir, KeyDirEntry, PendingWrites};
use crate::lock::{self, LockGuard, Mode};
use crate::record;

/// An embedded key-value store following the Bitcask design: a
/// log-structured hash table. Writes append records to numbered `.cask`
/// segment files, and an in-memory keydir maps each live key to the
/// position of its most recent value on disk. All live keys must fit in
/// memory, while values may be arbitrarily large. Deletes append a
/// tombstone record; merging rewrites live values from older segments
/// into fresh ones and deletes the originals, reclaiming the space held
/// by superseded and deleted entries. See:
/// https://riak.com/assets/bitcask-intro.pdf
///
/// Cross-process coordination is cooperative. Opening a datastore drops
/// a sentinel file in its directory; a writer excludes every other
/// holder, and readers exclude writers.
///
/// This implementation makes two notable trade-offs:
///
/// - The keydir is persisted only on writer close, as the `keydir.cask`
///   hint file, and segments are never scanned on open. Writes made
///   after the last hint write are therefore lost on the next open if
///   the handle is not closed properly.
///
/// - A handle is single-threaded. Every operation runs to completion on
///   the calling thread, and there is no internal synchronization.
pub struct Bitcask {
    dir: PathBuf,
    config: Config,
    keydir: KeyDir,
    /// Taken on close so the drop path doesn't release twice.
    lock: Option<LockGuard>,
    role: Role,
}

/// Writer-only state. Read-only handles have no active segment and no
/// pending buffer, which makes the mutating paths unrepresentable for
/// them rather than merely rejected.
enum Role {
    Reader,
    Writer { files: DataFiles, pending: PendingWrites },
}

impl Bitcask {
    /// Opens a datastore directory, creating it if missing. The lock
    /// sentinel is acquired in the requested mode before anything is
    /// read, and writers eagerly open a fresh active segment. The keydir
    /// is restored from the hint file when one exists.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        info!("Opening datastore {}", dir.display());
        if !dir.is_dir() {
            DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        }

        let mode = if config.write_permission { Mode::Write } else { Mode::Read };
        let lock = lock::acquire(&dir, mode)?;

        let keydir = hint::read(&dir)?.unwrap_or_default();
        if !keydir.is_empty() {
            info!("Indexed {} live keys in {}", keydir.len(), dir.display());
        }

        let role = if config.write_permission {
            Role::Writer {
                files: DataFiles::create(&dir, config.max_file_size)?,
                pending: PendingWrites::new(),
            }
        } else {
            Role::Reader
        };

        Ok(Self { dir, config, keydir, lock: Some(lock), role })
    }

    /// Returns the value most recently put for `key`. The pending-write
    /// buffer is consulted before the keydir, since buffered entries are
    /// not on disk yet.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::NullKeyOrValue);
        }
        if let Role::Writer { pending, .. } = &self.role {
            if let Some(value) = pending.get(key) {
                return Ok(value.clone());
            }
        }
        let Some(entry) = self.keydir.lookup(key) else {
            return Err(Error::KeyNotExist(String::from_utf8_lossy(key).into_owned()));
        };
        datafile::read_value(&self.dir, entry.file_id, entry.value_pos, entry.value_len)
    }

    /// Stores a value for a key, overwriting any existing value. With
    /// sync-on-put the record is appended immediately and the keydir is
    /// only updated once the append has succeeded; otherwise the write
    /// is staged in the pending buffer, and the buffer is flushed
    /// transparently once it outgrows its bound.
    ///
    /// Keys must round-trip through the whitespace-delimited hint file,
    /// so keys containing whitespace are rejected along with empty keys
    /// and values.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() || value.is_empty() || key.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(Error::NullKeyOrValue);
        }
        let Role::Writer { files, pending } = &mut self.role else {
            return Err(Error::HasNoWritePerms);
        };
        let timestamp = now_secs();
        let value_len = value.len() as u32;

        if self.config.sync_on_put {
            let bytes = record::encode(key, value, timestamp);
            let (file_id, value_pos) = files.append(&bytes, key.len())?;
            self.keydir
                .upsert(key.to_vec(), KeyDirEntry { file_id, value_len, value_pos, timestamp });
            return Ok(());
        }

        // Stage the write and point the keydir at the segment the value
        // will land in on the next flush. Reads consult the pending
        // buffer first, so the provisional position is never read.
        pending.put(key.to_vec(), value.to_vec());
        let provisional =
            KeyDirEntry { file_id: files.active_id(), value_len, value_pos: 0, timestamp };
        let overflow = pending.len() > self.config.max_pending;
        self.keydir.upsert(key.to_vec(), provisional);
        if overflow {
            self.sync()?;
        }
        Ok(())
    }

    /// Removes a key: drops it from the pending buffer and the keydir,
    /// then appends a tombstone record. The tombstone itself is
    /// reclaimed by the next merge.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::NullKeyOrValue);
        }
        let Role::Writer { files, pending } = &mut self.role else {
            return Err(Error::HasNoWritePerms);
        };
        pending.take(key);
        if self.keydir.remove(key).is_none() {
            return Err(Error::KeyNotExist(String::from_utf8_lossy(key).into_owned()));
        }
        let bytes = record::encode(key, record::TOMBSTONE, now_secs());
        files.append(&bytes, key.len())?;
        Ok(())
    }

    /// Flushes the pending buffer, appending a record per staged entry
    /// and repointing the keydir at the real positions. A no-op when the
    /// buffer is already empty.
    pub fn sync(&mut self) -> Result<()> {
        let Role::Writer { files, pending } = &mut self.role else {
            return Err(Error::HasNoWritePerms);
        };
        for (key, value) in pending.drain() {
            let timestamp = now_secs();
            let bytes = record::encode(&key, &value, timestamp);
            let (file_id, value_pos) = files.append(&bytes, key.len())?;
            let value_len = value.len() as u32;
            self.keydir.upsert(key, KeyDirEntry { file_id, value_len, value_pos, timestamp });
        }
        // Don't fsync in tests, to speed them up.
        #[cfg(not(test))]
        files.sync()?;
        Ok(())
    }

    /// Returns every live key in lexicographic order. Pending writes are
    /// flushed first so the keydir alone is authoritative.
    pub fn list_keys(&mut self) -> Result<Vec<Vec<u8>>> {
        if matches!(self.role, Role::Writer { .. }) {
            self.sync()?;
        }
        Ok(self.keydir.keys().cloned().collect())
    }

    /// Folds over every live key/value pair, in unspecified order.
    pub fn fold<B, F>(&self, mut acc: B, mut f: F) -> Result<B>
    where
        F: FnMut(&[u8], &[u8], B) -> B,
    {
        for key in self.keydir.keys() {
            let value = self.get(key)?;
            acc = f(key, &value, acc);
        }
        Ok(acc)
    }

    /// Compacts the datastore. Live entries outside the active segment
    /// are rewritten into fresh merge segments (rotating by the usual
    /// size rule) and the keydir is repointed at them; every other
    /// segment is then deleted. Tombstones and superseded values vanish
    /// with the deleted segments, since only keydir entries are copied.
    pub fn merge(&mut self) -> Result<()> {
        self.sync()?;
        let Role::Writer { files, pending } = &mut self.role else {
            return Err(Error::HasNoWritePerms);
        };
        // The sync above drained the buffer, so compaction only has to
        // look at the keydir.
        debug_assert!(pending.is_empty());
        let active_id = files.active_id();

        let mut merged_ids = Vec::new();
        if self.keydir.iter().any(|(_, entry)| entry.file_id != active_id) {
            let mut output = files.begin_merge()?;
            for (key, entry) in self.keydir.iter_mut() {
                if entry.file_id == active_id {
                    continue;
                }
                let value =
                    datafile::read_value(&self.dir, entry.file_id, entry.value_pos, entry.value_len)?;
                let bytes = record::encode(key, &value, entry.timestamp);
                let (file_id, value_pos) = output.append(&bytes, key.len())?;
                entry.file_id = file_id;
                entry.value_pos = value_pos;
            }
            merged_ids = output.finish();
        }

        let keep: BTreeSet<u64> = merged_ids.iter().copied().chain([active_id]).collect();
        let mut removed = 0;
        for id in datafile::list_segments(&self.dir)? {
            if !keep.contains(&id) {
                fs::remove_file(datafile::segment_path(&self.dir, id))?;
                removed += 1;
            }
        }
        info!(
            "Merged {} into {} segments, removed {removed}",
            self.dir.display(),
            keep.len()
        );
        Ok(())
    }

    /// Closes the datastore. A writer flushes pending writes, merges,
    /// and persists the hint file; every mode releases its lock
    /// sentinel. A read-only close leaves the hint file untouched.
    pub fn close(mut self) -> Result<()> {
        if matches!(self.role, Role::Writer { .. }) {
            self.sync()?;
            self.merge()?;
            hint::write(&self.dir, &self.keydir)?;
        }
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        info!("Closed datastore {}", self.dir.display());
        Ok(())
    }
}

/// Current time as whole seconds since the Unix epoch, truncated to the
/// 32-bit width of the record header.
fn now_secs() -> u32 {
    Utc::now().timestamp().try_into().unwrap_or(u32::MAX)
}
