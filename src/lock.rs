//! Cooperative cross-process locking via sentinel files.
//!
//! A holder drops an empty sentinel file in the datastore directory:
//! readers create `.readlock<id>`, writers create `.writelock<id>`.
//! Readers coexist with other readers; a writer excludes every other
//! holder. The suffix keeps concurrent reader sentinels distinct.
//!
//! This protects against cooperating processes only. A holder that
//! crashes leaves its sentinel behind, and the directory stays locked
//! until the stale sentinel is removed by hand.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::error;

use crate::error::{Error, Result};

const READ_LOCK_PREFIX: &str = ".readlock";
const WRITE_LOCK_PREFIX: &str = ".writelock";

/// The access mode a sentinel asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// A held sentinel. Releasing (or dropping) the guard removes the
/// sentinel file from the directory.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

/// Scans `dir` for conflicting sentinels and creates one for the
/// requested mode, failing with `Locked` on a conflict.
pub fn acquire(dir: &Path, mode: Mode) -> Result<LockGuard> {
    let mut readers = false;
    let mut writers = false;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        readers |= name.starts_with(READ_LOCK_PREFIX);
        writers |= name.starts_with(WRITE_LOCK_PREFIX);
    }
    match mode {
        Mode::Read if writers => return Err(Error::Locked),
        Mode::Write if readers || writers => return Err(Error::Locked),
        _ => {}
    }

    let prefix = match mode {
        Mode::Read => READ_LOCK_PREFIX,
        Mode::Write => WRITE_LOCK_PREFIX,
    };
    let mut stamp = Utc::now().timestamp_micros().max(0) as u64;
    loop {
        let path = dir.join(format!("{prefix}{stamp}"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(LockGuard { path, released: false }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

impl LockGuard {
    /// Removes the sentinel file, unlocking the directory for this
    /// holder.
    pub fn release(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Removes the sentinel when the guard is dropped without an explicit
/// release.
impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            error!("failed to remove lock sentinel {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(None, Mode::Read => true; "read an unlocked directory")]
    #[test_case(None, Mode::Write => true; "write an unlocked directory")]
    #[test_case(Some(Mode::Read), Mode::Read => true; "readers coexist")]
    #[test_case(Some(Mode::Read), Mode::Write => false; "reader excludes writer")]
    #[test_case(Some(Mode::Write), Mode::Read => false; "writer excludes reader")]
    #[test_case(Some(Mode::Write), Mode::Write => false; "writer excludes writer")]
    fn compatibility(held: Option<Mode>, requested: Mode) -> bool {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        let _held = held.map(|mode| acquire(dir.path(), mode).unwrap());
        acquire(dir.path(), requested).is_ok()
    }

    #[test]
    fn release_unlocks_the_directory() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        let guard = acquire(dir.path(), Mode::Write).unwrap();
        assert!(matches!(acquire(dir.path(), Mode::Write), Err(Error::Locked)));

        guard.release().unwrap();
        assert!(acquire(dir.path(), Mode::Write).is_ok());
    }

    #[test]
    fn drop_removes_the_sentinel() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        drop(acquire(dir.path(), Mode::Read).unwrap());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn concurrent_readers_get_distinct_sentinels() {
        let dir = tempfile::TempDir::with_prefix("caskdb").unwrap();
        let _first = acquire(dir.path(), Mode::Read).unwrap();
        let _second = acquire(dir.path(), Mode::Read).unwrap();
        let _third = acquire(dir.path(), Mode::Read).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }
}
