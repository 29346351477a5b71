//! Datastore configuration.

use std::path::Path;

use crate::bitcask::Bitcask;
use crate::error::Result;

/// Default maximum size of a data segment before rotation (2 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 << 30;

/// Default number of buffered writes held before an automatic flush.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Configuration for a [`Bitcask`] datastore. The named constructors
/// cover the four permission/synchronization combinations, with
/// [`Config::default`] being a read-only handle; the setters adjust the
/// bounds that tests shrink to force rotation and flushing.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) write_permission: bool,
    pub(crate) sync_on_put: bool,
    pub(crate) max_file_size: u64,
    pub(crate) max_pending: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_permission: false,
            sync_on_put: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl Config {
    /// A writable handle that buffers writes until a flush.
    pub fn read_write() -> Self {
        Self { write_permission: true, ..Self::default() }
    }

    /// A read-only handle configured to append on every put.
    pub fn sync() -> Self {
        Self { sync_on_put: true, ..Self::default() }
    }

    /// A writable handle that appends on every put.
    pub fn read_write_sync() -> Self {
        Self { write_permission: true, sync_on_put: true, ..Self::default() }
    }

    /// Opens a datastore at the given path with this configuration.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Bitcask> {
        Bitcask::open(path, self)
    }

    /// Set the maximum segment size before rotation. Default to `2GiB`.
    pub fn max_file_size(&mut self, max_file_size: u64) -> &mut Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Set the number of buffered writes that triggers an automatic
    /// flush. Default to `1024`.
    pub fn max_pending(&mut self, max_pending: usize) -> &mut Self {
        self.max_pending = max_pending;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Config::default() => (false, false); "default")]
    #[test_case(Config::read_write() => (true, false); "read write")]
    #[test_case(Config::sync() => (false, true); "sync")]
    #[test_case(Config::read_write_sync() => (true, true); "read write sync")]
    fn presets(config: Config) -> (bool, bool) {
        (config.write_permission, config.sync_on_put)
    }

    #[test]
    fn setters_override_the_defaults() {
        let config = Config::read_write().max_file_size(1024).max_pending(50).to_owned();
        assert_eq!(config.max_file_size, 1024);
        assert_eq!(config.max_pending, 50);
    }
}
