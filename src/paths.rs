//! Locations of the record file and its lock marker.

use std::path::{Path, PathBuf};

/// Record file name inside a data directory.
pub const RECORD_FILE: &str = "connection_control";
/// Lock marker file name inside a data directory.
pub const LOCK_FILE: &str = "connection_control.lock";

/// Explicit context passed to the store and the lock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    record_file: PathBuf,
    lock_file: PathBuf,
}

impl StorePaths {
    pub fn new(record_file: impl Into<PathBuf>, lock_file: impl Into<PathBuf>) -> Self {
        Self { record_file: record_file.into(), lock_file: lock_file.into() }
    }

    /// Standard file names under `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self::new(dir.join(RECORD_FILE), dir.join(LOCK_FILE))
    }

    pub fn record_file(&self) -> &Path {
        &self.record_file
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Scratch file used for atomic rewrites of the record file.
    pub fn rewrite_scratch(&self) -> PathBuf {
        let mut name = self.record_file.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_dir_uses_standard_names() {
        let paths = StorePaths::in_dir("/var/lib/db");
        assert_eq!(paths.record_file(), Path::new("/var/lib/db/connection_control"));
        assert_eq!(paths.lock_file(), Path::new("/var/lib/db/connection_control.lock"));
        assert_eq!(paths.rewrite_scratch(), PathBuf::from("/var/lib/db/connection_control.tmp"));
    }
}
