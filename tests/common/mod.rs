#![allow(dead_code)]

use connguard::{
    AttemptChecker, FileLock, FileRecordStore, InstantSleeper, ManualClock, StorePaths,
    ThrottleConfig,
};
use std::path::Path;

pub type FileChecker = AttemptChecker<FileRecordStore, FileLock>;

/// Checker over `dir` with a manual clock and a lock that never really sleeps.
pub async fn file_checker(dir: &Path, config: ThrottleConfig, clock: &ManualClock) -> FileChecker {
    let paths = StorePaths::in_dir(dir);
    let store = FileRecordStore::open(paths.clone()).await.expect("open record file");
    let lock = FileLock::new(&paths).with_clock(clock.clone()).with_sleeper(InstantSleeper);
    AttemptChecker::new(store, lock, config).with_clock(clock.clone())
}

pub fn record_text(dir: &Path) -> String {
    std::fs::read_to_string(StorePaths::in_dir(dir).record_file()).expect("record file")
}
